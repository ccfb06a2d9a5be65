//! Snapshot refresher.
//!
//! Periodically pulls authoritative snapshots (orders, account, strategies)
//! from the backend services and overwrites the corresponding categories.
//! This fills in whatever pub/sub missed across restarts or subscription
//! gaps. Market data and order books are deliberately not refreshed here;
//! they are delta-only through the ingestor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::metrics::SNAPSHOT_PULL_FAILURES_TOTAL;
use crate::models::{Account, Order, StateDelta, StrategyStatus};

const PULL_DEADLINE: Duration = Duration::from_secs(5);

/// Host capability: pull the current full record for a category, with a
/// deadline.
#[async_trait]
pub trait SnapshotPuller: Send + Sync + 'static {
    async fn pull_orders(&self) -> Result<Vec<Order>>;
    async fn pull_account(&self) -> Result<Account>;
    async fn pull_strategies(&self) -> Result<Vec<StrategyStatus>>;
}

/// REST-backed puller against the configured backend services.
pub struct HttpSnapshotPuller {
    client: reqwest::Client,
    orders_url: String,
    account_url: String,
    strategies_url: String,
}

impl HttpSnapshotPuller {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PULL_DEADLINE)
            .build()
            .context("failed to build snapshot pull client")?;
        Ok(Self {
            client,
            orders_url: format!("{}/orders", cfg.orders_service_url.trim_end_matches('/')),
            account_url: format!("{}/account", cfg.account_service_url.trim_end_matches('/')),
            strategies_url: format!(
                "{}/strategies",
                cfg.strategies_service_url.trim_end_matches('/')
            ),
        })
    }
}

#[async_trait]
impl SnapshotPuller for HttpSnapshotPuller {
    async fn pull_orders(&self) -> Result<Vec<Order>> {
        let resp = self.client.get(&self.orders_url).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn pull_account(&self) -> Result<Account> {
        let resp = self.client.get(&self.account_url).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn pull_strategies(&self) -> Result<Vec<StrategyStatus>> {
        let resp = self.client.get(&self.strategies_url).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }
}

/// Spawn the refresher. `ready_tx` flips to true once the first full pass
/// has run; `/ready` serves 503 until then.
pub fn spawn_refresher(
    puller: Arc<dyn SnapshotPuller>,
    aggregator: Arc<Aggregator>,
    refresh_interval: Duration,
    ready_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        refresh_pass(&*puller, &aggregator).await;
        let _ = ready_tx.send(true);
        info!("initial snapshot refresh complete, service ready");

        let mut ticker = interval(refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval fires immediately once; skip that first tick since we
        // just completed the initial pass.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    refresh_pass(&*puller, &aggregator).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

/// One refresh pass. Each category pulls independently; a failure keeps the
/// previous state and retries next tick.
async fn refresh_pass(puller: &dyn SnapshotPuller, aggregator: &Aggregator) {
    match puller.pull_orders().await {
        Ok(orders) => {
            aggregator.submit(StateDelta::OrdersReplace(orders)).await;
        }
        Err(e) => {
            counter!(SNAPSHOT_PULL_FAILURES_TOTAL, 1, "category" => "orders");
            warn!(error = %e, "orders snapshot pull failed");
        }
    }

    match puller.pull_account().await {
        Ok(account) => {
            aggregator.submit(StateDelta::AccountUpdate(account)).await;
        }
        Err(e) => {
            counter!(SNAPSHOT_PULL_FAILURES_TOTAL, 1, "category" => "account");
            warn!(error = %e, "account snapshot pull failed");
        }
    }

    match puller.pull_strategies().await {
        Ok(strategies) => {
            aggregator
                .submit(StateDelta::StrategiesReplace(strategies))
                .await;
        }
        Err(e) => {
            counter!(SNAPSHOT_PULL_FAILURES_TOTAL, 1, "category" => "strategies");
            warn!(error = %e, "strategies snapshot pull failed");
        }
    }
}
