//! TradeDeck - real-time dashboard hub
//!
//! Aggregates producer event streams (market data, orders, positions,
//! account, strategies) into one versioned state and fans out differential
//! updates to web and terminal dashboards over WebSocket.

use anyhow::{Context, Result};
use axum::{middleware as axum_mw, routing::get, Router};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradedeck_backend::{
    aggregator::Aggregator,
    api,
    config::Config,
    ingest::{spawn_ingestors, WsBrokerSubscriber},
    metrics as metric_names,
    middleware::logging::request_logging,
    refresher::{spawn_refresher, HttpSnapshotPuller},
    session::{ws_handler, SessionRegistry},
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    info!("🚀 TradeDeck hub starting");

    let config = Arc::new(Config::from_env().context("invalid configuration")?);
    let prometheus = metric_names::install()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Single-writer aggregator; everything else talks to it through the
    // delta channel or snapshot reads.
    let (aggregator, aggregator_handle) = Aggregator::spawn(
        config.order_retention,
        config.order_book_depth,
        shutdown_rx.clone(),
    );

    // One ingestor task per producer channel.
    let subscriber = Arc::new(WsBrokerSubscriber::new(config.broker_ws_url.clone()));
    let channels = config.broker_channels();
    info!(channels = channels.len(), "spawning broker ingestors");
    let _ingestors = spawn_ingestors(
        subscriber,
        channels,
        aggregator.clone(),
        shutdown_rx.clone(),
    );

    // Snapshot refresher gates readiness on its first pass.
    let puller = Arc::new(HttpSnapshotPuller::new(&config)?);
    let (ready_tx, ready_rx) = watch::channel(false);
    let _refresher = spawn_refresher(
        puller,
        aggregator.clone(),
        config.snapshot_refresh_interval,
        ready_tx,
        shutdown_rx.clone(),
    );

    let sessions = SessionRegistry::new();

    let app_state = api::AppState {
        config: config.clone(),
        aggregator: aggregator.clone(),
        sessions: sessions.clone(),
        ready: ready_rx,
        prometheus,
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health))
        .route("/ready", get(api::ready))
        .route("/debug", get(api::debug_state))
        .route("/metrics", get(api::metrics_text))
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging))
        .with_state(app_state);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("🎯 listening on {}", config.listen);

    let shutdown_sessions = sessions.clone();
    let signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining");
        // Stop accepting upgrades, tell every client, stop the pipeline.
        shutdown_sessions.begin_shutdown();
        let _ = shutdown_tx.send(true);
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .context("server error")?;

    if !sessions.drain(config.shutdown_timeout).await {
        warn!(
            remaining = sessions.client_count(),
            "drain window elapsed, force-closing remaining sessions"
        );
    }

    // The writer exits only once its delta channel is empty.
    let _ = tokio::time::timeout(config.shutdown_timeout, aggregator_handle).await;

    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradedeck_backend=debug,tradedeck=debug,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
