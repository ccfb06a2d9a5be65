//! Event ingestor.
//!
//! One task per producer channel: subscribe through the host's broker
//! capability, parse payloads into typed deltas, hand them to the
//! aggregator. Within a channel broker-delivery order is preserved end to
//! end; across channels nothing is guaranteed. Lost subscriptions reconnect
//! forever with exponential backoff and jitter.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::metrics::{BROKER_RECONNECTS_TOTAL, MALFORMED_PAYLOADS_TOTAL};
use crate::models::{
    Account, MarketQuote, Order, OrderBook, Position, PriceLevel, StateDelta, StrategyStatus,
};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Host capability: channel-subscribe on the broker. The returned receiver
/// yields raw payloads until the subscription is lost, then ends.
#[async_trait]
pub trait BrokerSubscriber: Send + Sync + 'static {
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>>;
}

/// WebSocket-backed broker subscriber. Each channel gets its own
/// connection; the broker is expected to stream one payload per frame.
pub struct WsBrokerSubscriber {
    url: String,
}

impl WsBrokerSubscriber {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerSubscriber for WsBrokerSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let url = format!("{}?channel={}", self.url, channel);
        let (mut ws, _resp) = connect_async(url.as_str())
            .await
            .with_context(|| format!("broker connect for channel {channel}"))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if tx.send(text.into_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(channel, ?frame, "broker channel closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(channel, error = %e, "broker channel error");
                        break;
                    }
                }
            }
            // Dropping tx ends the subscription stream.
        });

        Ok(rx)
    }
}

/// Which producer category a channel feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    MarketData(String),
    OrderBook(String),
    Trades(String),
    Orders,
    Positions,
    Account,
    Strategies,
}

/// Map a channel name onto its payload category. `None` means the channel
/// is not part of the recognised contract.
pub fn classify(channel: &str) -> Option<ChannelKind> {
    if let Some(sym) = channel.strip_prefix("market_data:") {
        return Some(ChannelKind::MarketData(sym.to_ascii_uppercase()));
    }
    if let Some(sym) = channel.strip_prefix("orderbook:") {
        return Some(ChannelKind::OrderBook(sym.to_ascii_uppercase()));
    }
    if let Some(sym) = channel.strip_prefix("trades:") {
        return Some(ChannelKind::Trades(sym.to_ascii_uppercase()));
    }
    if channel == "orders" || channel.starts_with("orders.") {
        return Some(ChannelKind::Orders);
    }
    if channel == "positions" || channel.starts_with("positions.") {
        return Some(ChannelKind::Positions);
    }
    if channel == "account" || channel.starts_with("account.") {
        return Some(ChannelKind::Account);
    }
    if channel == "strategies" || channel.starts_with("strategies.") {
        return Some(ChannelKind::Strategies);
    }
    None
}

#[derive(Debug, Deserialize)]
struct QuotePayload {
    #[serde(default)]
    symbol: Option<String>,
    last: f64,
    bid: f64,
    ask: f64,
    #[serde(default)]
    bid_size: f64,
    #[serde(default)]
    ask_size: f64,
    #[serde(default)]
    high_24h: f64,
    #[serde(default)]
    low_24h: f64,
    #[serde(default)]
    volume_24h: f64,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct BookPayload {
    #[serde(default)]
    symbol: Option<String>,
    /// Absent on full-book snapshots.
    #[serde(default)]
    first_update_id: Option<u64>,
    last_update_id: u64,
    #[serde(default)]
    bids: Vec<[f64; 2]>,
    #[serde(default)]
    asks: Vec<[f64; 2]>,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct TradePayload {
    #[serde(default)]
    symbol: Option<String>,
    price: f64,
    quantity: f64,
    timestamp: i64,
}

fn levels(raw: Vec<[f64; 2]>) -> Vec<PriceLevel> {
    raw.into_iter()
        .map(|[price, size]| PriceLevel { price, size })
        .collect()
}

/// Parse one broker payload for a classified channel into a state delta.
pub fn parse_payload(kind: &ChannelKind, bytes: &[u8]) -> Result<StateDelta> {
    match kind {
        ChannelKind::MarketData(channel_sym) => {
            let p: QuotePayload = serde_json::from_slice(bytes)?;
            let symbol = p.symbol.unwrap_or_else(|| channel_sym.clone());
            Ok(StateDelta::MarketQuoteUpdate {
                symbol: symbol.clone(),
                quote: MarketQuote {
                    symbol,
                    last: p.last,
                    bid: p.bid,
                    ask: p.ask,
                    bid_size: p.bid_size,
                    ask_size: p.ask_size,
                    high_24h: p.high_24h,
                    low_24h: p.low_24h,
                    volume_24h: p.volume_24h,
                    updated_at: p.timestamp,
                },
            })
        }
        ChannelKind::OrderBook(channel_sym) => {
            let p: BookPayload = serde_json::from_slice(bytes)?;
            let symbol = p.symbol.unwrap_or_else(|| channel_sym.clone());
            match p.first_update_id {
                Some(first_id) => Ok(StateDelta::OrderBookDelta {
                    symbol,
                    first_id,
                    last_id: p.last_update_id,
                    bid_changes: levels(p.bids),
                    ask_changes: levels(p.asks),
                    timestamp: p.timestamp,
                }),
                None => Ok(StateDelta::OrderBookReset {
                    snapshot: OrderBook {
                        symbol,
                        last_update_id: p.last_update_id,
                        bids: levels(p.bids),
                        asks: levels(p.asks),
                        updated_at: p.timestamp,
                    },
                }),
            }
        }
        ChannelKind::Trades(channel_sym) => {
            let p: TradePayload = serde_json::from_slice(bytes)?;
            Ok(StateDelta::TradeUpdate {
                symbol: p.symbol.unwrap_or_else(|| channel_sym.clone()),
                price: p.price,
                quantity: p.quantity,
                timestamp: p.timestamp,
            })
        }
        ChannelKind::Orders => {
            let order: Order = serde_json::from_slice(bytes)?;
            Ok(StateDelta::OrderUpdate(order))
        }
        ChannelKind::Positions => {
            let position: Position = serde_json::from_slice(bytes)?;
            Ok(StateDelta::PositionUpdate {
                symbol: position.symbol.clone(),
                position,
            })
        }
        ChannelKind::Account => {
            let account: Account = serde_json::from_slice(bytes)?;
            Ok(StateDelta::AccountUpdate(account))
        }
        ChannelKind::Strategies => {
            let status: StrategyStatus = serde_json::from_slice(bytes)?;
            Ok(StateDelta::StrategyUpdate(status))
        }
    }
}

/// Spawn one ingestor task per channel. Tasks run until shutdown.
pub fn spawn_ingestors(
    subscriber: Arc<dyn BrokerSubscriber>,
    channels: Vec<String>,
    aggregator: Arc<Aggregator>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    channels
        .into_iter()
        .filter_map(|channel| {
            let Some(kind) = classify(&channel) else {
                warn!(channel, "unrecognised channel, not subscribing");
                return None;
            };
            let subscriber = subscriber.clone();
            let aggregator = aggregator.clone();
            let shutdown = shutdown.clone();
            Some(tokio::spawn(run_channel(
                subscriber, channel, kind, aggregator, shutdown,
            )))
        })
        .collect()
}

async fn run_channel(
    subscriber: Arc<dyn BrokerSubscriber>,
    channel: String,
    kind: ChannelKind,
    aggregator: Arc<Aggregator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    let mut first_attempt = true;

    loop {
        if *shutdown.borrow() {
            return;
        }

        if !first_attempt {
            counter!(BROKER_RECONNECTS_TOTAL, 1);
            let delay = jittered(backoff);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
        first_attempt = false;

        let mut rx = match subscriber.subscribe(&channel).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(channel, error = %e, "broker subscribe failed");
                continue;
            }
        };
        info!(channel, "subscribed");
        backoff = BACKOFF_INITIAL;

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(payload) => {
                        handle_payload(&channel, &kind, &payload, &aggregator).await;
                    }
                    None => {
                        warn!(channel, "subscription lost, reconnecting");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_payload(
    channel: &str,
    kind: &ChannelKind,
    payload: &[u8],
    aggregator: &Aggregator,
) {
    match parse_payload(kind, payload) {
        Ok(delta) => {
            if !aggregator.submit(delta).await {
                debug!(channel, "aggregator gone, dropping delta");
            }
        }
        Err(e) => {
            counter!(MALFORMED_PAYLOADS_TOTAL, 1, "channel" => channel.to_string());
            let preview: String = String::from_utf8_lossy(payload).chars().take(120).collect();
            warn!(channel, error = %e, payload = %preview, "malformed payload dropped");
        }
    }
}

fn jittered(base: Duration) -> Duration {
    // ±20% so a broker restart does not get a synchronised stampede.
    let factor = 0.8 + rand::random::<f64>() * 0.4;
    base.mul_f64(factor)
}
