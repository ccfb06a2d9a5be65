//! Service configuration.
//!
//! Everything comes from the environment with sane defaults, the same way
//! the rest of our backends are configured. `.env` files are honored at
//! startup. YAML parsing and TLS termination live outside this process.

use std::env;
use std::time::Duration;

use anyhow::{bail, Result};

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    /// host:port for the HTTP/WS server.
    pub listen: String,
    /// Broadcast cadence for `type=web` clients.
    pub web_interval: Duration,
    /// Broadcast cadence for `type=tui` clients.
    pub tui_interval: Duration,
    /// Server-initiated ping cadence.
    pub ping_interval: Duration,
    /// Close the session when nothing (pong included) arrives for this long.
    pub read_timeout: Duration,
    /// Deadline for a single outbound socket write.
    pub write_timeout: Duration,
    /// Grace window for the initial subscribe after upgrade.
    pub handshake_grace: Duration,
    /// Origin whitelist. A lone `*` allows everything; `*` mixed with
    /// concrete origins is a startup error.
    pub allowed_origins: Vec<String>,
    /// Max orders retained in state; eviction is by `created_at`.
    pub order_retention: usize,
    /// Max price levels per book side retained and emitted.
    pub order_book_depth: usize,
    /// Snapshot refresher tick.
    pub snapshot_refresh_interval: Duration,
    /// Per-client send queue bound; ticks are skipped at this depth.
    pub send_queue_depth: usize,
    /// Consecutive skipped ticks before a slow consumer is disconnected.
    pub slow_consumer_max_skips: u32,
    /// Drain window on termination.
    pub shutdown_timeout: Duration,
    /// Broker WebSocket endpoint for channel subscriptions.
    pub broker_ws_url: String,
    /// Snapshot puller endpoints.
    pub orders_service_url: String,
    pub account_service_url: String,
    pub strategies_service_url: String,
    /// Symbols to subscribe market_data/orderbook/trades channels for.
    pub symbols: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            web_interval: Duration::from_millis(100),
            tui_interval: Duration::from_millis(250),
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            handshake_grace: Duration::from_secs(10),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            order_retention: 200,
            order_book_depth: 20,
            snapshot_refresh_interval: Duration::from_secs(30),
            send_queue_depth: 64,
            slow_consumer_max_skips: 200,
            shutdown_timeout: Duration::from_secs(30),
            broker_ws_url: "ws://127.0.0.1:6380/sub".to_string(),
            orders_service_url: "http://127.0.0.1:8081".to_string(),
            account_service_url: "http://127.0.0.1:8082".to_string(),
            strategies_service_url: "http://127.0.0.1:8083".to_string(),
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
                "XRPUSDT".to_string(),
            ],
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let cfg = Self {
            listen: env_string("LISTEN_ADDR", &defaults.listen),
            web_interval: Duration::from_millis(env_u64("WEB_INTERVAL_MS", 100)),
            tui_interval: Duration::from_millis(env_u64("TUI_INTERVAL_MS", 250)),
            ping_interval: Duration::from_secs(env_u64("PING_INTERVAL_SECS", 30)),
            read_timeout: Duration::from_secs(env_u64("READ_TIMEOUT_SECS", 60)),
            write_timeout: Duration::from_secs(env_u64("WRITE_TIMEOUT_SECS", 10)),
            handshake_grace: Duration::from_secs(env_u64("HANDSHAKE_GRACE_SECS", 10)),
            allowed_origins: env_list("ALLOWED_ORIGINS", "http://localhost:3000"),
            order_retention: env_usize("ORDER_RETENTION", 200),
            order_book_depth: env_usize("ORDER_BOOK_DEPTH", 20),
            snapshot_refresh_interval: Duration::from_secs(env_u64(
                "SNAPSHOT_REFRESH_SECS",
                30,
            )),
            send_queue_depth: env_usize("SEND_QUEUE_DEPTH", 64),
            slow_consumer_max_skips: env_u64("SLOW_CONSUMER_MAX_SKIPS", 200) as u32,
            shutdown_timeout: Duration::from_secs(env_u64("SHUTDOWN_TIMEOUT_SECS", 30)),
            broker_ws_url: env_string("BROKER_WS_URL", &defaults.broker_ws_url),
            orders_service_url: env_string("ORDERS_SERVICE_URL", &defaults.orders_service_url),
            account_service_url: env_string(
                "ACCOUNT_SERVICE_URL",
                &defaults.account_service_url,
            ),
            strategies_service_url: env_string(
                "STRATEGIES_SERVICE_URL",
                &defaults.strategies_service_url,
            ),
            symbols: env_list("SYMBOLS", "BTCUSDT,ETHUSDT,SOLUSDT,XRPUSDT")
                .into_iter()
                .map(|s| s.to_ascii_uppercase())
                .collect(),
        };

        validate_origins(&cfg.allowed_origins)?;
        Ok(cfg)
    }

    /// Producer channels derived from the symbol list.
    pub fn broker_channels(&self) -> Vec<String> {
        let mut channels = Vec::with_capacity(self.symbols.len() * 3 + 4);
        for sym in &self.symbols {
            channels.push(format!("market_data:{sym}"));
            channels.push(format!("orderbook:{sym}"));
            channels.push(format!("trades:{sym}"));
        }
        channels.push("orders.updates".to_string());
        channels.push("positions.updates".to_string());
        channels.push("account.updates".to_string());
        channels.push("strategies.updates".to_string());
        channels
    }
}

pub fn validate_origins(origins: &[String]) -> Result<()> {
    if origins.is_empty() {
        bail!("ALLOWED_ORIGINS must list at least one origin (or a lone '*')");
    }
    if origins.iter().any(|o| o == "*") && origins.len() > 1 {
        bail!("ALLOWED_ORIGINS: '*' cannot be combined with concrete origins");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.web_interval, Duration::from_millis(100));
        assert_eq!(cfg.tui_interval, Duration::from_millis(250));
        assert_eq!(cfg.order_retention, 200);
        assert_eq!(cfg.send_queue_depth, 64);
        assert_eq!(cfg.slow_consumer_max_skips, 200);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn wildcard_origin_must_be_alone() {
        assert!(validate_origins(&["*".to_string()]).is_ok());
        assert!(validate_origins(&[
            "*".to_string(),
            "https://deck.example.com".to_string()
        ])
        .is_err());
        assert!(validate_origins(&[]).is_err());
    }

    #[test]
    fn channels_cover_all_categories() {
        let cfg = Config::default();
        let channels = cfg.broker_channels();
        assert!(channels.contains(&"market_data:BTCUSDT".to_string()));
        assert!(channels.contains(&"orderbook:ETHUSDT".to_string()));
        assert!(channels.contains(&"trades:SOLUSDT".to_string()));
        assert!(channels.contains(&"orders.updates".to_string()));
        assert!(channels.contains(&"account.updates".to_string()));
        assert!(channels.contains(&"strategies.updates".to_string()));
    }
}
