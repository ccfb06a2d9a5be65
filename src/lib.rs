//! TradeDeck Backend Library
//!
//! Real-time state-aggregation and fan-out hub: ingests producer event
//! streams, keeps one versioned unified state, and pushes differential
//! updates to dashboard clients over WebSocket.

pub mod aggregator;
pub mod api;
pub mod broadcast;
pub mod config;
pub mod diff;
pub mod ingest;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod protocol;
pub mod refresher;
pub mod session;

pub use aggregator::Aggregator;
pub use api::AppState;
pub use config::Config;
pub use models::{CategorySet, StateDelta, UnifiedState};
