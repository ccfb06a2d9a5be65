//! Metric names and the prometheus exposition recorder.
//!
//! Counters are emitted where the events happen; this module pins the names
//! so `/metrics` output stays stable.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CLIENTS_CONNECTED: &str = "clients_connected";
pub const BROADCASTS_SENT_TOTAL: &str = "broadcasts_sent_total";
pub const DIFF_BYTES: &str = "diff_bytes";
pub const BROKER_RECONNECTS_TOTAL: &str = "broker_reconnects_total";
pub const SEQUENCE_GAPS_TOTAL: &str = "sequence_gaps_total";
pub const SLOW_CONSUMER_DISCONNECTS_TOTAL: &str = "slow_consumer_disconnects_total";
pub const MALFORMED_PAYLOADS_TOTAL: &str = "malformed_payloads_total";
pub const WRITE_ERRORS_TOTAL: &str = "write_errors_total";
pub const SNAPSHOT_PULL_FAILURES_TOTAL: &str = "snapshot_pull_failures_total";

/// Install the prometheus recorder and describe every metric we emit.
/// The returned handle renders the exposition text for `GET /metrics`.
pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    describe_gauge!(CLIENTS_CONNECTED, "Connected WebSocket clients");
    describe_counter!(
        BROADCASTS_SENT_TOTAL,
        "State frames sent to clients, labelled by frame type"
    );
    describe_histogram!(DIFF_BYTES, Unit::Bytes, "Encoded size of outbound diff frames");
    describe_counter!(
        BROKER_RECONNECTS_TOTAL,
        "Broker channel reconnect attempts"
    );
    describe_counter!(
        SEQUENCE_GAPS_TOTAL,
        "Order-book sequence gaps, labelled by symbol"
    );
    describe_counter!(
        SLOW_CONSUMER_DISCONNECTS_TOTAL,
        "Clients disconnected for not draining their send queue"
    );
    describe_counter!(
        MALFORMED_PAYLOADS_TOTAL,
        "Broker payloads that failed to parse, labelled by channel"
    );
    describe_counter!(WRITE_ERRORS_TOTAL, "Client socket write failures");
    describe_counter!(
        SNAPSHOT_PULL_FAILURES_TOTAL,
        "Snapshot refresher pull failures, labelled by category"
    );

    Ok(handle)
}
