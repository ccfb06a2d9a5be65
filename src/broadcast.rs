//! Differential broadcaster.
//!
//! One ticker per connected client. Each tick takes a consistent snapshot
//! restricted to the client's subscriptions, compares it against the last
//! payload the client was sent, and enqueues either a full snapshot frame or
//! a diff. Baselines advance only after a successful enqueue, so a client
//! that misses a frame is re-diffed from what it actually has.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::diff::{diff_payload, view_payload};
use crate::metrics::SLOW_CONSUMER_DISCONNECTS_TOTAL;
use crate::models::{Category, CategorySet, StateView};
use crate::protocol::ServerFrame;
use crate::session::{CloseReason, SessionCloser};

/// Cadence profiles negotiated at handshake via `type=web|tui`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProfile {
    Web,
    Tui,
}

impl ClientProfile {
    pub fn from_query(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("web") => Some(ClientProfile::Web),
            Some("tui") => Some(ClientProfile::Tui),
            Some(_) => None,
        }
    }

    pub fn cadence(&self, web_interval: Duration, tui_interval: Duration) -> Duration {
        match self {
            ClientProfile::Web => web_interval,
            ClientProfile::Tui => tui_interval,
        }
    }
}

struct Baseline {
    payload: Map<String, Value>,
    version: u64,
}

/// One tick's output: the frame to enqueue plus the baseline to commit if
/// the enqueue succeeds.
pub struct Tick {
    pub frame: ServerFrame,
    payload: Map<String, Value>,
    version: u64,
}

/// Per-client diff state. Owned by the client's ticker task; never shared.
#[derive(Default)]
pub struct DiffStream {
    baseline: Option<Baseline>,
}

impl DiffStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what (if anything) this tick should send.
    ///
    /// The first emission is always a full snapshot, as is the tick after a
    /// category joins the subscription set. Otherwise an unchanged version
    /// or an empty diff emits nothing.
    pub fn evaluate(&mut self, view: &StateView, subs: CategorySet) -> Option<Tick> {
        if let Some(b) = &mut self.baseline {
            // A category that left the subscription set loses its baseline
            // immediately; if it comes back it gets a fresh snapshot.
            b.payload
                .retain(|k, _| Category::from_str(k).is_some_and(|c| subs.contains(c)));
        }

        let payload = view_payload(view);

        let needs_snapshot = match &self.baseline {
            None => true,
            Some(b) => subs.iter().any(|c| !b.payload.contains_key(c.as_str())),
        };

        if needs_snapshot {
            return Some(Tick {
                frame: ServerFrame::StateUpdate {
                    version: view.version,
                    timestamp: Utc::now().to_rfc3339(),
                    data: payload.clone(),
                },
                payload,
                version: view.version,
            });
        }

        let baseline = self.baseline.as_ref().expect("baseline present");
        if view.version == baseline.version {
            return None;
        }

        let changes = diff_payload(&baseline.payload, &payload);
        if changes.is_empty() {
            return None;
        }

        Some(Tick {
            frame: ServerFrame::DiffUpdate {
                version: view.version,
                timestamp: Utc::now().to_rfc3339(),
                changes,
            },
            payload,
            version: view.version,
        })
    }

    /// Advance the baseline; call only after the frame was accepted onto
    /// the session write path.
    pub fn commit(&mut self, tick: Tick) {
        self.baseline = Some(Baseline {
            payload: tick.payload,
            version: tick.version,
        });
    }

    pub fn baseline_version(&self) -> Option<u64> {
        self.baseline.as_ref().map(|b| b.version)
    }
}

/// Drive one client's ticks until the session closes.
///
/// Backpressure contract: when the send queue is at or beyond the
/// configured depth the tick is skipped without touching the baseline;
/// `max_skips` consecutive skips disconnect the client as a slow consumer.
pub async fn run_client_ticker(
    aggregator: Arc<Aggregator>,
    subscriptions: Arc<AtomicU8>,
    out: mpsc::Sender<ServerFrame>,
    cadence: Duration,
    queue_depth_limit: usize,
    max_skips: u32,
    closer: SessionCloser,
) {
    let mut ticker = interval(cadence);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut stream = DiffStream::new();
    let mut skips: u32 = 0;
    let mut closed = closer.subscribe();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = closed.changed() => {
                if closed.borrow().is_some() {
                    return;
                }
            }
        }

        // Lock-free depth probe on the session write path.
        let depth = queue_depth_limit.saturating_sub(out.capacity());
        if depth >= queue_depth_limit {
            skips += 1;
            if skips >= max_skips {
                counter!(SLOW_CONSUMER_DISCONNECTS_TOTAL, 1);
                info!(skips, "client cannot drain its queue, disconnecting");
                closer.close(CloseReason::SlowConsumer);
                return;
            }
            continue;
        }
        skips = 0;

        let subs = CategorySet::from_bits(subscriptions.load(Ordering::Acquire));
        let view = aggregator.snapshot(subs);

        let Some(tick) = stream.evaluate(&view, subs) else {
            continue;
        };

        match out.try_send(tick.frame.clone()) {
            Ok(()) => stream.commit(tick),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Queue filled between the probe and the send; counts as a
                // skipped tick.
                skips += 1;
                debug!("send queue filled mid-tick, baseline not advanced");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}
