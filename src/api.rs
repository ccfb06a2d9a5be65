//! HTTP surface: shared app state and the auxiliary endpoints.
//!
//! `/health` reports liveness of the aggregator writer, `/ready` flips once
//! the first snapshot refresh pass has run, `/debug` exposes versions and
//! counters for operators, `/metrics` renders the prometheus exposition.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::models::CategoryVersions;
use crate::session::SessionRegistry;

/// Application state shared across handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub aggregator: Arc<Aggregator>,
    pub sessions: Arc<SessionRegistry>,
    pub ready: watch::Receiver<bool>,
    pub prometheus: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Response {
    if state.aggregator.is_alive() {
        Json(HealthResponse { status: "ok" }).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "degraded" }),
        )
            .into_response()
    }
}

pub async fn ready(State(state): State<AppState>) -> Response {
    if *state.ready.borrow() {
        Json(HealthResponse { status: "ok" }).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "waiting_for_initial_snapshot",
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct DebugResponse {
    pub clients: usize,
    pub version: u64,
    pub category_versions: CategoryVersions,
    pub bytes_sent: u64,
}

pub async fn debug_state(State(state): State<AppState>) -> Json<DebugResponse> {
    Json(DebugResponse {
        clients: state.sessions.client_count(),
        version: state.aggregator.version(),
        category_versions: state.aggregator.category_versions(),
        bytes_sent: state.sessions.bytes_sent(),
    })
}

pub async fn metrics_text(State(state): State<AppState>) -> String {
    state.prometheus.render()
}
