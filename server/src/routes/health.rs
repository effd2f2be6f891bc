//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::protocol::PROTOCOL_VERSION;
use crate::state::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version and the number of connected agents. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let agents = state.registry().len().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "agents": agents,
    }))
}
