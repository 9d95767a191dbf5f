//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::util::format_uptime;
use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version and the number of live sessions. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.registry.session_count().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "uptime": format_uptime(uptime),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
    }))
}
