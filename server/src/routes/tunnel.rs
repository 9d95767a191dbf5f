//! Display target reachability.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Query parameters for `GET /api/tunnel/probe`; both default to `[tunnel]`.
#[derive(Deserialize)]
pub struct ProbeQuery {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// `GET /api/tunnel/probe` — whether a TCP connection to the target succeeds
/// from this server.
pub async fn probe(State(state): State<AppState>, Query(q): Query<ProbeQuery>) -> Json<Value> {
    let defaults = &state.config.tunnel;
    let host = q.host.unwrap_or_else(|| defaults.default_host.clone());
    let port = q.port.unwrap_or(defaults.default_port);
    let reachable = crate::tunnel::probe(&host, port, PROBE_TIMEOUT).await;
    Json(json!({"host": host, "port": port, "reachable": reachable}))
}
