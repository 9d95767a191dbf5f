//! Host diagnostics endpoints.
//!
//! - `GET /api/diagnostics/snapshot` — run one batched probe, return it with history
//! - `GET /api/diagnostics/history`  — stored history only, no remote call

use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};

use crate::auth::SessionContext;
use crate::diagnostics::Snapshot;
use crate::error::MuxError;
use crate::AppState;

pub async fn snapshot(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<Snapshot>, MuxError> {
    Ok(Json(state.diagnostics.sample(&ctx.session_id).await?))
}

pub async fn history(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<Value>, MuxError> {
    let history = state.diagnostics.history(&ctx.session_id).await?;
    Ok(Json(json!({"history": history})))
}
