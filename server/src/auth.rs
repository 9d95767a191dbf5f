//! Session-token authentication.
//!
//! Every `/api` endpoint except health, login and the WebSocket upgrade
//! requires an `Authorization: Bearer <sessionId>` header. The WebSocket path
//! takes `?session=` instead (browsers can't set headers on WebSocket
//! upgrades) and validates it in its own handler.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::MuxError;
use crate::AppState;

/// The authenticated session, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
}

/// Pull the token out of an `Authorization` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum middleware that rejects requests without a live session.
///
/// A valid token refreshes nothing by itself; activity is recorded by the
/// operations that actually use the connection.
///
/// # Error responses
///
/// - `401 SESSION_NOT_FOUND` — header missing, malformed or unknown token
/// - `401 SESSION_EXPIRED` — idle too long or connection lost
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let Some(token) = bearer_token(header) else {
        return MuxError::SessionNotFound.into_response();
    };
    let session_id = token.to_string();

    if let Err(e) = state.registry.lookup(&session_id).await {
        return e.into_response();
    }

    request.extensions_mut().insert(SessionContext { session_id });
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("Bearer  abc ")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(None), None);
    }
}
