//! Error taxonomy shared by every consumer of a session.
//!
//! [`MuxError`] is what handlers and WebSocket dispatch surface to clients.
//! Each variant carries a stable wire code (see [`MuxError::code`]) and maps
//! onto an HTTP status when returned from a REST handler.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Session not found")]
    SessionNotFound,
    #[error("Session expired")]
    SessionExpired,
    #[error("Channel limit reached ({open}/{ceiling} open), retry later")]
    ChannelBudgetExceeded { open: usize, ceiling: usize },
    #[error("Failed to open channel: {0}")]
    ChannelOpenFailed(String),
    #[error("Connection unhealthy: {0}")]
    TransportUnhealthy(String),
    #[error("Upstream I/O failure: {0}")]
    UpstreamIo(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Payload exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("Authentication failed")]
    AuthFailed,
}

impl MuxError {
    /// Stable machine-readable code sent as `"code"` in error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::ChannelBudgetExceeded { .. } => "CHANNEL_BUDGET_EXCEEDED",
            Self::ChannelOpenFailed(_) => "CHANNEL_OPEN_FAILED",
            Self::TransportUnhealthy(_) => "TRANSPORT_UNHEALTHY",
            Self::UpstreamIo(_) => "UPSTREAM_IO_FAILURE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::AuthFailed => "AUTH_FAILED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound | Self::SessionExpired | Self::AuthFailed => {
                StatusCode::UNAUTHORIZED
            }
            Self::ChannelBudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ChannelOpenFailed(_) | Self::UpstreamIo(_) => StatusCode::BAD_GATEWAY,
            Self::TransportUnhealthy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Whether the caller should give up on the session entirely.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound | Self::SessionExpired | Self::TransportUnhealthy(_)
        )
    }

    /// WebSocket error frame for a `kind` namespace (`shell`, `tunnel`, ...).
    pub fn to_frame(&self, kind: &str) -> Value {
        json!({
            "kind": kind,
            "action": "error",
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

impl From<TransportError> for MuxError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected(msg) => Self::TransportUnhealthy(msg),
            TransportError::AuthRejected => Self::AuthFailed,
            TransportError::NotFound(path) => Self::NotFound(path),
            other => Self::UpstreamIo(other.to_string()),
        }
    }
}

impl IntoResponse for MuxError {
    fn into_response(self) -> Response {
        let body = Json(json!({"error": self.to_string(), "code": self.code()}));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_map_to_taxonomy() {
        let err: MuxError = TransportError::Disconnected("reset".into()).into();
        assert_eq!(err.code(), "TRANSPORT_UNHEALTHY");
        assert!(err.is_session_fatal());

        let err: MuxError = TransportError::Channel("eof".into()).into();
        assert_eq!(err.code(), "UPSTREAM_IO_FAILURE");
        assert!(!err.is_session_fatal());

        let err: MuxError = TransportError::NotFound("/tmp/x".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_budget_error_is_back_off_signal() {
        let err = MuxError::ChannelBudgetExceeded {
            open: 8,
            ceiling: 8,
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        let frame = err.to_frame("shell");
        assert_eq!(frame["action"], "error");
        assert_eq!(frame["code"], "CHANNEL_BUDGET_EXCEEDED");
    }
}
