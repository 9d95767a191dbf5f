//! Login, logout and session metadata.
//!
//! - `POST /api/auth/login`   — open an SSH connection and register a session
//! - `POST /api/auth/logout`  — terminate the caller's session
//! - `GET  /api/auth/session` — endpoint, principal, idle time, channel usage

use std::sync::Arc;

use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::SessionContext;
use crate::error::MuxError;
use crate::sessions::{CloseReason, Endpoint};
use crate::transport::ssh::SshTransport;
use crate::transport::TransportError;
use crate::util::short_id;
use crate::AppState;

/// Request body for `POST /api/auth/login`.
#[derive(Deserialize)]
pub struct LoginRequest {
    /// Defaults to `ssh.default_host`.
    pub host: Option<String>,
    /// Defaults to `ssh.default_port`.
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
}

/// Map a failed connect to what the login caller should see.
fn login_error(err: TransportError) -> MuxError {
    match err {
        TransportError::AuthRejected => MuxError::AuthFailed,
        other => MuxError::ChannelOpenFailed(other.to_string()),
    }
}

/// `POST /api/auth/login` — authenticate against the SSH server.
///
/// The SSH connection itself is the credential check; nothing is stored but
/// the live connection.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, MuxError> {
    if req.username.trim().is_empty() {
        return Err(MuxError::InvalidRequest("username is required".into()));
    }

    let opts = state
        .config
        .ssh_options(req.host.as_deref(), req.port, &req.username, &req.password);
    let endpoint = Endpoint {
        host: opts.host.clone(),
        port: opts.port,
    };

    let transport = SshTransport::connect(&opts).await.map_err(|e| {
        warn!(user = %req.username, endpoint = %endpoint, "Login failed: {e}");
        login_error(e)
    })?;

    let session_id = state
        .registry
        .register(Arc::new(transport), &req.username, endpoint.clone())
        .await;
    info!(
        session = short_id(&session_id),
        user = %req.username,
        endpoint = %endpoint,
        "Login succeeded"
    );

    Ok(Json(json!({
        "sessionId": session_id,
        "user": req.username,
        "host": endpoint.host,
        "port": endpoint.port,
    })))
}

/// `POST /api/auth/logout` — tear down the session and every channel on it.
pub async fn logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Json<Value> {
    let terminated = state
        .registry
        .terminate(&ctx.session_id, CloseReason::Logout)
        .await;
    Json(json!({"status": "ok", "terminated": terminated}))
}

/// `GET /api/auth/session` — metadata for the caller's session.
pub async fn info(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<Value>, MuxError> {
    let summary = state.registry.summary(&ctx.session_id).await?;
    Ok(Json(json!(summary)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::testing::FakeTransport;

    #[test]
    fn test_login_error_mapping() {
        assert!(matches!(
            login_error(TransportError::AuthRejected),
            MuxError::AuthFailed
        ));
        assert!(matches!(
            login_error(TransportError::Disconnected("refused".into())),
            MuxError::ChannelOpenFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_logout_and_info() {
        let state = AppState::new(Config::default());
        let transport = FakeTransport::new();
        let session_id = state
            .registry
            .register(
                transport.clone(),
                "alice",
                Endpoint {
                    host: "box".into(),
                    port: 22,
                },
            )
            .await;
        let ctx = SessionContext {
            session_id: session_id.clone(),
        };

        let Json(body) = info(State(state.clone()), Extension(ctx.clone()))
            .await
            .unwrap();
        assert_eq!(body["principal"], "alice");
        assert_eq!(body["channelCeiling"], 8);

        let Json(body) = logout(State(state.clone()), Extension(ctx.clone())).await;
        assert_eq!(body["terminated"], true);
        assert!(info(State(state), Extension(ctx)).await.is_err());
    }

    #[tokio::test]
    async fn test_login_requires_username() {
        let state = AppState::new(Config::default());
        let req = LoginRequest {
            host: None,
            port: None,
            username: " ".into(),
            password: "pw".into(),
        };
        let err = login(State(state), Json(req)).await.unwrap_err();
        assert!(matches!(err, MuxError::InvalidRequest(_)));
    }
}
