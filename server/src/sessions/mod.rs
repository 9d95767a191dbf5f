//! Session lifecycle: one authenticated connection per session token.
//!
//! [`SessionRegistry`] is the single owner of every [`ConnectionHandle`].
//! Consumers (shell bridge, file client, diagnostics sampler, tunnel proxy)
//! hold only the session id and go through [`SessionRegistry::lookup`] before
//! opening a channel.
//!
//! ## Expiry
//!
//! A session is expired when it has been idle longer than the configured
//! timeout or when its connection has been found dead. Expiry is checked
//! lazily on every lookup and eagerly by [`SessionRegistry::sweep`], which
//! `main` runs on a fixed interval.
//!
//! ## Teardown
//!
//! [`SessionRegistry::terminate`] removes the entry first (so concurrent calls
//! race to a single winner), cancels the session's token (every channel task
//! watches it), lets registered [`SessionListener`]s drop per-session state,
//! closes the channel budget and finally closes the transport.

pub mod budget;
pub mod connection;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

pub use budget::{ChannelBudget, ChannelKind, ChannelPermit};
pub use connection::{ConnectionHandle, Endpoint};

use crate::error::MuxError;
use crate::transport::{SharedTransport, TransportError};
use crate::util::{generate_session_token, short_id};

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Logout,
    IdleTimeout,
    TransportFailure,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::IdleTimeout => "idle_timeout",
            Self::TransportFailure => "transport_failure",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Hook for consumers that keep per-session state outside channel tasks.
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn session_closed(&self, session_id: &str, reason: CloseReason);
}

/// Limits applied to every session the registry creates.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub idle_timeout: Duration,
    pub channel_ceiling: usize,
    pub acquire_wait: Duration,
}

struct SessionEntry {
    handle: Arc<ConnectionHandle>,
    last_activity: Instant,
}

/// Snapshot of one session for `/api/auth/session` and logs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub endpoint: Endpoint,
    pub principal: String,
    pub created_at: u64,
    pub idle_secs: u64,
    pub healthy: bool,
    pub open_channels: usize,
    pub channel_ceiling: usize,
    pub channels: HashMap<&'static str, usize>,
}

/// Maps session tokens to connections.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn SessionListener>>>>,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::default(),
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Register a consumer to be told about every session teardown.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Adopt a live connection and return its new session token.
    pub async fn register(
        &self,
        transport: SharedTransport,
        principal: &str,
        endpoint: Endpoint,
    ) -> String {
        let budget = ChannelBudget::new(self.settings.channel_ceiling, self.settings.acquire_wait);
        let handle = ConnectionHandle::new(transport, endpoint, principal.to_string(), budget);
        let session_id = generate_session_token();

        let mut sessions = self.sessions.write().await;
        info!(
            session = short_id(&session_id),
            endpoint = %handle.endpoint(),
            user = principal,
            "Session registered, total: {}",
            sessions.len() + 1
        );
        sessions.insert(
            session_id.clone(),
            SessionEntry {
                handle: Arc::new(handle),
                last_activity: Instant::now(),
            },
        );
        session_id
    }

    /// Resolve a session to its connection.
    ///
    /// An idle-expired or dead session is torn down here before
    /// [`MuxError::SessionExpired`] is returned.
    pub async fn lookup(&self, session_id: &str) -> Result<Arc<ConnectionHandle>, MuxError> {
        let expired = {
            let sessions = self.sessions.read().await;
            let entry = sessions.get(session_id).ok_or(MuxError::SessionNotFound)?;
            if entry.last_activity.elapsed() > self.settings.idle_timeout {
                Some(CloseReason::IdleTimeout)
            } else if !entry.handle.is_healthy() {
                Some(CloseReason::TransportFailure)
            } else {
                return Ok(entry.handle.clone());
            }
        };
        if let Some(reason) = expired {
            self.terminate(session_id, reason).await;
        }
        Err(MuxError::SessionExpired)
    }

    /// Refresh last activity. Unknown ids are ignored.
    pub async fn touch(&self, session_id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Tear a session down. Returns `false` if it was already gone.
    pub async fn terminate(&self, session_id: &str, reason: CloseReason) -> bool {
        let Some(entry) = self.sessions.write().await.remove(session_id) else {
            return false;
        };
        let handle = entry.handle;

        handle.cancel_token().cancel();

        let listeners: Vec<Arc<dyn SessionListener>> = self
            .listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener.session_closed(session_id, reason).await;
        }

        handle.budget().close();
        handle.transport().close().await;

        info!(
            session = short_id(session_id),
            endpoint = %handle.endpoint(),
            reason = reason.as_str(),
            "Session terminated"
        );
        true
    }

    /// Mark the connection dead and tear the session down.
    pub async fn fail_transport(&self, session_id: &str) {
        if let Some(entry) = self.sessions.read().await.get(session_id) {
            entry.handle.mark_unhealthy();
        }
        self.terminate(session_id, CloseReason::TransportFailure).await;
    }

    /// Translate a channel-open failure, escalating connection-level ones.
    pub async fn open_failed(&self, session_id: &str, err: TransportError) -> MuxError {
        if err.is_connection_level() {
            warn!(session = short_id(session_id), "Connection lost opening channel: {err}");
            self.fail_transport(session_id).await;
            MuxError::TransportUnhealthy(err.to_string())
        } else {
            MuxError::ChannelOpenFailed(err.to_string())
        }
    }

    /// Translate an I/O failure on an open channel, escalating
    /// connection-level ones.
    pub async fn io_failed(&self, session_id: &str, err: TransportError) -> MuxError {
        if err.is_connection_level() {
            warn!(session = short_id(session_id), "Connection lost mid-operation: {err}");
            self.fail_transport(session_id).await;
        }
        err.into()
    }

    /// Terminate every idle-expired or dead session. Returns what was removed.
    pub async fn sweep(&self) -> Vec<(String, CloseReason)> {
        let doomed: Vec<(String, CloseReason)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter_map(|(id, entry)| {
                    if entry.last_activity.elapsed() > self.settings.idle_timeout {
                        Some((id.clone(), CloseReason::IdleTimeout))
                    } else if !entry.handle.is_healthy() {
                        Some((id.clone(), CloseReason::TransportFailure))
                    } else {
                        None
                    }
                })
                .collect()
        };

        let mut removed = Vec::with_capacity(doomed.len());
        for (id, reason) in doomed {
            if self.terminate(&id, reason).await {
                removed.push((id, reason));
            }
        }
        removed
    }

    pub async fn terminate_all(&self, reason: CloseReason) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.terminate(&id, reason).await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn summary(&self, session_id: &str) -> Result<SessionSummary, MuxError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id).ok_or(MuxError::SessionNotFound)?;
        let handle = &entry.handle;
        let budget = handle.budget();
        Ok(SessionSummary {
            endpoint: handle.endpoint().clone(),
            principal: handle.principal().to_string(),
            created_at: handle.created_at_ms(),
            idle_secs: entry.last_activity.elapsed().as_secs(),
            healthy: handle.is_healthy(),
            open_channels: budget.open(),
            channel_ceiling: budget.ceiling(),
            channels: ChannelKind::ALL
                .iter()
                .map(|kind| (kind.as_str(), budget.open_of(*kind)))
                .collect(),
        })
    }
}
