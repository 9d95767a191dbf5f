//! [`ConnectionHandle`] — one live transport connection and its metadata.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::budget::{ChannelBudget, ChannelKind, ChannelPermit};
use crate::error::MuxError;
use crate::transport::SharedTransport;

/// Remote `host:port` a session is connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct ConnectionHandle {
    transport: SharedTransport,
    endpoint: Endpoint,
    principal: String,
    created_at_ms: u64,
    healthy: AtomicBool,
    budget: ChannelBudget,
    /// Cancelled when the owning session is terminated. Every channel task
    /// of the session watches this (or a child of it).
    cancel: CancellationToken,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &self.endpoint)
            .field("principal", &self.principal)
            .field("open_channels", &self.budget.open())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn new(
        transport: SharedTransport,
        endpoint: Endpoint,
        principal: String,
        budget: ChannelBudget,
    ) -> Self {
        Self {
            transport,
            endpoint,
            principal,
            created_at_ms: crate::util::now_ms(),
            healthy: AtomicBool::new(true),
            budget,
            cancel: CancellationToken::new(),
        }
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn budget(&self) -> &ChannelBudget {
        &self.budget
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Healthy until marked otherwise or until the transport reports it died.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && self.transport.is_healthy()
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    /// Admit a new channel, refusing outright on an unhealthy connection.
    pub async fn acquire(&self, kind: ChannelKind) -> Result<ChannelPermit, MuxError> {
        if !self.is_healthy() {
            return Err(MuxError::TransportUnhealthy(format!(
                "connection to {} is down",
                self.endpoint
            )));
        }
        self.budget.try_acquire(kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::FakeTransport;
    use std::time::Duration;

    #[test]
    fn test_debug_shows_endpoint_not_transport() {
        let handle = ConnectionHandle::new(
            FakeTransport::new(),
            Endpoint {
                host: "box".into(),
                port: 2222,
            },
            "alice".into(),
            ChannelBudget::new(4, Duration::from_millis(10)),
        );
        let text = format!("{handle:?}");
        assert!(text.contains("box"));
        assert!(text.contains("alice"));
        assert!(text.contains("open_channels: 0"));
        assert!(!text.contains("FakeTransport"));
    }
}
