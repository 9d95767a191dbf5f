//! Per-connection channel admission.
//!
//! SSH servers cap how many channels one connection may hold open (OpenSSH's
//! `MaxSessions` defaults to 10). [`ChannelBudget`] keeps the number of
//! channels we open below a configured ceiling so a burst of consumers gets a
//! clean back-off signal instead of an opaque open failure from the server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::error::MuxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Shell,
    FileTransfer,
    Exec,
    Tunnel,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [Self::Shell, Self::FileTransfer, Self::Exec, Self::Tunnel];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::FileTransfer => "file_transfer",
            Self::Exec => "exec",
            Self::Tunnel => "tunnel",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Shell => 0,
            Self::FileTransfer => 1,
            Self::Exec => 2,
            Self::Tunnel => 3,
        }
    }
}

/// Open-channel counters, one per [`ChannelKind`].
#[derive(Default)]
struct KindCounters([AtomicUsize; 4]);

impl KindCounters {
    fn add(&self, kind: ChannelKind) {
        self.0[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn sub(&self, kind: ChannelKind) {
        self.0[kind.index()].fetch_sub(1, Ordering::Relaxed);
    }

    fn get(&self, kind: ChannelKind) -> usize {
        self.0[kind.index()].load(Ordering::Relaxed)
    }
}

/// Admission control for the channels of one connection.
///
/// Cloneable; clones share the same semaphore.
#[derive(Clone)]
pub struct ChannelBudget {
    semaphore: Arc<Semaphore>,
    counters: Arc<KindCounters>,
    ceiling: usize,
    acquire_wait: Duration,
}

impl ChannelBudget {
    pub fn new(ceiling: usize, acquire_wait: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            counters: Arc::default(),
            ceiling,
            acquire_wait,
        }
    }

    /// Admit one channel of `kind`.
    ///
    /// Waits up to the configured acquire window for a slot to free up, then
    /// gives up with [`MuxError::ChannelBudgetExceeded`]. Once the budget is
    /// closed every request fails with [`MuxError::TransportUnhealthy`].
    pub async fn try_acquire(&self, kind: ChannelKind) -> Result<ChannelPermit, MuxError> {
        match timeout(self.acquire_wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                self.counters.add(kind);
                Ok(ChannelPermit {
                    permit: Some(permit),
                    kind,
                    counters: self.counters.clone(),
                })
            }
            Ok(Err(_)) => Err(MuxError::TransportUnhealthy(
                "connection is closing".to_string(),
            )),
            Err(_) => Err(MuxError::ChannelBudgetExceeded {
                open: self.open(),
                ceiling: self.ceiling,
            }),
        }
    }

    /// Channels currently held open.
    pub fn open(&self) -> usize {
        self.ceiling
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn open_of(&self, kind: ChannelKind) -> usize {
        self.counters.get(kind)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Refuse every future acquire. Outstanding permits stay valid until
    /// their holders release them.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// One admitted channel. Dropping it returns the slot.
#[derive(Debug)]
pub struct ChannelPermit {
    permit: Option<OwnedSemaphorePermit>,
    kind: ChannelKind,
    counters: Arc<KindCounters>,
}

impl std::fmt::Debug for KindCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in ChannelKind::ALL {
            map.entry(&kind.as_str(), &self.get(kind));
        }
        map.finish()
    }
}

impl ChannelPermit {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Give the slot back. Safe to call more than once.
    pub fn release(&mut self) {
        if self.permit.take().is_some() {
            self.counters.sub(self.kind);
        }
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}

impl Drop for ChannelPermit {
    fn drop(&mut self) {
        self.release();
    }
}
