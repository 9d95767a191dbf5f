//! The transport seam: one authenticated connection and the channels that
//! can be layered on it.
//!
//! Everything above this module talks to a [`Transport`] trait object, so the
//! session core never touches the SSH library directly. [`ssh`] holds the
//! russh-backed implementation used in production.

pub mod ssh;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use ssh::{SshConnectOptions, SshTransport};

/// Shared handle to a live transport connection.
pub type SharedTransport = Arc<dyn Transport>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying connection is gone. Every channel on it is dead.
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("authentication rejected")]
    AuthRejected,
    /// A single channel failed; the connection itself may still be fine.
    #[error("{0}")]
    Channel(String),
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure poisons the whole connection rather than one channel.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

/// Terminal parameters for an interactive channel.
#[derive(Debug, Clone)]
pub struct PtySpec {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

/// Collected result of a one-shot remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

/// Something the remote end of an interactive channel did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output(Vec<u8>),
    Exit(Option<u32>),
}

/// A duplex byte stream (direct-tcpip channel or plain socket).
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_shell(&self, pty: &PtySpec) -> Result<Box<dyn ShellChannel>, TransportError>;

    /// Run `command` on its own channel and wait for it to finish.
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError>;

    async fn open_files(&self) -> Result<Arc<dyn FileChannel>, TransportError>;

    async fn open_direct_tcpip(&self, host: &str, port: u16)
        -> Result<BoxedStream, TransportError>;

    fn is_healthy(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait ShellChannel: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TransportError>;

    /// Next event from the remote side. `None` once the channel is closed.
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn next_event(&mut self) -> Option<ShellEvent>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// A remote directory entry or stat result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

/// File-transfer channel. All paths are absolute.
#[async_trait]
pub trait FileChannel: Send + Sync {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError>;
    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, TransportError>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), TransportError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;
    async fn remove_file(&self, path: &str) -> Result<(), TransportError>;
    async fn remove_dir(&self, path: &str) -> Result<(), TransportError>;
    async fn mkdir(&self, path: &str) -> Result<(), TransportError>;
    async fn open_read(&self, path: &str) -> Result<BoxedReader, TransportError>;
    /// Create or truncate `path` for streaming writes.
    async fn open_write(&self, path: &str) -> Result<BoxedWriter, TransportError>;
    async fn close(&self);
}

/// Last path component, used to name stat results.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
