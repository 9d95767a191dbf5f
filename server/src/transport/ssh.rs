//! russh-backed [`Transport`].
//!
//! One [`SshTransport`] is one authenticated SSH connection. Shells, exec
//! commands, SFTP and direct-tcpip tunnels are all separate SSH channels on
//! it. Host keys are accepted on first sight and their fingerprint logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    basename, BoxedReader, BoxedStream, BoxedWriter, EntryKind, ExecOutput, FileChannel, PtySpec,
    RemoteEntry, ShellChannel, ShellEvent, Transport, TransportError,
};

/// Everything needed to open and authenticate one connection.
#[derive(Clone)]
pub struct SshConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl std::fmt::Debug for SshConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key"
        );
        Ok(true)
    }
}

/// Channel opens take `&self` on the russh handle, so concurrent consumers
/// open channels in parallel. Only authentication needs `&mut`.
pub struct SshTransport {
    handle: client::Handle<ClientHandler>,
    healthy: AtomicBool,
    endpoint: String,
}

impl SshTransport {
    /// Connect and authenticate with a password. Both steps share the
    /// connect timeout.
    pub async fn connect(opts: &SshConnectOptions) -> Result<Self, TransportError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(opts.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = ClientHandler {
            host: opts.host.clone(),
        };
        let endpoint = format!("{}:{}", opts.host, opts.port);

        let mut handle = timeout(
            opts.connect_timeout,
            client::connect(config, (opts.host.as_str(), opts.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(opts.connect_timeout))?
        .map_err(|e| TransportError::Disconnected(format!("{endpoint}: {e}")))?;

        let accepted = timeout(
            opts.connect_timeout,
            handle.authenticate_password(opts.username.clone(), opts.password.clone()),
        )
        .await
        .map_err(|_| TransportError::Timeout(opts.connect_timeout))?
        .map_err(|e| TransportError::Disconnected(e.to_string()))?;

        if !accepted {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(TransportError::AuthRejected);
        }

        info!(%endpoint, user = %opts.username, "SSH connection established");
        Ok(Self {
            handle,
            healthy: AtomicBool::new(true),
            endpoint,
        })
    }

    async fn open_session(&self) -> Result<Channel<Msg>, TransportError> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| self.classify(&e.to_string()))
    }

    /// Decide whether a failure killed the connection or just the channel.
    fn classify(&self, err: &str) -> TransportError {
        if self.handle.is_closed() {
            self.healthy.store(false, Ordering::Relaxed);
            warn!(endpoint = %self.endpoint, "SSH connection closed: {err}");
            TransportError::Disconnected(err.to_string())
        } else {
            TransportError::Channel(err.to_string())
        }
    }
}

fn channel_err(err: &russh::Error) -> TransportError {
    TransportError::Channel(err.to_string())
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_shell(&self, pty: &PtySpec) -> Result<Box<dyn ShellChannel>, TransportError> {
        let channel = self.open_session().await?;
        channel
            .request_pty(
                false,
                &pty.term,
                u32::from(pty.cols),
                u32::from(pty.rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| channel_err(&e))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| channel_err(&e))?;
        Ok(Box::new(SshShell { channel }))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        let mut channel = self.open_session().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| channel_err(&e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }
        if exit_code.is_none() && self.handle.is_closed() {
            return Err(self.classify("connection dropped during exec"));
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn open_files(&self) -> Result<Arc<dyn FileChannel>, TransportError> {
        let channel = self.open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| channel_err(&e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Channel(format!("sftp init: {e}")))?;
        debug!(endpoint = %self.endpoint, "SFTP subsystem ready");
        Ok(Arc::new(SftpFiles { sftp }))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, TransportError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| self.classify(&e.to_string()))?;
        Ok(Box::new(channel.into_stream()))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed) && !self.handle.is_closed()
    }

    async fn close(&self) {
        self.healthy.store(false, Ordering::Relaxed);
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(endpoint = %self.endpoint, "Disconnect after close: {e}");
        }
    }
}

struct SshShell {
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellChannel for SshShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel.data(data).await.map_err(|e| channel_err(&e))
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TransportError> {
        self.channel
            .window_change(u32::from(cols), u32::from(rows), 0, 0)
            .await
            .map_err(|e| channel_err(&e))
    }

    async fn next_event(&mut self) -> Option<ShellEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                    return Some(ShellEvent::Output(data.to_vec()));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ShellEvent::Exit(Some(exit_status)));
                }
                ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}

struct SftpFiles {
    sftp: SftpSession,
}

fn sftp_err(path: &str, err: russh_sftp::client::error::Error) -> TransportError {
    match err {
        russh_sftp::client::error::Error::Status(status)
            if status.status_code == StatusCode::NoSuchFile =>
        {
            TransportError::NotFound(path.to_string())
        }
        other => TransportError::Channel(format!("{path}: {other}")),
    }
}

fn entry_from_attrs(name: String, attrs: &russh_sftp::protocol::FileAttributes) -> RemoteEntry {
    let kind = if attrs.is_dir() {
        EntryKind::Dir
    } else if attrs.is_symlink() {
        EntryKind::Symlink
    } else if attrs.is_regular() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    RemoteEntry {
        name,
        kind,
        size: attrs.size.unwrap_or(0),
        modified: attrs.mtime.map(u64::from),
        permissions: attrs.permissions.map(|p| p & 0o7777),
    }
}

#[async_trait]
impl FileChannel for SftpFiles {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let dir = self.sftp.read_dir(path).await.map_err(|e| sftp_err(path, e))?;
        Ok(dir
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| entry_from_attrs(entry.file_name(), &entry.metadata()))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError> {
        let attrs = self.sftp.metadata(path).await.map_err(|e| sftp_err(path, e))?;
        Ok(entry_from_attrs(basename(path).to_string(), &attrs))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.sftp.read(path).await.map_err(|e| sftp_err(path, e))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), TransportError> {
        let mut file = self.sftp.create(path).await.map_err(|e| sftp_err(path, e))?;
        file.write_all(data).await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.sftp.rename(from, to).await.map_err(|e| sftp_err(from, e))
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        self.sftp.remove_file(path).await.map_err(|e| sftp_err(path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), TransportError> {
        self.sftp.remove_dir(path).await.map_err(|e| sftp_err(path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        self.sftp.create_dir(path).await.map_err(|e| sftp_err(path, e))
    }

    async fn open_read(&self, path: &str) -> Result<BoxedReader, TransportError> {
        let file = self.sftp.open(path).await.map_err(|e| sftp_err(path, e))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter, TransportError> {
        let file = self.sftp.create(path).await.map_err(|e| sftp_err(path, e))?;
        Ok(Box::new(file))
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close: {e}");
        }
    }
}
