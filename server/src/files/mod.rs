//! Remote file operations over a per-session file-transfer channel.
//!
//! The channel is opened on first use and cached for the session's lifetime,
//! holding one `file_transfer` permit. Transport-level failures drop the
//! cached channel so the next request reopens it.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::sessions::{ChannelKind, ChannelPermit, CloseReason, SessionListener, SessionRegistry};
use crate::transport::{BoxedReader, BoxedWriter, EntryKind, FileChannel, RemoteEntry, TransportError};
use crate::util::short_id;

#[derive(Debug, Clone)]
pub struct FileSettings {
    pub max_file_size: u64,
    pub max_upload_size: u64,
    pub fallback_home: String,
    pub open_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub encoding: ContentEncoding,
    pub size: u64,
}

/// Streaming download body plus the metadata needed for response headers.
pub struct Download {
    pub entry: RemoteEntry,
    pub stream: ReaderStream<BoxedReader>,
}

struct FileSlot {
    channel: Arc<dyn FileChannel>,
    _permit: ChannelPermit,
}

enum UploadFailure {
    Remote(TransportError),
    Rejected(MuxError),
}

/// Validate that a user-supplied path is absolute, has no `..` traversal, and
/// contains no null bytes.
pub fn validate_path(path: &str) -> Result<(), MuxError> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(MuxError::InvalidRequest("Path must be absolute".into()));
    }
    if path.contains('\0') {
        return Err(MuxError::InvalidRequest("Path contains null bytes".into()));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(MuxError::InvalidRequest(
            "Path traversal (..) not allowed".into(),
        ));
    }
    Ok(())
}

/// Join an upload directory and a client-supplied file name.
pub fn join_path(dir: &str, name: &str) -> Result<String, MuxError> {
    validate_path(dir)?;
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(MuxError::InvalidRequest(format!("Invalid file name: {name:?}")));
    }
    Ok(format!("{}/{name}", dir.trim_end_matches('/')))
}

fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| {
        let a_dir = a.kind == EntryKind::Dir;
        let b_dir = b.kind == EntryKind::Dir;
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });
}

async fn copy_upload<S, E>(writer: &mut BoxedWriter, stream: S, limit: u64) -> Result<u64, UploadFailure>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            UploadFailure::Rejected(MuxError::InvalidRequest(format!("Upload interrupted: {e}")))
        })?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(UploadFailure::Rejected(MuxError::PayloadTooLarge { limit }));
        }
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| UploadFailure::Remote(e.into()))?;
    }
    writer
        .shutdown()
        .await
        .map_err(|e| UploadFailure::Remote(e.into()))?;
    Ok(written)
}

#[derive(Clone)]
pub struct FileOpsClient {
    registry: SessionRegistry,
    channels: Arc<Mutex<HashMap<String, Arc<OnceCell<FileSlot>>>>>,
    settings: Arc<FileSettings>,
}

impl FileOpsClient {
    pub fn new(registry: SessionRegistry, settings: FileSettings) -> Self {
        Self {
            registry,
            channels: Arc::new(Mutex::new(HashMap::new())),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &FileSettings {
        &self.settings
    }

    /// The session's file channel, opening it on first use.
    async fn channel(&self, session_id: &str) -> Result<Arc<dyn FileChannel>, MuxError> {
        let handle = self.registry.lookup(session_id).await?;
        let cell = {
            let mut channels = self.channels.lock().await;
            if handle.cancel_token().is_cancelled() {
                return Err(MuxError::SessionExpired);
            }
            channels.entry(session_id.to_string()).or_default().clone()
        };

        let slot = cell
            .get_or_try_init(|| async {
                let permit = handle.acquire(ChannelKind::FileTransfer).await?;
                match timeout(self.settings.open_timeout, handle.transport().open_files()).await {
                    Ok(Ok(channel)) => {
                        debug!(session = short_id(session_id), "File channel opened");
                        Ok(FileSlot {
                            channel,
                            _permit: permit,
                        })
                    }
                    Ok(Err(e)) => Err(self.registry.open_failed(session_id, e).await),
                    Err(_) => Err(MuxError::ChannelOpenFailed(format!(
                        "file channel not ready after {}s",
                        self.settings.open_timeout.as_secs()
                    ))),
                }
            })
            .await?;

        // Teardown may have swept the map while the channel was opening.
        if handle.cancel_token().is_cancelled() {
            self.channels.lock().await.remove(session_id);
            slot.channel.close().await;
            return Err(MuxError::SessionExpired);
        }
        Ok(slot.channel.clone())
    }

    /// Close and forget the cached channel. Its permit goes back once no
    /// in-flight request still holds the slot.
    async fn invalidate(&self, session_id: &str) {
        let cell = self.channels.lock().await.remove(session_id);
        if let Some(slot) = cell.as_deref().and_then(OnceCell::get) {
            slot.channel.close().await;
        }
    }

    /// Map an operation result, refreshing the session on success.
    async fn finish<T>(
        &self,
        session_id: &str,
        result: Result<T, TransportError>,
    ) -> Result<T, MuxError> {
        match result {
            Ok(value) => {
                self.registry.touch(session_id).await;
                Ok(value)
            }
            Err(TransportError::NotFound(path)) => Err(MuxError::NotFound(path)),
            Err(e) => Err(self.fail(session_id, e).await),
        }
    }

    async fn fail(&self, session_id: &str, err: TransportError) -> MuxError {
        if matches!(
            err,
            TransportError::Io(_) | TransportError::Timeout(_) | TransportError::Disconnected(_)
        ) {
            self.invalidate(session_id).await;
        }
        self.registry.io_failed(session_id, err).await
    }

    /// Directories first, then by name.
    pub async fn list(&self, session_id: &str, path: &str) -> Result<Vec<RemoteEntry>, MuxError> {
        validate_path(path)?;
        let channel = self.channel(session_id).await?;
        let mut entries = self.finish(session_id, channel.list(path).await).await?;
        sort_entries(&mut entries);
        Ok(entries)
    }

    pub async fn stat(&self, session_id: &str, path: &str) -> Result<RemoteEntry, MuxError> {
        validate_path(path)?;
        let channel = self.channel(session_id).await?;
        self.finish(session_id, channel.stat(path).await).await
    }

    /// Read a whole file, as UTF-8 text when it decodes, base64 otherwise.
    pub async fn read(&self, session_id: &str, path: &str) -> Result<FileContent, MuxError> {
        validate_path(path)?;
        let channel = self.channel(session_id).await?;
        let entry = self.finish(session_id, channel.stat(path).await).await?;
        if entry.kind == EntryKind::Dir {
            return Err(MuxError::InvalidRequest(format!("{path} is a directory")));
        }
        let limit = self.settings.max_file_size;
        if entry.size > limit {
            return Err(MuxError::PayloadTooLarge { limit });
        }

        let data = self.finish(session_id, channel.read(path).await).await?;
        let size = data.len() as u64;
        if size > limit {
            return Err(MuxError::PayloadTooLarge { limit });
        }
        let (content, encoding) = match String::from_utf8(data) {
            Ok(text) => (text, ContentEncoding::Utf8),
            Err(e) => (BASE64.encode(e.into_bytes()), ContentEncoding::Base64),
        };
        Ok(FileContent {
            path: path.to_string(),
            content,
            encoding,
            size,
        })
    }

    pub async fn write(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
        encoding: ContentEncoding,
    ) -> Result<u64, MuxError> {
        validate_path(path)?;
        let data = match encoding {
            ContentEncoding::Utf8 => content.as_bytes().to_vec(),
            ContentEncoding::Base64 => BASE64
                .decode(content)
                .map_err(|e| MuxError::InvalidRequest(format!("Invalid base64 content: {e}")))?,
        };
        let limit = self.settings.max_file_size;
        if data.len() as u64 > limit {
            return Err(MuxError::PayloadTooLarge { limit });
        }
        let channel = self.channel(session_id).await?;
        self.finish(session_id, channel.write(path, &data).await).await?;
        Ok(data.len() as u64)
    }

    pub async fn rename(&self, session_id: &str, from: &str, to: &str) -> Result<(), MuxError> {
        validate_path(from)?;
        validate_path(to)?;
        let channel = self.channel(session_id).await?;
        self.finish(session_id, channel.rename(from, to).await).await
    }

    pub async fn delete(&self, session_id: &str, path: &str, directory: bool) -> Result<(), MuxError> {
        validate_path(path)?;
        if path.trim_end_matches('/').is_empty() {
            return Err(MuxError::InvalidRequest("Refusing to delete /".into()));
        }
        let channel = self.channel(session_id).await?;
        let result = if directory {
            channel.remove_dir(path).await
        } else {
            channel.remove_file(path).await
        };
        self.finish(session_id, result).await
    }

    pub async fn mkdir(&self, session_id: &str, path: &str) -> Result<(), MuxError> {
        validate_path(path)?;
        let channel = self.channel(session_id).await?;
        self.finish(session_id, channel.mkdir(path).await).await
    }

    /// The remote user's home directory, or the configured fallback when it
    /// cannot be determined. A lost session is still reported as an error.
    pub async fn resolve_home(&self, session_id: &str) -> Result<String, MuxError> {
        let handle = self.registry.lookup(session_id).await?;
        let fallback = self.settings.fallback_home.clone();

        let permit = match handle.acquire(ChannelKind::Exec).await {
            Ok(permit) => permit,
            Err(e) => {
                debug!(session = short_id(session_id), "Home lookup skipped: {e}");
                return Ok(fallback);
            }
        };
        let result = timeout(
            self.settings.open_timeout,
            handle.transport().exec("printf '%s' \"$HOME\""),
        )
        .await;
        drop(permit);

        match result {
            Ok(Ok(output)) => {
                let home = output.stdout.trim();
                if validate_path(home).is_ok() {
                    self.registry.touch(session_id).await;
                    Ok(home.to_string())
                } else {
                    debug!(session = short_id(session_id), "Unusable $HOME {home:?}");
                    Ok(fallback)
                }
            }
            Ok(Err(e)) if e.is_connection_level() => {
                Err(self.registry.io_failed(session_id, e).await)
            }
            Ok(Err(e)) => {
                debug!(session = short_id(session_id), "Home lookup failed: {e}");
                Ok(fallback)
            }
            Err(_) => Ok(fallback),
        }
    }

    /// Stream `body` into `path`. On any failure the partial file is removed
    /// and a single error is returned.
    pub async fn upload<S, E>(&self, session_id: &str, path: &str, body: S) -> Result<u64, MuxError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        validate_path(path)?;
        let channel = self.channel(session_id).await?;
        let mut writer = self.finish(session_id, channel.open_write(path).await).await?;

        match copy_upload(&mut writer, body, self.settings.max_upload_size).await {
            Ok(written) => {
                self.registry.touch(session_id).await;
                info!(session = short_id(session_id), path, bytes = written, "Upload complete");
                Ok(written)
            }
            Err(failure) => {
                let _ = writer.shutdown().await;
                drop(writer);
                if let Err(e) = channel.remove_file(path).await {
                    warn!(session = short_id(session_id), path, "Could not remove partial upload: {e}");
                }
                match failure {
                    UploadFailure::Rejected(err) => Err(err),
                    UploadFailure::Remote(e) => Err(self.fail(session_id, e).await),
                }
            }
        }
    }

    pub async fn download(&self, session_id: &str, path: &str) -> Result<Download, MuxError> {
        validate_path(path)?;
        let channel = self.channel(session_id).await?;
        let entry = self.finish(session_id, channel.stat(path).await).await?;
        if entry.kind == EntryKind::Dir {
            return Err(MuxError::InvalidRequest(format!("{path} is a directory")));
        }
        let reader = self.finish(session_id, channel.open_read(path).await).await?;
        Ok(Download {
            entry,
            stream: ReaderStream::new(reader),
        })
    }
}

#[async_trait]
impl SessionListener for FileOpsClient {
    async fn session_closed(&self, session_id: &str, _reason: CloseReason) {
        self.invalidate(session_id).await;
    }
}
