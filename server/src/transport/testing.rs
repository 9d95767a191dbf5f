//! In-memory [`Transport`] used by unit tests across the crate.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use super::{
    basename, BoxedReader, BoxedStream, BoxedWriter, EntryKind, ExecOutput, FileChannel, PtySpec,
    RemoteEntry, ShellChannel, ShellEvent, Transport, TransportError,
};

/// Test-side view of one opened shell channel.
#[derive(Clone)]
pub struct ShellProbe {
    pub events: mpsc::UnboundedSender<ShellEvent>,
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    pub closed: Arc<AtomicBool>,
    pub pty: PtySpec,
}

impl ShellProbe {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn emit(&self, text: &str) {
        let _ = self.events.send(ShellEvent::Output(text.as_bytes().to_vec()));
    }
}

struct FakeShell {
    events: mpsc::UnboundedReceiver<ShellEvent>,
    probe: ShellProbe,
}

#[async_trait]
impl ShellChannel for FakeShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.probe.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("channel closed".into()));
        }
        self.probe.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TransportError> {
        self.probe.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ShellEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
enum FakeNode {
    File(Vec<u8>),
    Dir,
}

/// Flat path → node map standing in for a remote filesystem.
#[derive(Default)]
pub struct FakeFiles {
    nodes: Arc<Mutex<BTreeMap<String, FakeNode>>>,
    /// Fail streaming writes once this many bytes have been written.
    pub fail_writes_after: Mutex<Option<usize>>,
    pub closed: AtomicBool,
}

impl FakeFiles {
    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), FakeNode::File(data.to_vec()));
    }

    pub fn put_dir(&self, path: &str) {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), FakeNode::Dir);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(path) {
            Some(FakeNode::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }

    fn entry(path: &str, node: &FakeNode) -> RemoteEntry {
        let (kind, size) = match node {
            FakeNode::File(data) => (EntryKind::File, data.len() as u64),
            FakeNode::Dir => (EntryKind::Dir, 0),
        };
        RemoteEntry {
            name: basename(path).to_string(),
            kind,
            size,
            modified: None,
            permissions: None,
        }
    }
}

#[async_trait]
impl FileChannel for FakeFiles {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let nodes = self.nodes.lock().unwrap();
        if !matches!(nodes.get(path), Some(FakeNode::Dir)) {
            return Err(TransportError::NotFound(path.to_string()));
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(nodes
            .iter()
            .filter(|(p, _)| {
                p.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .map(|(p, node)| Self::entry(p, node))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry, TransportError> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(path)
            .map(|node| Self::entry(path, node))
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.file(path)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), TransportError> {
        self.put_file(path, data);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .remove(from)
            .ok_or_else(|| TransportError::NotFound(from.to_string()))?;
        nodes.insert(to.to_string(), node);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(FakeNode::File(_)) => {
                nodes.remove(path);
                Ok(())
            }
            Some(FakeNode::Dir) => Err(TransportError::Channel("is a directory".into())),
            None => Err(TransportError::NotFound(path.to_string())),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), TransportError> {
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(FakeNode::Dir) => {
                nodes.remove(path);
                Ok(())
            }
            Some(FakeNode::File(_)) => Err(TransportError::Channel("not a directory".into())),
            None => Err(TransportError::NotFound(path.to_string())),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<(), TransportError> {
        self.put_dir(path);
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<BoxedReader, TransportError> {
        let data = self.read(path).await?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter, TransportError> {
        self.put_file(path, &[]);
        Ok(Box::new(FakeWriter {
            path: path.to_string(),
            buf: Vec::new(),
            nodes: self.nodes.clone(),
            fail_after: *self.fail_writes_after.lock().unwrap(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Buffers writes and commits them to the fake filesystem on shutdown.
struct FakeWriter {
    path: String,
    buf: Vec<u8>,
    nodes: Arc<Mutex<BTreeMap<String, FakeNode>>>,
    fail_after: Option<usize>,
}

impl AsyncWrite for FakeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(limit) = self.fail_after {
            if self.buf.len() + data.len() > limit {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "remote write failed",
                )));
            }
        }
        self.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let data = self.buf.clone();
        self.nodes
            .lock()
            .unwrap()
            .insert(self.path.clone(), FakeNode::File(data));
        Poll::Ready(Ok(()))
    }
}

/// A stream whose reads always fail, for tunnel error paths.
struct BrokenStream;

impl AsyncRead for BrokenStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

impl AsyncWrite for BrokenStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// One-shot gate that parks a single transport call.
#[derive(Default)]
struct Hold(Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>);

impl Hold {
    fn arm(&self) -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.0.lock().unwrap() = Some((started_tx, release_rx));
        (release_tx, started_rx)
    }

    async fn wait(&self) {
        let held = self.0.lock().unwrap().take();
        if let Some((started, release)) = held {
            let _ = started.send(());
            let _ = release.await;
        }
    }
}

/// Scriptable in-memory transport.
#[derive(Default)]
pub struct FakeTransport {
    pub healthy: AtomicBool,
    pub closed: AtomicBool,
    pub shells: Mutex<Vec<ShellProbe>>,
    pub exec_results: Mutex<VecDeque<Result<ExecOutput, TransportError>>>,
    pub exec_calls: Mutex<Vec<String>>,
    pub files: Arc<FakeFiles>,
    pub files_opened: AtomicUsize,
    pub tunnels: Mutex<Vec<(String, u16, DuplexStream)>>,
    pub break_tunnels: AtomicBool,
    pub fail_opens: AtomicBool,
    held_exec: Hold,
    held_files_open: Hold,
    held_tunnel_open: Hold,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let transport = Self::default();
        transport.healthy.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn push_exec(&self, stdout: &str) {
        self.exec_results.lock().unwrap().push_back(Ok(ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        }));
    }

    pub fn push_exec_error(&self, err: TransportError) {
        self.exec_results.lock().unwrap().push_back(Err(err));
    }

    /// Park the next `exec` until the returned sender fires (or drops).
    /// The returned receiver resolves once that `exec` is in flight.
    pub fn hold_next_exec(&self) -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        self.held_exec.arm()
    }

    /// Same as [`hold_next_exec`](Self::hold_next_exec) for `open_files`.
    pub fn hold_next_files_open(&self) -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        self.held_files_open.arm()
    }

    /// Same as [`hold_next_exec`](Self::hold_next_exec) for `open_direct_tcpip`.
    pub fn hold_next_tunnel_open(&self) -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        self.held_tunnel_open.arm()
    }

    pub fn shell(&self, index: usize) -> ShellProbe {
        self.shells.lock().unwrap()[index].clone()
    }

    pub fn take_tunnel(&self) -> Option<(String, u16, DuplexStream)> {
        self.tunnels.lock().unwrap().pop()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected("fake connection down".into()));
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("open refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_shell(&self, pty: &PtySpec) -> Result<Box<dyn ShellChannel>, TransportError> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = ShellProbe {
            events: tx,
            writes: Arc::default(),
            resizes: Arc::default(),
            closed: Arc::default(),
            pty: pty.clone(),
        };
        self.shells.lock().unwrap().push(probe.clone());
        Ok(Box::new(FakeShell { events: rx, probe }))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        self.check_open()?;
        self.exec_calls.lock().unwrap().push(command.to_string());
        self.held_exec.wait().await;
        self.exec_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Channel("no scripted output".into())))
    }

    async fn open_files(&self) -> Result<Arc<dyn FileChannel>, TransportError> {
        self.check_open()?;
        self.held_files_open.wait().await;
        self.files_opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.files.clone())
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, TransportError> {
        self.check_open()?;
        self.held_tunnel_open.wait().await;
        if self.break_tunnels.load(Ordering::SeqCst) {
            return Ok(Box::new(BrokenStream));
        }
        let (local, remote) = tokio::io::duplex(4096);
        self.tunnels
            .lock()
            .unwrap()
            .push((host.to_string(), port, remote));
        Ok(Box::new(local))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.healthy.store(false, Ordering::SeqCst);
    }
}
