//! Interactive terminals bridged onto WebSocket clients.
//!
//! Each terminal is one SSH shell channel bound to exactly one WebSocket
//! client for its whole life. A dedicated task owns the channel and pumps
//! both directions; the WebSocket side reaches it through a command queue.
//!
//! The pump ends on the first of:
//!
//! - remote exit/close → `exit` frame to the client, permit released
//! - client `close` or disconnect → remote channel closed, permit released
//! - session teardown (cancellation token) → channel closed, `exit` frame
//! - write failure → one `error` frame, channel closed
//!
//! Whichever happens first wins; the task owns every resource, so the others
//! find nothing left to do.

pub mod wake;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MuxError;
use crate::sessions::{ChannelKind, ChannelPermit, SessionRegistry};
use crate::transport::{PtySpec, ShellChannel, ShellEvent, TransportError};
use crate::util::{short_id, Utf8Chunker};
use crate::ws::ClientTx;
use wake::WakeSchedule;

#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub term: String,
    pub default_cols: u16,
    pub default_rows: u16,
    pub wake_grace: Duration,
    pub wake_retry: Duration,
    pub open_timeout: Duration,
}

enum ShellCommand {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

struct TerminalEntry {
    session_id: String,
    client_id: String,
    commands: mpsc::Sender<ShellCommand>,
}

/// How a terminal pump ended.
enum Ending {
    RemoteExit(Option<u32>),
    ClientClosed,
    SessionClosed,
    Failed(TransportError),
}

#[derive(Clone)]
pub struct ShellBridge {
    registry: SessionRegistry,
    terminals: Arc<RwLock<HashMap<String, TerminalEntry>>>,
    settings: Arc<ShellSettings>,
}

impl ShellBridge {
    pub fn new(registry: SessionRegistry, settings: ShellSettings) -> Self {
        Self {
            registry,
            terminals: Arc::new(RwLock::new(HashMap::new())),
            settings: Arc::new(settings),
        }
    }

    /// Open a shell channel for `client` and start pumping it.
    ///
    /// The `created` frame is queued before the pump starts, so the client
    /// always sees it ahead of any output. Returns the terminal id.
    pub async fn create(
        &self,
        session_id: &str,
        client: &ClientTx,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<String, MuxError> {
        let handle = self.registry.lookup(session_id).await?;
        let permit = handle.acquire(ChannelKind::Shell).await?;

        let pty = PtySpec {
            term: self.settings.term.clone(),
            cols: cols.unwrap_or(self.settings.default_cols).max(1),
            rows: rows.unwrap_or(self.settings.default_rows).max(1),
        };
        let channel = match timeout(self.settings.open_timeout, handle.transport().open_shell(&pty))
            .await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(self.registry.open_failed(session_id, e).await),
            Err(_) => {
                return Err(MuxError::ChannelOpenFailed(format!(
                    "shell open timed out after {}s",
                    self.settings.open_timeout.as_secs()
                )))
            }
        };
        self.registry.touch(session_id).await;

        let terminal_id = Uuid::new_v4().to_string();
        let (commands_tx, commands_rx) = mpsc::channel(256);
        self.terminals.write().await.insert(
            terminal_id.clone(),
            TerminalEntry {
                session_id: session_id.to_string(),
                client_id: client.id().to_string(),
                commands: commands_tx,
            },
        );

        client
            .send_json(json!({
                "kind": "shell",
                "action": "created",
                "terminalId": terminal_id,
                "sessionId": session_id,
                "cols": pty.cols,
                "rows": pty.rows,
            }))
            .await;

        info!(
            session = short_id(session_id),
            terminal = %terminal_id,
            cols = pty.cols,
            rows = pty.rows,
            "Terminal created"
        );

        let pump = TerminalPump {
            terminal_id: terminal_id.clone(),
            session_id: session_id.to_string(),
            channel,
            commands: commands_rx,
            client: client.clone(),
            cancel: handle.cancel_token().child_token(),
            permit,
            bridge: self.clone(),
        };
        tokio::spawn(pump.run());

        Ok(terminal_id)
    }

    /// Queue raw input for a terminal owned by `client_id`.
    pub async fn input(
        &self,
        terminal_id: &str,
        client_id: &str,
        data: Vec<u8>,
    ) -> Result<(), MuxError> {
        let (sender, session_id) = self.sender_for(terminal_id, client_id).await?;
        sender
            .send(ShellCommand::Input(data))
            .await
            .map_err(|_| MuxError::NotFound(format!("terminal {terminal_id}")))?;
        self.registry.touch(&session_id).await;
        Ok(())
    }

    /// Propagate a window size. A terminal that is already gone is ignored.
    pub async fn resize(&self, terminal_id: &str, client_id: &str, cols: u16, rows: u16) {
        if let Ok((sender, _)) = self.sender_for(terminal_id, client_id).await {
            let _ = sender.send(ShellCommand::Resize { cols, rows }).await;
        }
    }

    pub async fn close(&self, terminal_id: &str, client_id: &str) {
        if let Ok((sender, _)) = self.sender_for(terminal_id, client_id).await {
            let _ = sender.send(ShellCommand::Close).await;
        }
    }

    /// Close every terminal bound to a disconnecting client.
    pub async fn close_client(&self, client_id: &str) -> usize {
        let senders: Vec<mpsc::Sender<ShellCommand>> = self
            .terminals
            .read()
            .await
            .values()
            .filter(|t| t.client_id == client_id)
            .map(|t| t.commands.clone())
            .collect();
        for sender in &senders {
            let _ = sender.send(ShellCommand::Close).await;
        }
        senders.len()
    }

    pub async fn terminal_count(&self, session_id: &str) -> usize {
        self.terminals
            .read()
            .await
            .values()
            .filter(|t| t.session_id == session_id)
            .count()
    }

    async fn sender_for(
        &self,
        terminal_id: &str,
        client_id: &str,
    ) -> Result<(mpsc::Sender<ShellCommand>, String), MuxError> {
        let terminals = self.terminals.read().await;
        match terminals.get(terminal_id) {
            Some(t) if t.client_id == client_id => Ok((t.commands.clone(), t.session_id.clone())),
            _ => Err(MuxError::NotFound(format!("terminal {terminal_id}"))),
        }
    }
}

struct TerminalPump {
    terminal_id: String,
    session_id: String,
    channel: Box<dyn ShellChannel>,
    commands: mpsc::Receiver<ShellCommand>,
    client: ClientTx,
    cancel: CancellationToken,
    permit: ChannelPermit,
    bridge: ShellBridge,
}

impl TerminalPump {
    async fn run(mut self) {
        let settings = self.bridge.settings.clone();
        let mut wake = WakeSchedule::new(Instant::now(), settings.wake_grace, settings.wake_retry);
        let mut decoder = Utf8Chunker::default();

        let ending = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break Ending::SessionClosed,
                cmd = self.commands.recv() => match cmd {
                    Some(ShellCommand::Input(data)) => {
                        if let Err(e) = self.channel.write(&data).await {
                            break Ending::Failed(e);
                        }
                    }
                    Some(ShellCommand::Resize { cols, rows }) => {
                        if let Err(e) = self.channel.resize(cols.max(1), rows.max(1)).await {
                            debug!(terminal = %self.terminal_id, "Resize ignored: {e}");
                        }
                    }
                    Some(ShellCommand::Close) | None => break Ending::ClientClosed,
                },
                event = self.channel.next_event() => match event {
                    Some(ShellEvent::Output(bytes)) => {
                        wake.output_seen();
                        let text = decoder.push(&bytes);
                        if text.is_empty() {
                            continue;
                        }
                        let frame = json!({
                            "kind": "shell",
                            "action": "output",
                            "terminalId": self.terminal_id,
                            "data": text,
                        });
                        if !self.client.send_json(frame).await {
                            break Ending::ClientClosed;
                        }
                    }
                    Some(ShellEvent::Exit(code)) => break Ending::RemoteExit(code),
                    None => break Ending::RemoteExit(None),
                },
                () = wake::until(wake.next_deadline()) => {
                    if wake.fire() {
                        debug!(terminal = %self.terminal_id, "Silent shell, sending wake newline");
                        if let Err(e) = self.channel.write(b"\n").await {
                            break Ending::Failed(e);
                        }
                    }
                }
            }
        };

        self.finish(ending).await;
    }

    async fn finish(mut self, ending: Ending) {
        self.bridge.terminals.write().await.remove(&self.terminal_id);
        if !matches!(ending, Ending::RemoteExit(_)) {
            self.channel.close().await;
        }
        self.permit.release();

        let (frame, reason) = match ending {
            Ending::RemoteExit(code) => (
                json!({
                    "kind": "shell",
                    "action": "exit",
                    "terminalId": self.terminal_id,
                    "exitCode": code,
                    "reason": "exited",
                }),
                "exited",
            ),
            Ending::ClientClosed => (
                json!({
                    "kind": "shell",
                    "action": "exit",
                    "terminalId": self.terminal_id,
                    "reason": "closed",
                }),
                "closed",
            ),
            Ending::SessionClosed => (
                json!({
                    "kind": "shell",
                    "action": "exit",
                    "terminalId": self.terminal_id,
                    "reason": "session_closed",
                }),
                "session_closed",
            ),
            Ending::Failed(err) => {
                warn!(terminal = %self.terminal_id, "Terminal I/O failed: {err}");
                if err.is_connection_level() {
                    let registry = self.bridge.registry.clone();
                    let session_id = self.session_id.clone();
                    tokio::spawn(async move { registry.fail_transport(&session_id).await });
                }
                let mut frame = MuxError::from(err).to_frame("shell");
                frame["terminalId"] = json!(self.terminal_id);
                (frame, "failed")
            }
        };
        self.client.send_json(frame).await;

        info!(
            session = short_id(&self.session_id),
            terminal = %self.terminal_id,
            reason,
            "Terminal closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{Endpoint, RegistrySettings};
    use crate::transport::testing::FakeTransport;
    use crate::ws::Outbound;
    use serde_json::Value;
    use std::sync::atomic::Ordering;

    async fn setup() -> (
        ShellBridge,
        SessionRegistry,
        std::sync::Arc<FakeTransport>,
        String,
    ) {
        let registry = SessionRegistry::new(RegistrySettings {
            idle_timeout: Duration::from_secs(3600),
            channel_ceiling: 4,
            acquire_wait: Duration::from_millis(10),
        });
        let transport = FakeTransport::new();
        let session_id = registry
            .register(
                transport.clone(),
                "root",
                Endpoint {
                    host: "vps".into(),
                    port: 22,
                },
            )
            .await;
        let bridge = ShellBridge::new(
            registry.clone(),
            ShellSettings {
                term: "xterm-256color".into(),
                default_cols: 80,
                default_rows: 24,
                wake_grace: Duration::from_millis(500),
                wake_retry: Duration::from_millis(1500),
                open_timeout: Duration::from_secs(5),
            },
        );
        (bridge, registry, transport, session_id)
    }

    fn client() -> (ClientTx, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        (ClientTx::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Outbound::Json(v)) = rx.try_recv() {
            frames.push(v);
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_shell_woken_once_when_output_follows() {
        let (bridge, _registry, transport, sid) = setup().await;
        let (client, mut rx) = client();
        bridge.create(&sid, &client, None, None).await.unwrap();
        let probe = transport.shell(0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(probe.writes(), vec![b"\n".to_vec()]);

        probe.emit("root@vps:~# ");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.writes().len(), 1);

        let frames = drain(&mut rx);
        assert_eq!(frames[0]["action"], "created");
        assert_eq!(frames[1]["action"], "output");
        assert_eq!(frames[1]["data"], "root@vps:~# ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_before_grace_means_no_wake() {
        let (bridge, _registry, transport, sid) = setup().await;
        let (client, _rx) = client();
        bridge.create(&sid, &client, None, None).await.unwrap();
        let probe = transport.shell(0);

        probe.emit("$ ");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(probe.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_silent_shell_gets_two_newlines() {
        let (bridge, _registry, transport, sid) = setup().await;
        let (client, _rx) = client();
        bridge.create(&sid, &client, None, None).await.unwrap();
        let probe = transport.shell(0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.writes(), vec![b"\n".to_vec(), b"\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_client_disconnect_closes_channel_and_releases_permit() {
        let (bridge, registry, transport, sid) = setup().await;
        let handle = registry.lookup(&sid).await.unwrap();
        let before = handle.budget().open();

        let (client, _rx) = client();
        let terminal = bridge.create(&sid, &client, Some(120), Some(40)).await.unwrap();
        assert_eq!(handle.budget().open(), before + 1);
        let probe = transport.shell(0);
        assert_eq!(probe.pty.cols, 120);

        bridge.input(&terminal, client.id(), b"ls\n".to_vec()).await.unwrap();
        assert_eq!(bridge.close_client(client.id()).await, 1);

        tokio::time::timeout(Duration::from_secs(1), async {
            while handle.budget().open() != before {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(probe.closed.load(Ordering::SeqCst));
        assert_eq!(probe.writes(), vec![b"ls\n".to_vec()]);
        assert_eq!(bridge.terminal_count(&sid).await, 0);
    }

    #[tokio::test]
    async fn test_remote_exit_notifies_client() {
        let (bridge, registry, transport, sid) = setup().await;
        let handle = registry.lookup(&sid).await.unwrap();
        let (client, mut rx) = client();
        let terminal = bridge.create(&sid, &client, None, None).await.unwrap();

        let probe = transport.shell(0);
        probe.events.send(ShellEvent::Exit(Some(0))).unwrap();

        let exit = loop {
            match rx.recv().await {
                Some(Outbound::Json(v)) if v["action"] == "exit" => break v,
                Some(_) => {}
                None => panic!("client channel closed"),
            }
        };
        assert_eq!(exit["terminalId"], terminal.as_str());
        assert_eq!(exit["exitCode"], 0);
        assert_eq!(handle.budget().open(), 0);

        // Input after exit is rejected, resize is silently ignored.
        assert!(bridge.input(&terminal, client.id(), b"x".to_vec()).await.is_err());
        bridge.resize(&terminal, client.id(), 100, 30).await;
    }

    #[tokio::test]
    async fn test_other_client_cannot_drive_terminal() {
        let (bridge, _registry, _transport, sid) = setup().await;
        let (owner, _rx) = client();
        let (intruder, _rx2) = client();
        let terminal = bridge.create(&sid, &owner, None, None).await.unwrap();

        let err = bridge
            .input(&terminal, intruder.id(), b"rm -rf /\n".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_session_terminate_ends_terminals() {
        let (bridge, registry, transport, sid) = setup().await;
        let (client, mut rx) = client();
        bridge.create(&sid, &client, None, None).await.unwrap();

        registry
            .terminate(&sid, crate::sessions::CloseReason::Logout)
            .await;

        let exit = loop {
            match rx.recv().await {
                Some(Outbound::Json(v)) if v["action"] == "exit" => break v,
                Some(_) => {}
                None => panic!("client channel closed"),
            }
        };
        assert_eq!(exit["reason"], "session_closed");
        assert!(transport.shell(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_rejects_create() {
        let (bridge, _registry, _transport, sid) = setup().await;
        let (client, _rx) = client();
        for _ in 0..4 {
            bridge.create(&sid, &client, None, None).await.unwrap();
        }
        let err = bridge.create(&sid, &client, None, None).await.unwrap_err();
        assert!(matches!(err, MuxError::ChannelBudgetExceeded { .. }));
    }
}
