//! Raw TCP tunnels carried over WebSocket binary frames.
//!
//! Each WebSocket client owns at most one tunnel. Bytes from the target are
//! forwarded to the client as binary frames; binary frames from the client are
//! written to the target unmodified.
//!
//! Two routes reach the target:
//!
//! - **direct** — a TCP connection from this server (the display server is
//!   usually co-located).
//! - **ssh** — a `direct-tcpip` channel over the session's connection, which
//!   takes a `tunnel` permit.
//!
//! The session is checked once, at open. After that only the tunnel's own
//! sockets and the session's cancellation token end it.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MuxError;
use crate::sessions::{ChannelKind, ChannelPermit, SessionRegistry};
use crate::transport::BoxedStream;
use crate::util::short_id;
use crate::ws::ClientTx;

const RELAY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelRoute {
    #[default]
    Direct,
    Ssh,
}

impl TunnelRoute {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Ssh => "ssh",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub connect_timeout: Duration,
    pub default_route: TunnelRoute,
}

struct TunnelEntry {
    tunnel_id: String,
    session_id: String,
    writer: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

enum RelayEnd {
    TargetClosed,
    ClosedLocally,
    ClientGone,
    Failed(io::Error),
}

#[derive(Clone)]
pub struct TunnelProxy {
    registry: SessionRegistry,
    /// Keyed by WebSocket client id.
    tunnels: Arc<Mutex<HashMap<String, TunnelEntry>>>,
    settings: Arc<TunnelSettings>,
}

impl TunnelProxy {
    pub fn new(registry: SessionRegistry, settings: TunnelSettings) -> Self {
        Self {
            registry,
            tunnels: Arc::new(Mutex::new(HashMap::new())),
            settings: Arc::new(settings),
        }
    }

    /// Connect to `host:port` and bind the tunnel to `client`, replacing any
    /// tunnel the client already had. Returns the tunnel id.
    pub async fn open(
        &self,
        session_id: &str,
        client: &ClientTx,
        host: &str,
        port: u16,
        route: Option<TunnelRoute>,
    ) -> Result<String, MuxError> {
        if host.is_empty() || port == 0 {
            return Err(MuxError::InvalidRequest(
                "targetHost and a non-zero targetPort are required".into(),
            ));
        }
        let handle = self.registry.lookup(session_id).await?;
        self.close(client.id()).await;

        let route = route.unwrap_or(self.settings.default_route);
        let (stream, permit) = match route {
            TunnelRoute::Direct => {
                let stream = timeout(self.settings.connect_timeout, TcpStream::connect((host, port)))
                    .await
                    .map_err(|_| {
                        MuxError::ChannelOpenFailed(format!("{host}:{port} connect timed out"))
                    })?
                    .map_err(|e| MuxError::ChannelOpenFailed(format!("{host}:{port}: {e}")))?;
                let _ = stream.set_nodelay(true);
                (Box::new(stream) as BoxedStream, None)
            }
            TunnelRoute::Ssh => {
                let permit = handle.acquire(ChannelKind::Tunnel).await?;
                let opened = timeout(
                    self.settings.connect_timeout,
                    handle.transport().open_direct_tcpip(host, port),
                )
                .await;
                match opened {
                    Ok(Ok(stream)) => (stream, Some(permit)),
                    Ok(Err(e)) => return Err(self.registry.open_failed(session_id, e).await),
                    Err(_) => {
                        return Err(MuxError::ChannelOpenFailed(format!(
                            "{host}:{port} via ssh timed out"
                        )))
                    }
                }
            }
        };
        self.registry.touch(session_id).await;

        let tunnel_id = Uuid::new_v4().to_string();
        let (writer, writes) = mpsc::channel(64);
        let cancel = handle.cancel_token().child_token();
        self.tunnels.lock().await.insert(
            client.id().to_string(),
            TunnelEntry {
                tunnel_id: tunnel_id.clone(),
                session_id: session_id.to_string(),
                writer,
                cancel: cancel.clone(),
            },
        );

        info!(
            session = short_id(session_id),
            tunnel = %tunnel_id,
            target = %format!("{host}:{port}"),
            route = route.as_str(),
            "Tunnel opened"
        );

        let relay = Relay {
            proxy: self.clone(),
            tunnel_id: tunnel_id.clone(),
            client: client.clone(),
            stream,
            writes,
            cancel,
            permit,
        };
        tokio::spawn(relay.run());
        Ok(tunnel_id)
    }

    /// Queue client bytes for the client's tunnel. Returns `false` when the
    /// client has no open tunnel.
    pub async fn forward(&self, client_id: &str, data: Vec<u8>) -> bool {
        let target = self
            .tunnels
            .lock()
            .await
            .get(client_id)
            .map(|t| (t.writer.clone(), t.session_id.clone()));
        let Some((writer, session_id)) = target else {
            return false;
        };
        if writer.send(data).await.is_err() {
            return false;
        }
        self.registry.touch(&session_id).await;
        true
    }

    /// Tear down the client's tunnel, if any.
    pub async fn close(&self, client_id: &str) -> bool {
        let removed = self.tunnels.lock().await.remove(client_id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn tunnel_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    /// Remove the client's entry only if it still belongs to `tunnel_id`; a
    /// replacement tunnel may already sit under the same client.
    async fn forget(&self, client_id: &str, tunnel_id: &str) {
        let mut tunnels = self.tunnels.lock().await;
        if tunnels
            .get(client_id)
            .is_some_and(|t| t.tunnel_id == tunnel_id)
        {
            tunnels.remove(client_id);
        }
    }
}

/// TCP reachability check for the display target.
pub async fn probe(host: &str, port: u16, limit: Duration) -> bool {
    matches!(
        timeout(limit, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

struct Relay {
    proxy: TunnelProxy,
    tunnel_id: String,
    client: ClientTx,
    stream: BoxedStream,
    writes: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    permit: Option<ChannelPermit>,
}

impl Relay {
    async fn run(mut self) {
        let mut buf = vec![0u8; RELAY_BUF_SIZE];
        let end = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break RelayEnd::ClosedLocally,
                result = self.stream.read(&mut buf) => match result {
                    Ok(0) => break RelayEnd::TargetClosed,
                    Ok(n) => {
                        if !self.client.send_binary(buf[..n].to_vec()).await {
                            break RelayEnd::ClientGone;
                        }
                    }
                    Err(e) => break RelayEnd::Failed(e),
                },
                data = self.writes.recv() => match data {
                    Some(data) => {
                        if let Err(e) = self.stream.write_all(&data).await {
                            break RelayEnd::Failed(e);
                        }
                    }
                    None => break RelayEnd::ClosedLocally,
                },
            }
        };

        let _ = self.stream.shutdown().await;
        drop(self.stream);
        drop(self.permit.take());
        self.proxy.forget(self.client.id(), &self.tunnel_id).await;

        let closed = json!({
            "kind": "tunnel",
            "action": "closed",
            "tunnelId": self.tunnel_id,
        });
        match end {
            RelayEnd::Failed(e) => {
                warn!(tunnel = %self.tunnel_id, "Tunnel failed: {e}");
                let mut frame: Value = MuxError::UpstreamIo(e.to_string()).to_frame("tunnel");
                frame["tunnelId"] = json!(self.tunnel_id);
                self.client.send_json(frame).await;
                self.client.send_json(closed).await;
            }
            RelayEnd::TargetClosed | RelayEnd::ClosedLocally => {
                debug!(tunnel = %self.tunnel_id, "Tunnel closed");
                self.client.send_json(closed).await;
            }
            RelayEnd::ClientGone => {
                debug!(tunnel = %self.tunnel_id, "Tunnel client went away");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{CloseReason, Endpoint, RegistrySettings};
    use crate::transport::testing::FakeTransport;
    use crate::ws::Outbound;
    use std::sync::atomic::Ordering;
    use tokio::net::TcpListener;

    async fn setup() -> (TunnelProxy, SessionRegistry, Arc<FakeTransport>, String) {
        let registry = SessionRegistry::new(RegistrySettings {
            idle_timeout: Duration::from_secs(3600),
            channel_ceiling: 2,
            acquire_wait: Duration::from_millis(10),
        });
        let transport = FakeTransport::new();
        let sid = registry
            .register(
                transport.clone(),
                "alice",
                Endpoint {
                    host: "box".into(),
                    port: 22,
                },
            )
            .await;
        let proxy = TunnelProxy::new(
            registry.clone(),
            TunnelSettings {
                connect_timeout: Duration::from_secs(2),
                default_route: TunnelRoute::Direct,
            },
        );
        (proxy, registry, transport, sid)
    }

    async fn next_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        loop {
            match rx.recv().await {
                Some(Outbound::Json(v)) => return v,
                Some(Outbound::Binary(_)) => continue,
                None => panic!("client channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_direct_tunnel_pumps_both_ways() {
        let (proxy, _registry, _transport, sid) = setup().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::channel(16);
        let client = ClientTx::new(tx);

        proxy.open(&sid, &client, "127.0.0.1", port, None).await.unwrap();
        let (mut target, _) = listener.accept().await.unwrap();

        target.write_all(b"RFB 003.008\n").await.unwrap();
        match rx.recv().await {
            Some(Outbound::Binary(data)) => assert_eq!(data, b"RFB 003.008\n"),
            _ => panic!("expected binary frame"),
        }

        assert!(proxy.forward(client.id(), b"hello".to_vec()).await);
        let mut buf = [0u8; 5];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(target);
        let frame = next_json(&mut rx).await;
        assert_eq!(frame["action"], "closed");
        assert_eq!(proxy.tunnel_count().await, 0);
        assert!(!proxy.forward(client.id(), b"late".to_vec()).await);
    }

    #[tokio::test]
    async fn test_client_close_releases_ssh_channel() {
        let (proxy, registry, transport, sid) = setup().await;
        let (tx, mut rx) = mpsc::channel(16);
        let client = ClientTx::new(tx);

        proxy
            .open(&sid, &client, "localhost", 5900, Some(TunnelRoute::Ssh))
            .await
            .unwrap();
        let handle = registry.lookup(&sid).await.unwrap();
        assert_eq!(handle.budget().open_of(ChannelKind::Tunnel), 1);
        let (host, port, mut remote) = transport.take_tunnel().unwrap();
        assert_eq!((host.as_str(), port), ("localhost", 5900));

        assert!(proxy.close(client.id()).await);
        let frame = next_json(&mut rx).await;
        assert_eq!(frame["action"], "closed");
        assert_eq!(handle.budget().open(), 0);

        let mut buf = Vec::new();
        assert_eq!(remote.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_ssh_open_does_not_block_other_channels() {
        let (proxy, registry, transport, sid) = setup().await;
        let handle = registry.lookup(&sid).await.unwrap();
        let (release, started) = transport.hold_next_tunnel_open();

        let (tx_a, _rx_a) = mpsc::channel(16);
        let slow_client = ClientTx::new(tx_a);
        let slow = {
            let proxy = proxy.clone();
            let sid = sid.clone();
            let client = slow_client.clone();
            tokio::spawn(async move {
                proxy
                    .open(&sid, &client, "10.0.0.9", 5900, Some(TunnelRoute::Ssh))
                    .await
            })
        };
        started.await.unwrap();

        let (tx_b, _rx_b) = mpsc::channel(16);
        let fast_client = ClientTx::new(tx_b);
        tokio::time::timeout(
            Duration::from_secs(1),
            proxy.open(&sid, &fast_client, "localhost", 5901, Some(TunnelRoute::Ssh)),
        )
        .await
        .expect("second tunnel waited on the stalled one")
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle.transport().open_files())
            .await
            .expect("file channel waited on the stalled tunnel")
            .unwrap();

        release.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(proxy.tunnel_count().await, 2);
    }

    #[tokio::test]
    async fn test_target_error_reported_once() {
        let (proxy, registry, transport, sid) = setup().await;
        transport.break_tunnels.store(true, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel(16);
        let client = ClientTx::new(tx);

        proxy
            .open(&sid, &client, "localhost", 5900, Some(TunnelRoute::Ssh))
            .await
            .unwrap();

        let error = next_json(&mut rx).await;
        assert_eq!(error["action"], "error");
        assert_eq!(error["code"], "UPSTREAM_IO_FAILURE");
        let closed = next_json(&mut rx).await;
        assert_eq!(closed["action"], "closed");
        assert_eq!(closed["tunnelId"], error["tunnelId"]);

        // The tunnel failure leaves the session and the client connection alone.
        assert!(registry.lookup(&sid).await.is_ok());
        assert!(!client.is_closed());
        assert_eq!(proxy.tunnel_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_open_replaces_first() {
        let (proxy, registry, _transport, sid) = setup().await;
        let (tx, mut rx) = mpsc::channel(16);
        let client = ClientTx::new(tx);

        let first = proxy
            .open(&sid, &client, "localhost", 5900, Some(TunnelRoute::Ssh))
            .await
            .unwrap();
        let second = proxy
            .open(&sid, &client, "localhost", 5901, Some(TunnelRoute::Ssh))
            .await
            .unwrap();
        assert_ne!(first, second);

        let frame = next_json(&mut rx).await;
        assert_eq!(frame["tunnelId"], first);
        assert_eq!(proxy.tunnel_count().await, 1);
        let handle = registry.lookup(&sid).await.unwrap();
        assert_eq!(handle.budget().open_of(ChannelKind::Tunnel), 1);
    }

    #[tokio::test]
    async fn test_session_teardown_closes_tunnel() {
        let (proxy, registry, _transport, sid) = setup().await;
        let (tx, mut rx) = mpsc::channel(16);
        let client = ClientTx::new(tx);

        proxy
            .open(&sid, &client, "localhost", 5900, Some(TunnelRoute::Ssh))
            .await
            .unwrap();
        registry.terminate(&sid, CloseReason::Logout).await;

        let frame = next_json(&mut rx).await;
        assert_eq!(frame["action"], "closed");
        assert_eq!(proxy.tunnel_count().await, 0);
    }

    #[tokio::test]
    async fn test_open_rejects_bad_target() {
        let (proxy, _registry, _transport, sid) = setup().await;
        let (tx, _rx) = mpsc::channel(16);
        let client = ClientTx::new(tx);
        let err = proxy.open(&sid, &client, "", 5900, None).await.unwrap_err();
        assert!(matches!(err, MuxError::InvalidRequest(_)));
        let err = proxy
            .open("missing", &client, "localhost", 5900, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe("127.0.0.1", port, Duration::from_secs(1)).await);
        drop(listener);
        assert!(!probe("127.0.0.1", port, Duration::from_secs(1)).await);
    }
}
