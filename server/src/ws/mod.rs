//! WebSocket surface: terminals, tunnels and live diagnostics.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws?session=<sessionId>`. The session is
//!    validated before the upgrade completes.
//! 2. Text frames are JSON objects with `kind` and `action` fields. An
//!    optional `requestId` is echoed on the direct response. Messages may name
//!    another `sessionId`; by default the connection's own session is used.
//! 3. Binary frames carry tunnel bytes for this connection's tunnel.
//! 4. On disconnect every terminal, tunnel and diagnostics subscription bound
//!    to the connection is closed. When the session itself ends the server
//!    sends `session.closed` and drops the connection.
//!
//! ## Messages (client → server)
//!
//! | kind          | action        | Fields                                | Response                |
//! |---------------|---------------|---------------------------------------|-------------------------|
//! | `ping`        | —             | —                                     | `pong`                  |
//! | `shell`       | `create`      | `cols?`, `rows?`                      | `created` or `error`    |
//! | `shell`       | `input`       | `terminalId`, `data`                  | (`error` on failure)    |
//! | `shell`       | `resize`      | `terminalId`, `cols`, `rows`          | —                       |
//! | `shell`       | `close`       | `terminalId`                          | `exit` (from the pump)  |
//! | `tunnel`      | `open`        | `targetHost?`, `targetPort?`, `via?`  | `opened` or `error`     |
//! | `tunnel`      | `close`       | —                                     | `closed`                |
//! | `diagnostics` | `subscribe`   | `intervalMs?`                         | `subscribed`, then `snapshot` per tick |
//! | `diagnostics` | `unsubscribe` | —                                     | `unsubscribed`          |
//!
//! ## Messages (server → client)
//!
//! | kind          | action      | Key fields                                     |
//! |---------------|-------------|------------------------------------------------|
//! | `pong`        | —           | —                                              |
//! | `shell`       | `created`   | `terminalId`, `sessionId`, `cols`, `rows`      |
//! | `shell`       | `output`    | `terminalId`, `data`                           |
//! | `shell`       | `exit`      | `terminalId`, `reason`, `exitCode?`            |
//! | `tunnel`      | `opened`    | `tunnelId`                                     |
//! | `tunnel`      | `closed`    | `tunnelId`                                     |
//! | `diagnostics` | `snapshot`  | `snapshot`                                     |
//! | `session`     | `closed`    | —                                              |
//! | any           | `error`     | `code`, `message`                              |
//! | `error`       | —           | `code` (`INVALID_JSON`, `UNKNOWN_TYPE`), `message` |

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::MuxError;
use crate::tunnel::TunnelRoute;
use crate::util::short_id;
use crate::AppState;

/// How long queued frames get to drain after the read loop ends.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

/// A frame queued for one WebSocket client.
#[derive(Debug)]
pub enum Outbound {
    Json(Value),
    Binary(Vec<u8>),
}

/// Sending half of one WebSocket client, shared by every task that produces
/// frames for it. Sends fail once the client is gone.
#[derive(Clone)]
pub struct ClientTx {
    id: Arc<str>,
    tx: mpsc::Sender<Outbound>,
}

impl ClientTx {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4().to_string().into(),
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send_json(&self, frame: Value) -> bool {
        self.tx.send(Outbound::Json(frame)).await.is_ok()
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> bool {
        self.tx.send(Outbound::Binary(data)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Session token; browsers cannot set headers on a WebSocket upgrade.
    pub session: String,
}

/// `GET /api/ws?session=<id>` — WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let handle = match state.registry.lookup(&query.session).await {
        Ok(handle) => handle,
        Err(e) => return e.into_response(),
    };
    let session_closed = handle.cancel_token().clone();
    ws.on_upgrade(move |socket| handle_ws(socket, state, query.session, session_closed))
}

/// Per-connection dispatch state.
struct WsContext {
    state: AppState,
    client: ClientTx,
    session_id: String,
    poller: Option<JoinHandle<()>>,
}

fn with_request_id(mut frame: Value, request_id: Option<&str>) -> Value {
    if let Some(rid) = request_id {
        frame["requestId"] = json!(rid);
    }
    frame
}

fn protocol_error(code: &str, message: &str) -> Value {
    json!({"kind": "error", "code": code, "message": message})
}

fn u16_field(parsed: &Value, name: &str) -> Option<u16> {
    parsed[name].as_u64().and_then(|v| u16::try_from(v).ok())
}

/// Parse one text frame. Returns the error frame to send on failure.
fn parse_message(text: &str) -> Result<Value, Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(parsed) if parsed.is_object() && parsed["kind"].is_string() => Ok(parsed),
        Ok(_) => Err(protocol_error(
            "UNKNOWN_TYPE",
            "Message must be an object with a \"kind\" field",
        )),
        Err(_) => Err(protocol_error("INVALID_JSON", "Failed to parse JSON message")),
    }
}

async fn handle_ws(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    session_closed: CancellationToken,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);
    let client = ClientTx::new(tx);

    info!(
        session = short_id(&session_id),
        client = client.id(),
        "WebSocket connected"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Outbound::Json(value) => match serde_json::to_string(&value) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        error!("WS send: failed to serialize message: {e}");
                        continue;
                    }
                },
                Outbound::Binary(data) => Message::Binary(data.into()),
            };
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ctx = WsContext {
        state,
        client,
        session_id,
        poller: None,
    };

    loop {
        tokio::select! {
            () = session_closed.cancelled() => {
                ctx.client
                    .send_json(json!({"kind": "session", "action": "closed"}))
                    .await;
                break;
            }
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    Message::Text(text) => match parse_message(&text) {
                        Ok(parsed) => dispatch(&mut ctx, &parsed).await,
                        Err(frame) => {
                            ctx.client.send_json(frame).await;
                        }
                    },
                    Message::Binary(data) => {
                        if !ctx.state.tunnels.forward(ctx.client.id(), data.to_vec()).await {
                            debug!(client = ctx.client.id(), "Binary frame without a tunnel dropped");
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    let client_id = ctx.client.id().to_string();
    let terminals = ctx.state.shells.close_client(&client_id).await;
    ctx.state.tunnels.close(&client_id).await;
    if let Some(poller) = ctx.poller.take() {
        poller.abort();
    }
    info!(
        session = short_id(&ctx.session_id),
        client = %client_id,
        terminals,
        "WebSocket disconnected"
    );

    drop(ctx);
    let _ = tokio::time::timeout(FLUSH_GRACE, &mut send_task).await;
    send_task.abort();
}

/// Route one parsed message by `kind`/`action`.
async fn dispatch(ctx: &mut WsContext, parsed: &Value) {
    let kind = parsed["kind"].as_str().unwrap_or("");
    let action = parsed["action"].as_str().unwrap_or("");
    let request_id = parsed["requestId"].as_str();
    let session_id = parsed["sessionId"]
        .as_str()
        .filter(|s| !s.is_empty())
        .unwrap_or(&ctx.session_id)
        .to_string();

    let result = match (kind, action) {
        ("ping", _) => {
            ctx.client
                .send_json(with_request_id(json!({"kind": "pong"}), request_id))
                .await;
            Ok(())
        }
        ("shell", _) => handle_shell(ctx, action, &session_id, parsed).await,
        ("tunnel", _) => handle_tunnel(ctx, action, &session_id, parsed, request_id).await,
        ("diagnostics", _) => handle_diagnostics(ctx, action, &session_id, parsed, request_id).await,
        _ => Err(None),
    };

    match result {
        Ok(()) => {}
        Err(Some(e)) => {
            ctx.client
                .send_json(with_request_id(e.to_frame(kind), request_id))
                .await;
        }
        Err(None) => {
            let message = format!("Unknown message kind/action: {kind}/{action}");
            ctx.client
                .send_json(with_request_id(protocol_error("UNKNOWN_TYPE", &message), request_id))
                .await;
        }
    }
}

/// `Err(None)` means the action is unknown for this kind.
type Handled = Result<(), Option<MuxError>>;

async fn handle_shell(ctx: &mut WsContext, action: &str, session_id: &str, parsed: &Value) -> Handled {
    let shells = &ctx.state.shells;
    let terminal_id = parsed["terminalId"].as_str().unwrap_or("");
    match action {
        "create" => {
            let cols = u16_field(parsed, "cols");
            let rows = u16_field(parsed, "rows");
            shells.create(session_id, &ctx.client, cols, rows).await?;
            Ok(())
        }
        "input" => {
            let data = parsed["data"].as_str().unwrap_or("");
            if terminal_id.is_empty() {
                return Err(Some(MuxError::InvalidRequest("terminalId is required".into())));
            }
            shells
                .input(terminal_id, ctx.client.id(), data.as_bytes().to_vec())
                .await
                .map_err(Some)
        }
        "resize" => {
            let (Some(cols), Some(rows)) = (u16_field(parsed, "cols"), u16_field(parsed, "rows"))
            else {
                return Err(Some(MuxError::InvalidRequest(
                    "cols and rows are required".into(),
                )));
            };
            shells.resize(terminal_id, ctx.client.id(), cols, rows).await;
            Ok(())
        }
        "close" => {
            shells.close(terminal_id, ctx.client.id()).await;
            Ok(())
        }
        _ => Err(None),
    }
}

async fn handle_tunnel(
    ctx: &mut WsContext,
    action: &str,
    session_id: &str,
    parsed: &Value,
    request_id: Option<&str>,
) -> Handled {
    let tunnels = &ctx.state.tunnels;
    match action {
        "open" => {
            let defaults = &ctx.state.config.tunnel;
            let host = parsed["targetHost"]
                .as_str()
                .unwrap_or(&defaults.default_host)
                .to_string();
            let port = match parsed.get("targetPort") {
                Some(v) if !v.is_null() => v
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| Some(MuxError::InvalidRequest("Invalid targetPort".into())))?,
                _ => defaults.default_port,
            };
            let route = match parsed.get("via") {
                Some(v) if !v.is_null() => Some(
                    serde_json::from_value::<TunnelRoute>(v.clone())
                        .map_err(|_| Some(MuxError::InvalidRequest(format!("Unknown route: {v}"))))?,
                ),
                _ => None,
            };
            let tunnel_id = tunnels
                .open(session_id, &ctx.client, &host, port, route)
                .await?;
            ctx.client
                .send_json(with_request_id(
                    json!({
                        "kind": "tunnel",
                        "action": "opened",
                        "tunnelId": tunnel_id,
                        "targetHost": host,
                        "targetPort": port,
                    }),
                    request_id,
                ))
                .await;
            Ok(())
        }
        "close" => {
            if !tunnels.close(ctx.client.id()).await {
                ctx.client
                    .send_json(with_request_id(
                        json!({"kind": "tunnel", "action": "closed"}),
                        request_id,
                    ))
                    .await;
            }
            Ok(())
        }
        _ => Err(None),
    }
}

async fn handle_diagnostics(
    ctx: &mut WsContext,
    action: &str,
    session_id: &str,
    parsed: &Value,
    request_id: Option<&str>,
) -> Handled {
    match action {
        "subscribe" => {
            ctx.state.registry.lookup(session_id).await?;
            let sampler = &ctx.state.diagnostics;
            let interval = sampler.interval_for(parsed["intervalMs"].as_u64());
            if let Some(previous) = ctx.poller.take() {
                previous.abort();
            }
            ctx.client
                .send_json(with_request_id(
                    json!({
                        "kind": "diagnostics",
                        "action": "subscribed",
                        "intervalMs": u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                    }),
                    request_id,
                ))
                .await;
            ctx.poller = Some(sampler.spawn_poller(
                session_id.to_string(),
                ctx.client.clone(),
                interval,
            ));
            Ok(())
        }
        "unsubscribe" => {
            if let Some(poller) = ctx.poller.take() {
                poller.abort();
            }
            ctx.client
                .send_json(with_request_id(
                    json!({"kind": "diagnostics", "action": "unsubscribed"}),
                    request_id,
                ))
                .await;
            Ok(())
        }
        _ => Err(None),
    }
}
