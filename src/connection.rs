//! A single bidirectional WebSocket connection: read pump, write pump,
//! heartbeat, and the wire envelope types both pumps speak (spec §4.4/§4.8).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::Hub;

/// Frames larger than this are rejected outright (spec §4.4).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
/// Capacity of a Connection's bounded outbound queue (spec §4.4).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(54);

/// Inbound envelope shapes a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEnvelope {
    Auth { payload: AuthPayload },
    #[serde(rename = "room.join")]
    RoomJoin { payload: RoomPayload },
    #[serde(rename = "room.leave")]
    RoomLeave { payload: RoomPayload },
    #[serde(rename = "message.send")]
    MessageSend { payload: MessageSendPayload },
    #[serde(rename = "typing.start")]
    TypingStart { payload: RoomPayload },
    #[serde(rename = "typing.stop")]
    TypingStop { payload: RoomPayload },
    #[serde(rename = "receipt.read")]
    ReceiptRead { payload: ReceiptReadPayload },
}

/// Untyped envelope shape, used to tell "unknown `type`" apart from
/// "malformed JSON" before attempting the strongly-typed parse (spec §4.8).
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

const KNOWN_INBOUND_TYPES: &[&str] = &[
    "auth",
    "room.join",
    "room.leave",
    "message.send",
    "typing.start",
    "typing.stop",
    "receipt.read",
];

fn parse_inbound(text: &str) -> Result<InboundEnvelope, OutboundEnvelope> {
    let raw: RawEnvelope = serde_json::from_str(text)
        .map_err(|_| OutboundEnvelope::error("invalid_message", "malformed JSON"))?;

    if !KNOWN_INBOUND_TYPES.contains(&raw.kind.as_str()) {
        return Err(OutboundEnvelope::error(
            "unknown_event",
            &format!("unrecognized type: {}", raw.kind),
        ));
    }

    serde_json::from_str(text)
        .map_err(|_| OutboundEnvelope::error("invalid_message", "payload did not match type"))
}

#[derive(Debug, Deserialize)]
pub struct AuthPayload {
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RoomPayload {
    pub conversation_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MessageSendPayload {
    pub conversation_id: Uuid,
    pub body_text: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<Uuid>,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReceiptReadPayload {
    pub message_id: Uuid,
}

/// Server-to-client envelope. Payload is left as `Value` since each server
/// event has a distinct shape; producers build it with `serde_json::json!`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OutboundEnvelope {
    pub fn new(kind: &'static str, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(
            "error",
            serde_json::json!({ "code": code, "message": message }),
        )
    }
}

/// Per-connection identity and room membership, guarded by a single mutex
/// (spec §4.4: "per-connection state under a single mutex").
#[derive(Default)]
pub struct ConnectionState {
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub joined_rooms: HashSet<Uuid>,
}

impl ConnectionState {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// A cheap, cloneable reference to a live connection — what the Hub stores
/// in its directories. Sending never blocks; a full queue means the frame
/// is dropped (spec §4.4's deliberate liveness-over-delivery policy).
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    sender: mpsc::Sender<OutboundEnvelope>,
    pub state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionHandle {
    pub fn send(&self, envelope: OutboundEnvelope) {
        if self.sender.try_send(envelope).is_err() {
            warn!(connection_id = %self.id, "outbound buffer full, dropping frame");
            crate::metrics::record_frame_dropped();
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.state.lock().user_id
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}

/// Drive one upgraded WebSocket end to end: spawns the write pump, then runs
/// the read pump on the calling task until the socket closes or a deadline
/// trips, unregistering from the Hub on the way out either way.
pub async fn run(socket: WebSocket, hub: Arc<Hub>) {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let state = Arc::new(Mutex::new(ConnectionState::default()));
    let handle = ConnectionHandle {
        id,
        sender: tx,
        state: state.clone(),
    };
    let cancel = CancellationToken::new();

    hub.register(handle.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    let write_task = tokio::spawn(write_pump(rx, cancel.clone()).run(&mut ws_tx));

    let read_result = read_pump(&mut ws_rx, &hub, &handle, &cancel).await;
    if let Err(e) = read_result {
        debug!(connection_id = %id, error = %e, "read pump ended");
    }

    cancel.cancel();
    let _ = write_task.await;
    hub.unregister(&handle);
}

use futures::stream::{SplitSink, SplitStream, StreamExt};

async fn read_pump(
    ws_rx: &mut SplitStream<WebSocket>,
    hub: &Arc<Hub>,
    handle: &ConnectionHandle,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let frame = tokio::select! {
            frame = timeout(READ_DEADLINE, ws_rx.next()) => frame,
            _ = cancel.cancelled() => return Ok(()),
        };

        let Ok(Some(frame)) = frame else {
            return Ok(());
        };

        let msg = frame?;
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => return Ok(()),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => continue,
        };

        if text.len() > MAX_FRAME_SIZE {
            handle.send(OutboundEnvelope::error("invalid_message", "frame too large"));
            continue;
        }

        let envelope = match parse_inbound(&text) {
            Ok(env) => env,
            Err(error_envelope) => {
                handle.send(error_envelope);
                continue;
            }
        };

        let is_authenticated = handle.state.lock().is_authenticated();
        if !is_authenticated && !matches!(envelope, InboundEnvelope::Auth { .. }) {
            handle.send(OutboundEnvelope::error(
                "not_authenticated",
                "send an auth envelope first",
            ));
            continue;
        }

        hub.dispatch(handle, envelope).await;
    }
}

struct WritePump {
    rx: mpsc::Receiver<OutboundEnvelope>,
    cancel: CancellationToken,
}

fn write_pump(rx: mpsc::Receiver<OutboundEnvelope>, cancel: CancellationToken) -> WritePump {
    WritePump { rx, cancel }
}

impl WritePump {
    async fn run(mut self, ws_tx: &mut SplitSink<WebSocket, WsMessage>) {
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                maybe_envelope = self.rx.recv() => {
                    let Some(envelope) = maybe_envelope else { break };
                    if self.send_one(ws_tx, &envelope).await.is_err() {
                        break;
                    }
                    // Coalesce anything already queued before waiting again.
                    while let Ok(more) = self.rx.try_recv() {
                        if self.send_one(ws_tx, &more).await.is_err() {
                            return;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if timeout(WRITE_DEADLINE, ws_tx.send(WsMessage::Ping(Vec::new()))).await.is_err() {
                        break;
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    }

    async fn send_one(
        &self,
        ws_tx: &mut SplitSink<WebSocket, WsMessage>,
        envelope: &OutboundEnvelope,
    ) -> Result<(), ()> {
        let Ok(json) = serde_json::to_string(envelope) else {
            return Ok(());
        };
        timeout(WRITE_DEADLINE, ws_tx.send(WsMessage::Text(json)))
            .await
            .map_err(|_| ())?
            .map_err(|_| ())
    }
}

use futures::SinkExt;

#[cfg(test)]
impl ConnectionHandle {
    /// Builds a standalone handle backed by a real channel, for tests in
    /// other modules (e.g. `hub`) that need something to deliver to without
    /// driving a real socket through `run`.
    pub fn for_test(user_id: Option<Uuid>) -> (Self, mpsc::Receiver<OutboundEnvelope>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let state = Arc::new(Mutex::new(ConnectionState {
            user_id,
            ..Default::default()
        }));
        (
            Self {
                id: Uuid::new_v4(),
                sender: tx,
                state,
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_code_and_message() {
        let env = OutboundEnvelope::error("not_member", "join the room first");
        assert_eq!(env.kind, "error");
        assert_eq!(env.payload["code"], "not_member");
    }

    #[test]
    fn parses_message_send_envelope() {
        let json = serde_json::json!({
            "type": "message.send",
            "payload": {
                "conversation_id": Uuid::new_v4(),
                "body_text": "hi",
                "temp_id": "abc-123"
            }
        })
        .to_string();
        let parsed: InboundEnvelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, InboundEnvelope::MessageSend { .. }));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let json = r#"{"type":"bogus","payload":{}}"#;
        assert!(serde_json::from_str::<InboundEnvelope>(json).is_err());
    }
}
