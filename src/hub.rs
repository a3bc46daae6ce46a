//! Process-singleton routing directory: who is connected, which rooms they
//! are in, and the PubSub subscriptions backing each room (spec §4.5).
//!
//! `DashMap` gives every external caller lock-free reads/writes to the
//! directories directly — there is no separate actor loop serializing
//! access, because `DashMap`'s per-shard locking already gives the
//! single-writer-per-key guarantee the spec asks for without forcing every
//! mutation through a channel.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{ConnectionHandle, InboundEnvelope, OutboundEnvelope};
use crate::error::CoreError;
use crate::pubsub::{Envelope, PubSub, Subscription, Topics};
use crate::store::{self, DbPool};
use crate::token::TokenService;

pub struct Hub {
    clients: DashMap<Uuid, Vec<ConnectionHandle>>,
    rooms: Arc<DashMap<Uuid, Vec<ConnectionHandle>>>,
    room_subs: DashMap<Uuid, Subscription>,
    pubsub: Arc<dyn PubSub>,
    store: DbPool,
    tokens: TokenService,
    instance_id: String,
}

impl Hub {
    pub fn new(
        store: DbPool,
        pubsub: Arc<dyn PubSub>,
        tokens: TokenService,
        instance_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            rooms: Arc::new(DashMap::new()),
            room_subs: DashMap::new(),
            pubsub,
            store,
            tokens,
            instance_id: instance_id.into(),
        })
    }

    pub fn active_connection_count(&self) -> usize {
        self.clients.iter().map(|e| e.value().len()).sum()
    }

    pub fn active_room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Register a freshly upgraded, not-yet-authenticated connection. It is
    /// not added to `clients` until `auth` succeeds.
    pub fn register(&self, _handle: ConnectionHandle) {}

    /// Remove a connection from every directory it appears in, dropping any
    /// room subscription whose last local member just left.
    pub fn unregister(&self, handle: &ConnectionHandle) {
        if let Some(user_id) = handle.user_id() {
            if let Some(mut conns) = self.clients.get_mut(&user_id) {
                conns.retain(|c| c.id != handle.id);
                if conns.is_empty() {
                    drop(conns);
                    self.clients.remove(&user_id);
                }
            }
        }

        let joined: Vec<Uuid> = handle.state.lock().joined_rooms.iter().copied().collect();
        for conversation_id in joined {
            self.leave_room_internal(handle, conversation_id);
        }
        crate::metrics::set_active_connections(self.active_connection_count());
        crate::metrics::set_active_rooms(self.active_room_count());
    }

    pub async fn dispatch(&self, handle: &ConnectionHandle, envelope: InboundEnvelope) {
        let result = match envelope {
            InboundEnvelope::Auth { payload } => self.handle_auth(handle, payload).await,
            InboundEnvelope::RoomJoin { payload } => {
                self.join_room(handle, payload.conversation_id).await
            }
            InboundEnvelope::RoomLeave { payload } => {
                self.leave_room_internal(handle, payload.conversation_id);
                Ok(())
            }
            InboundEnvelope::MessageSend { payload } => {
                self.handle_message_send(
                    handle,
                    payload.conversation_id,
                    payload.body_text,
                    payload.attachment_id,
                    payload.temp_id,
                )
                .await
            }
            InboundEnvelope::TypingStart { payload } => {
                self.broadcast_typing(handle, payload.conversation_id, true).await
            }
            InboundEnvelope::TypingStop { payload } => {
                self.broadcast_typing(handle, payload.conversation_id, false).await
            }
            InboundEnvelope::ReceiptRead { payload } => {
                self.handle_receipt_read(handle, payload.message_id).await
            }
        };

        if let Err(e) = result {
            handle.send(OutboundEnvelope::error(e.socket_code(), &e.to_string()));
        }
    }

    async fn handle_auth(
        &self,
        handle: &ConnectionHandle,
        payload: crate::connection::AuthPayload,
    ) -> Result<(), CoreError> {
        let claims = self
            .tokens
            .verify_access_token(&payload.access_token)
            .map_err(|_| CoreError::InvalidCredential)?;

        {
            let mut state = handle.state.lock();
            state.user_id = Some(claims.sub);
            state.username = Some(claims.username.clone());
        }
        self.clients.entry(claims.sub).or_default().push(handle.clone());
        crate::metrics::set_active_connections(self.active_connection_count());
        handle.send(OutboundEnvelope::new(
            "auth.success",
            json!({ "user_id": claims.sub, "username": claims.username }),
        ));
        Ok(())
    }

    /// On success: add to `rooms[convId]`, subscribe to the room topic if
    /// this is the first local interest in it, and sweep delivered receipts
    /// for the joining user (spec §4.5/§4.7).
    pub async fn join_room(&self, handle: &ConnectionHandle, conversation_id: Uuid) -> Result<(), CoreError> {
        let Some(user_id) = handle.user_id() else {
            return Err(CoreError::Unauthenticated);
        };

        store::get_member_role(&self.store, conversation_id, user_id).await?;

        handle.state.lock().joined_rooms.insert(conversation_id);
        self.rooms.entry(conversation_id).or_default().push(handle.clone());
        self.ensure_room_subscription(conversation_id).await;

        let delivered = crate::receipts::sweep_delivered(&self.store, conversation_id, user_id).await?;
        if !delivered.is_empty() {
            self.publish_to_room(
                conversation_id,
                "receipt.updated",
                json!({
                    "conversation_id": conversation_id,
                    "message_ids": delivered,
                    "user_id": user_id,
                    "status": "delivered",
                }),
            )
            .await;
        }

        Ok(())
    }

    fn leave_room_internal(&self, handle: &ConnectionHandle, conversation_id: Uuid) {
        handle.state.lock().joined_rooms.remove(&conversation_id);

        let mut now_empty = false;
        if let Some(mut conns) = self.rooms.get_mut(&conversation_id) {
            conns.retain(|c| c.id != handle.id);
            now_empty = conns.is_empty();
        }
        if now_empty {
            self.rooms.remove(&conversation_id);
            if let Some((_, sub)) = self.room_subs.remove(&conversation_id) {
                sub.unsubscribe();
            }
        }
    }

    /// The subscription handler only fans out envelopes that originated on
    /// another instance. Same-instance envelopes are delivered directly by
    /// [`Self::publish_to_room`] — relying on the PubSub round-trip for local
    /// delivery would break under `PUBSUB_BACKEND=distributed`, whose worker
    /// never invokes handlers for its own instance's envelopes (spec §9).
    async fn ensure_room_subscription(&self, conversation_id: Uuid) {
        if self.room_subs.contains_key(&conversation_id) {
            return;
        }

        let rooms = self.rooms.clone();
        let instance_id = self.instance_id.clone();
        let topic = Topics::room(conversation_id);
        let handler: crate::pubsub::Handler = Arc::new(move |envelope: Envelope| {
            if envelope.instance_id == instance_id {
                return;
            }
            if let Some(conns) = rooms.get(&conversation_id) {
                for conn in conns.value().iter() {
                    deliver_room_envelope(conn, &envelope);
                }
            }
        });

        match self.pubsub.subscribe(&topic, handler).await {
            Ok(sub) => {
                self.room_subs.insert(conversation_id, sub);
            }
            Err(e) => warn!(conversation_id = %conversation_id, error = %e, "failed to subscribe to room topic"),
        }
    }

    /// Delivers to every local room member directly, then publishes to the
    /// PubSub topic for cross-instance relay. Local delivery never depends on
    /// the PubSub backend's own round-trip, so it works the same whether
    /// `PUBSUB_BACKEND` is `memory` or `distributed` (spec §4.5/§9).
    pub async fn publish_to_room(&self, conversation_id: Uuid, kind: &'static str, payload: serde_json::Value) {
        let topic = Topics::room(conversation_id);
        let inner = json!({ "type": kind, "payload": payload });

        if let Some(conns) = self.rooms.get(&conversation_id) {
            let local = Envelope {
                topic: topic.clone(),
                instance_id: self.instance_id.clone(),
                payload: inner.clone(),
            };
            for conn in conns.value().iter() {
                deliver_room_envelope(conn, &local);
            }
        }

        if let Err(e) = self.pubsub.publish(&topic, inner).await {
            warn!(conversation_id = %conversation_id, error = %e, "room publish failed");
        } else {
            crate::metrics::record_message_published();
        }
    }

    /// Typing indicators bypass PubSub entirely and go straight to local
    /// connections other than the sender (spec §4.5) — they do not cross
    /// instance boundaries.
    async fn broadcast_typing(
        &self,
        handle: &ConnectionHandle,
        conversation_id: Uuid,
        is_typing: bool,
    ) -> Result<(), CoreError> {
        let Some(user_id) = handle.user_id() else {
            return Err(CoreError::Unauthenticated);
        };
        if !handle.state.lock().joined_rooms.contains(&conversation_id) {
            return Err(CoreError::NotMember);
        }

        if let Some(conns) = self.rooms.get(&conversation_id) {
            for conn in conns.value().iter() {
                if conn.id == handle.id {
                    continue;
                }
                conn.send(OutboundEnvelope::new(
                    "typing",
                    json!({ "conversation_id": conversation_id, "user_id": user_id, "is_typing": is_typing }),
                ));
            }
        }
        Ok(())
    }

    async fn handle_message_send(
        &self,
        handle: &ConnectionHandle,
        conversation_id: Uuid,
        body_text: Option<String>,
        attachment_id: Option<Uuid>,
        temp_id: Option<String>,
    ) -> Result<(), CoreError> {
        let Some(user_id) = handle.user_id() else {
            return Err(CoreError::Unauthenticated);
        };
        store::get_member_role(&self.store, conversation_id, user_id).await?;

        let trimmed = body_text.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if trimmed.is_none() && attachment_id.is_none() {
            return Err(CoreError::Validation(
                "message must have a non-empty body or an attachment".into(),
            ));
        }

        let client_msg_id = temp_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let message = store::create_message(
            &self.store,
            conversation_id,
            user_id,
            trimmed,
            attachment_id,
            &client_msg_id,
        )
        .await?;

        // Publish only after the Store commit returns (spec §5 ordering guarantee).
        // `sender_id`/`client_msg_id` ride along on the internal envelope so
        // `deliver_room_envelope` can attach `temp_id` to the sender's own
        // connection only and strip it for everyone else (spec §6). Omit the
        // key entirely when the client sent no `temp_id`, rather than
        // carrying a JSON `null` through to the sender's own frame.
        let mut inner = json!({ "message": message, "sender_id": user_id });
        if let Some(temp_id) = temp_id {
            inner["client_msg_id"] = json!(temp_id);
        }
        self.publish_to_room(conversation_id, "message.new", inner).await;
        Ok(())
    }

    async fn handle_receipt_read(&self, handle: &ConnectionHandle, message_id: Uuid) -> Result<(), CoreError> {
        let Some(user_id) = handle.user_id() else {
            return Err(CoreError::Unauthenticated);
        };

        let conversation_id = crate::receipts::mark_read(&self.store, message_id, user_id).await?;

        self.publish_to_room(
            conversation_id,
            "receipt.updated",
            json!({
                "conversation_id": conversation_id,
                "message_ids": [message_id],
                "user_id": user_id,
                "status": "read",
            }),
        )
        .await;
        Ok(())
    }
}

fn deliver_room_envelope(conn: &ConnectionHandle, envelope: &Envelope) {
    let Some(kind) = envelope.payload.get("type").and_then(|v| v.as_str()) else {
        return;
    };
    let mut payload = envelope
        .payload
        .get("payload")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let kind: &'static str = match kind {
        "message.new" => {
            if let Some(obj) = payload.as_object_mut() {
                let sender_id = obj
                    .remove("sender_id")
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .and_then(|s| Uuid::parse_str(&s).ok());
                let client_msg_id = obj.remove("client_msg_id");
                if sender_id.is_some() && sender_id == conn.user_id() {
                    if let Some(temp_id) = client_msg_id {
                        obj.insert("temp_id".to_string(), temp_id);
                    }
                }
            }
            "message.new"
        }
        "message.deleted" => "message.deleted",
        "receipt.updated" => "receipt.updated",
        "room.member_joined" => "room.member_joined",
        "room.member_left" => "room.member_left",
        "room.updated" => "room.updated",
        _ => {
            debug!(kind, "dropping room envelope of unrecognized kind");
            return;
        }
    };
    conn.send(OutboundEnvelope::new(kind, payload));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;

    fn room_envelope(kind: &str, payload: serde_json::Value) -> Envelope {
        Envelope {
            topic: "room:test".to_string(),
            instance_id: "test-instance".to_string(),
            payload: json!({ "type": kind, "payload": payload }),
        }
    }

    /// S1: the sending connection gets `temp_id` echoed back; every other
    /// room member gets the same `message.new` with no `temp_id` at all.
    #[tokio::test]
    async fn message_new_round_trips_temp_id_to_sender_only() {
        let sender_id = Uuid::new_v4();
        let (sender_handle, mut sender_rx) = ConnectionHandle::for_test(Some(sender_id));
        let (other_handle, mut other_rx) = ConnectionHandle::for_test(Some(Uuid::new_v4()));

        let envelope = room_envelope(
            "message.new",
            json!({
                "message": { "id": Uuid::new_v4(), "body_text": "hi" },
                "sender_id": sender_id,
                "client_msg_id": "t1",
            }),
        );

        deliver_room_envelope(&sender_handle, &envelope);
        deliver_room_envelope(&other_handle, &envelope);

        let sender_frame = sender_rx.try_recv().expect("sender should receive a frame");
        assert_eq!(sender_frame.kind, "message.new");
        assert_eq!(sender_frame.payload["temp_id"], "t1");
        assert!(sender_frame.payload.get("sender_id").is_none());
        assert!(sender_frame.payload.get("client_msg_id").is_none());

        let other_frame = other_rx.try_recv().expect("other member should receive a frame");
        assert_eq!(other_frame.kind, "message.new");
        assert!(other_frame.payload.get("temp_id").is_none());
    }

    #[test]
    fn unrecognized_envelope_kind_is_dropped() {
        let (handle, mut rx) = ConnectionHandle::for_test(Some(Uuid::new_v4()));
        let envelope = room_envelope("something.unknown", json!({}));
        deliver_room_envelope(&handle, &envelope);
        assert!(rx.try_recv().is_err(), "unrecognized kinds must not reach the socket");
    }

    #[test]
    fn receipt_updated_envelope_passes_through_unmodified() {
        let (handle, mut rx) = ConnectionHandle::for_test(Some(Uuid::new_v4()));
        let envelope = room_envelope(
            "receipt.updated",
            json!({ "message_ids": [Uuid::new_v4()], "status": "read" }),
        );
        deliver_room_envelope(&handle, &envelope);
        let frame = rx.try_recv().expect("receipt.updated should be delivered");
        assert_eq!(frame.kind, "receipt.updated");
        assert_eq!(frame.payload["status"], "read");
    }

    /// Guards against the same-instance double-delivery regression: a
    /// subscription handler mirroring `ensure_room_subscription` must skip
    /// an envelope stamped with its own instance id, since `publish_to_room`
    /// already delivers that envelope to local members directly.
    #[test]
    fn subscription_handler_skips_same_instance_envelope() {
        let (handle, mut rx) = ConnectionHandle::for_test(Some(Uuid::new_v4()));
        let local_instance = "instance-a".to_string();

        let own_envelope = Envelope {
            topic: "room:test".to_string(),
            instance_id: local_instance.clone(),
            payload: json!({ "type": "receipt.updated", "payload": { "status": "read" } }),
        };
        let remote_envelope = Envelope {
            topic: "room:test".to_string(),
            instance_id: "instance-b".to_string(),
            payload: json!({ "type": "receipt.updated", "payload": { "status": "read" } }),
        };

        let deliver_if_remote = |envelope: &Envelope| {
            if envelope.instance_id == local_instance {
                return;
            }
            deliver_room_envelope(&handle, envelope);
        };

        deliver_if_remote(&own_envelope);
        assert!(
            rx.try_recv().is_err(),
            "same-instance envelope must not be delivered again through the subscription path"
        );

        deliver_if_remote(&remote_envelope);
        assert!(
            rx.try_recv().is_ok(),
            "cross-instance envelope must still be delivered through the subscription path"
        );
    }
}
