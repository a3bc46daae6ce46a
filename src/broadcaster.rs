//! Narrow publish-only interface for REST handlers (spec §4.6).
//!
//! REST handlers never touch [`crate::hub::Hub`] state directly; they call
//! through here so the only thing they can do is publish one of these four
//! event kinds to a room topic.

use std::sync::Arc;
use uuid::Uuid;

use crate::hub::Hub;
use crate::models::MemberRole;

#[derive(Clone)]
pub struct Broadcaster {
    hub: Arc<Hub>,
}

impl Broadcaster {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub async fn member_joined(&self, conversation_id: Uuid, user_id: Uuid, role: MemberRole) {
        self.hub
            .publish_to_room(
                conversation_id,
                "room.member_joined",
                serde_json::json!({ "conversation_id": conversation_id, "user_id": user_id, "role": role }),
            )
            .await;
    }

    /// `removed_by` is `None` when a member leaves of their own accord and
    /// `Some(actor)` when an admin removed someone else (spec §6/S4).
    pub async fn member_left(&self, conversation_id: Uuid, user_id: Uuid, removed_by: Option<Uuid>) {
        self.hub
            .publish_to_room(
                conversation_id,
                "room.member_left",
                serde_json::json!({
                    "conversation_id": conversation_id,
                    "user_id": user_id,
                    "removed_by": removed_by,
                }),
            )
            .await;
    }

    pub async fn room_updated(&self, conversation_id: Uuid, title: Option<String>) {
        self.hub
            .publish_to_room(
                conversation_id,
                "room.updated",
                serde_json::json!({ "conversation_id": conversation_id, "title": title }),
            )
            .await;
    }

    pub async fn message_deleted(&self, conversation_id: Uuid, message_id: Uuid) {
        self.hub
            .publish_to_room(
                conversation_id,
                "message.deleted",
                serde_json::json!({ "conversation_id": conversation_id, "message_id": message_id }),
            )
            .await;
    }
}
