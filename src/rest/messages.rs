//! `/conversations/{id}/messages` and `/messages/{id}` handlers.
//!
//! REST message send and the socket `message.send` path both end up calling
//! [`crate::store::create_message`] then publishing through the same Hub, so
//! a message posted over REST shows up identically to one sent over the
//! socket (spec §4.1/§4.8).

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::broadcaster::Broadcaster;
use crate::error::CoreError;
use crate::hub::Hub;
use crate::models::{Message, MemberRole};
use crate::store::{self, DbPool, MessageWithSender};

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_messages(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessageWithSender>>, CoreError> {
    store::get_member_role(&pool, conversation_id, user.user_id).await?;
    let messages = store::get_messages(&pool, conversation_id, q.before, q.limit).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body_text: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<Uuid>,
    pub client_msg_id: Option<String>,
}

/// Fallback for clients without an open socket. Persists through
/// [`crate::store::create_message`] and publishes through the Hub exactly
/// like [`crate::hub::Hub::dispatch`]'s `message.send` path, so every
/// recipient — REST or socket — sees one `message.new` event.
pub async fn send_message(
    State(pool): State<DbPool>,
    State(hub): State<std::sync::Arc<Hub>>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Message>, CoreError> {
    store::get_member_role(&pool, conversation_id, user.user_id).await?;

    let trimmed = req.body_text.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if trimmed.is_none() && req.attachment_id.is_none() {
        return Err(CoreError::Validation(
            "message must have a non-empty body or an attachment".into(),
        ));
    }

    let client_msg_id = req
        .client_msg_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let message = store::create_message(
        &pool,
        conversation_id,
        user.user_id,
        trimmed,
        req.attachment_id,
        &client_msg_id,
    )
    .await?;

    hub.publish_to_room(conversation_id, "message.new", serde_json::json!({ "message": message }))
        .await;

    Ok(Json(message))
}

/// Delete-message authorization preserves the source's behavior (spec §9
/// open question 3): the sender may delete their own message, and a group
/// admin may delete any member's message.
pub async fn delete_message(
    State(pool): State<DbPool>,
    State(broadcaster): State<Broadcaster>,
    user: AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<(), CoreError> {
    let message = store::get_message(&pool, message_id).await?;
    let role = store::get_member_role(&pool, message.conversation_id, user.user_id).await?;

    if message.sender_id != Some(user.user_id) && role != MemberRole::Admin {
        return Err(CoreError::Forbidden(
            "only the sender or a conversation admin can delete this message".into(),
        ));
    }

    store::delete_message(&pool, message_id).await?;
    broadcaster.message_deleted(message.conversation_id, message_id).await;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkReadRequest {
    #[serde(default)]
    pub last_message_id: Option<Uuid>,
}

pub async fn mark_conversation_read(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<MarkReadRequest>,
) -> Result<(), CoreError> {
    store::get_member_role(&pool, conversation_id, user.user_id).await?;
    store::mark_conversation_read(&pool, conversation_id, user.user_id, req.last_message_id).await
}
