//! Delivered/read receipt bookkeeping (spec §4.7).
//!
//! Two entry points, both called from [`crate::hub::Hub`]: a batch sweep on
//! room join, and a single-message upsert on an explicit `receipt.read`.
//! Both go through [`crate::store`] directly rather than keeping their own
//! state — the invariant ("never emit `delivered` after `read`") is enforced
//! at the SQL layer by [`crate::store::mark_read`]'s conditional `ON
//! CONFLICT` rather than here, so a second caller racing this function can't
//! regress an already-read receipt back to delivered.

use uuid::Uuid;

use crate::error::CoreError;
use crate::store::{self, DbPool};

/// Mark every message in `conversation_id` not yet delivered to `user_id` as
/// delivered, returning the ids that were newly marked (for the single batch
/// `receipt.updated` event the Hub publishes after this call).
pub async fn sweep_delivered(
    pool: &DbPool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Vec<Uuid>, CoreError> {
    let messages = store::get_messages(pool, conversation_id, None, Some(100)).await?;

    let mut newly_delivered = Vec::new();
    for message in &messages {
        if message.sender_id == Some(user_id) {
            continue;
        }
        if store::receipt_status(pool, message.id, user_id).await?.is_none() {
            newly_delivered.push(message.id);
        }
    }

    store::mark_delivered(pool, &newly_delivered, user_id).await?;
    Ok(newly_delivered)
}

/// Mark a single message read by `user_id`. Refuses to let a user mark their
/// own message as read and requires active membership in the conversation.
/// Returns the conversation id so the caller can publish to the right topic.
pub async fn mark_read(pool: &DbPool, message_id: Uuid, user_id: Uuid) -> Result<Uuid, CoreError> {
    let message = store::get_message(pool, message_id).await?;
    if message.sender_id == Some(user_id) {
        return Err(CoreError::Validation(
            "cannot mark your own message as read".into(),
        ));
    }

    store::get_member_role(pool, message.conversation_id, user_id).await?;
    store::mark_read(pool, message_id, user_id).await?;

    Ok(message.conversation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> Option<DbPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()
    }

    #[tokio::test]
    async fn mark_read_refuses_own_message() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let user_id = Uuid::new_v4();
        let conversation = store::create_conversation(
            &pool,
            crate::models::ConversationKind::Direct,
            None,
            user_id,
            &[user_id, Uuid::new_v4()],
        )
        .await
        .unwrap();
        let message = store::create_message(&pool, conversation.id, user_id, Some("hi"), None, "c1")
            .await
            .unwrap();

        let result = mark_read(&pool, message.id, user_id).await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }
}
