//! `/conversations/*` handlers. REST mutations that touch conversation
//! membership or metadata go through [`crate::broadcaster::Broadcaster`] so
//! connected sockets see the same event a Hub-originated change would
//! produce (spec §4.6).

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::broadcaster::Broadcaster;
use crate::error::CoreError;
use crate::models::{ConversationKind, MemberRole};
use crate::store::{self, ConversationSummary, DbPool};

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub member_ids: Vec<Uuid>,
    pub title: Option<String>,
}

pub async fn create_conversation(
    State(pool): State<DbPool>,
    user: AuthUser,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<crate::models::Conversation>, CoreError> {
    match req.kind {
        ConversationKind::Direct => {
            let other = req
                .member_ids
                .iter()
                .copied()
                .find(|id| *id != user.user_id)
                .ok_or_else(|| CoreError::Validation("direct conversation needs exactly one other member".into()))?;

            if store::is_blocked(&pool, user.user_id, other).await? {
                return Err(CoreError::Forbidden(
                    "cannot start a direct conversation with a blocked user".into(),
                ));
            }

            if let Some(existing) = store::find_direct_between(&pool, user.user_id, other).await? {
                return Ok(Json(existing));
            }

            let conversation = store::create_conversation(
                &pool,
                ConversationKind::Direct,
                None,
                user.user_id,
                &[user.user_id, other],
            )
            .await?;
            Ok(Json(conversation))
        }
        ConversationKind::Group => {
            let title = req
                .title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| CoreError::Validation("group conversations require a non-empty title".into()))?;
            if title.chars().count() > 100 {
                return Err(CoreError::Validation("title must be at most 100 characters".into()));
            }

            let mut member_ids = req.member_ids.clone();
            if !member_ids.contains(&user.user_id) {
                member_ids.push(user.user_id);
            }
            if member_ids.is_empty() || member_ids.len() > 100 {
                return Err(CoreError::Validation("group must have 1-100 members".into()));
            }

            let conversation =
                store::create_conversation(&pool, ConversationKind::Group, Some(title), user.user_id, &member_ids)
                    .await?;
            Ok(Json(conversation))
        }
    }
}

pub async fn list_conversations(
    State(pool): State<DbPool>,
    user: AuthUser,
) -> Result<Json<Vec<ConversationSummary>>, CoreError> {
    let summaries = store::get_user_conversations_with_details(&pool, user.user_id).await?;
    Ok(Json(summaries))
}

pub async fn get_conversation(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<crate::models::Conversation>, CoreError> {
    store::get_member_role(&pool, conversation_id, user.user_id).await?;
    let conversation = store::get_conversation(&pool, conversation_id).await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct PatchConversationRequest {
    pub title: Option<String>,
}

pub async fn patch_conversation(
    State(pool): State<DbPool>,
    State(broadcaster): State<Broadcaster>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<PatchConversationRequest>,
) -> Result<Json<crate::models::Conversation>, CoreError> {
    let role = store::get_member_role(&pool, conversation_id, user.user_id).await?;
    if role != MemberRole::Admin {
        return Err(CoreError::Forbidden("only an admin can update the conversation".into()));
    }

    let Some(title) = req.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        return Err(CoreError::Validation("title must not be empty".into()));
    };
    if title.chars().count() > 100 {
        return Err(CoreError::Validation("title must be at most 100 characters".into()));
    }

    let conversation = store::update_conversation_title(&pool, conversation_id, title).await?;
    broadcaster.room_updated(conversation_id, Some(title.to_string())).await;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
}

pub async fn add_member(
    State(pool): State<DbPool>,
    State(broadcaster): State<Broadcaster>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> Result<(), CoreError> {
    let role = store::get_member_role(&pool, conversation_id, user.user_id).await?;
    let conversation = store::get_conversation(&pool, conversation_id).await?;
    if conversation.kind == ConversationKind::Direct {
        return Err(CoreError::Forbidden("direct conversations cannot gain members".into()));
    }
    if role != MemberRole::Admin {
        return Err(CoreError::Forbidden("only an admin can add members".into()));
    }

    store::add_member(&pool, conversation_id, req.user_id).await?;
    broadcaster
        .member_joined(conversation_id, req.user_id, MemberRole::Member)
        .await;
    Ok(())
}

/// Remove a member. Group admins may remove any member (including another
/// admin, as long as at least one admin remains); a member may remove
/// themself.
pub async fn remove_member(
    State(pool): State<DbPool>,
    State(broadcaster): State<Broadcaster>,
    user: AuthUser,
    Path((conversation_id, target_user_id)): Path<(Uuid, Uuid)>,
) -> Result<(), CoreError> {
    let role = store::get_member_role(&pool, conversation_id, user.user_id).await?;
    if target_user_id != user.user_id && role != MemberRole::Admin {
        return Err(CoreError::Forbidden("only an admin can remove other members".into()));
    }

    let target_role = store::get_member_role(&pool, conversation_id, target_user_id).await?;
    if target_role == MemberRole::Admin && store::count_admins(&pool, conversation_id).await? <= 1 {
        return Err(CoreError::Conflict("conversation must keep at least one admin".into()));
    }

    store::remove_member(&pool, conversation_id, target_user_id).await?;
    let removed_by = if target_user_id == user.user_id { None } else { Some(user.user_id) };
    broadcaster.member_left(conversation_id, target_user_id, removed_by).await;
    Ok(())
}

pub async fn archive_conversation(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<(), CoreError> {
    store::get_member_role(&pool, conversation_id, user.user_id).await?;
    store::archive_conversation(&pool, conversation_id).await
}

pub async fn unarchive_conversation(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<(), CoreError> {
    store::get_member_role(&pool, conversation_id, user.user_id).await?;
    store::unarchive_conversation(&pool, conversation_id).await
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
}

pub async fn search_messages(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<crate::models::Message>>, CoreError> {
    store::get_member_role(&pool, conversation_id, user.user_id).await?;
    let messages = store::search_messages(&pool, conversation_id, &q.q, q.limit).await?;
    Ok(Json(messages))
}

pub async fn search_all_messages(
    State(pool): State<DbPool>,
    user: AuthUser,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<crate::models::Message>>, CoreError> {
    let messages = store::search_all_messages(&pool, user.user_id, &q.q, q.limit).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub user_id: Uuid,
}

pub async fn block_user(
    State(pool): State<DbPool>,
    user: AuthUser,
    Json(req): Json<BlockRequest>,
) -> Result<(), CoreError> {
    store::create_block(&pool, user.user_id, req.user_id).await
}

pub async fn unblock_user(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(blocked_user_id): Path<Uuid>,
) -> Result<(), CoreError> {
    store::remove_block(&pool, user.user_id, blocked_user_id).await
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

pub async fn star_message(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<(), CoreError> {
    let message = store::get_message(&pool, message_id).await?;
    store::get_member_role(&pool, message.conversation_id, user.user_id).await?;
    store::star_message(&pool, user.user_id, message_id).await
}

pub async fn unstar_message(
    State(pool): State<DbPool>,
    user: AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<(), CoreError> {
    store::unstar_message(&pool, user.user_id, message_id).await
}

pub async fn list_starred(
    State(pool): State<DbPool>,
    user: AuthUser,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<crate::models::Message>>, CoreError> {
    let messages = store::list_starred_messages(&pool, user.user_id, q.limit).await?;
    Ok(Json(messages))
}
