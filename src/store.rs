//! Persistent storage for users, conversations, messages, and receipts.
//!
//! Functions here are flat `async fn`s taking `&DbPool` as their first
//! argument rather than methods on a struct, mirroring how the rest of this
//! codebase talks to Postgres: no repository trait, no ORM, `sqlx::query*`
//! directly against hand-written SQL.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{
    Attachment, Conversation, ConversationKind, ConversationMember, MemberRole, Message,
    ReceiptStatus, User,
};

pub type DbPool = PgPool;

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Clamp a caller-supplied page size into `[1, MAX_PAGE_LIMIT]`, defaulting
/// to `DEFAULT_PAGE_LIMIT` when absent (spec's resolved-default for
/// `GetMessages`/`SearchMessages`/starred listing).
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/chatcore".to_string()),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

pub async fn init_db(config: DbConfig) -> anyhow::Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(pool)
}

pub async fn init_db_default() -> anyhow::Result<DbPool> {
    init_db(DbConfig::default()).await
}

pub async fn health_check(pool: &DbPool) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}

// =============================================================================
// Users
// =============================================================================

pub async fn create_user(
    pool: &DbPool,
    username: &str,
    email: &str,
    password_hash: &str,
) -> Result<User, CoreError> {
    let now = Utc::now();
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, username, email, password_hash, display_name, created_at, updated_at)
        VALUES ($1, $2, $3, $4, NULL, $5, $5)
        RETURNING id, username, email, password_hash, display_name, avatar_url,
                  show_online_status, read_receipts_enabled, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(user)
}

pub async fn get_user_by_id(pool: &DbPool, user_id: Uuid) -> Result<User, CoreError> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT id, username, email, password_hash, display_name, avatar_url,
               show_online_status, read_receipts_enabled, created_at, updated_at
        FROM users WHERE id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound("user".into()))
}

pub async fn get_user_by_username_or_email(
    pool: &DbPool,
    identifier: &str,
) -> Result<Option<User>, CoreError> {
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT id, username, email, password_hash, display_name, avatar_url,
               show_online_status, read_receipts_enabled, created_at, updated_at
        FROM users
        WHERE lower(username) = lower($1) OR lower(email) = lower($1)
        "#,
    )
    .bind(identifier)
    .fetch_optional(pool)
    .await?;

    Ok(user)
}

/// Update profile fields (spec §3 "mutated by profile updates"). `None`
/// leaves a field unchanged; pass `Some(None)` (via `Patch`) is not
/// represented here since the REST layer only ever sends fields the user
/// actually wants to change.
pub async fn update_user_profile(
    pool: &DbPool,
    user_id: Uuid,
    display_name: Option<&str>,
    avatar_url: Option<&str>,
    show_online_status: Option<bool>,
    read_receipts_enabled: Option<bool>,
) -> Result<User, CoreError> {
    let user = sqlx::query_as::<_, User>(
        r#"
        UPDATE users SET
            display_name = COALESCE($1, display_name),
            avatar_url = COALESCE($2, avatar_url),
            show_online_status = COALESCE($3, show_online_status),
            read_receipts_enabled = COALESCE($4, read_receipts_enabled),
            updated_at = $5
        WHERE id = $6
        RETURNING id, username, email, password_hash, display_name, avatar_url,
                  show_online_status, read_receipts_enabled, created_at, updated_at
        "#,
    )
    .bind(display_name)
    .bind(avatar_url)
    .bind(show_online_status)
    .bind(read_receipts_enabled)
    .bind(Utc::now())
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound("user".into()))?;

    Ok(user)
}

/// Username/display-name prefix search, used by the unauthenticated user
/// search endpoint (spec §6 lists "user search" among the handful of REST
/// routes that don't require a bearer token).
pub async fn search_users(pool: &DbPool, query: &str, limit: Option<i64>) -> Result<Vec<PublicProfile>, CoreError> {
    let limit = clamp_limit(limit);
    let pattern = format!("{}%", query.replace('%', "\\%").replace('_', "\\_"));
    let users = sqlx::query_as::<_, PublicProfile>(
        r#"
        SELECT id, username, display_name, avatar_url
        FROM users
        WHERE username ILIKE $1 OR display_name ILIKE $1
        ORDER BY username
        LIMIT $2
        "#,
    )
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(users)
}

// =============================================================================
// Refresh credentials
// =============================================================================

use crate::models::RefreshCredential;

pub async fn create_refresh_credential(
    pool: &DbPool,
    user_id: Uuid,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<RefreshCredential, CoreError> {
    let credential = sqlx::query_as::<_, RefreshCredential>(
        r#"
        INSERT INTO refresh_credentials (id, user_id, token_hash, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, user_id, token_hash, created_at, expires_at, revoked_at, replaced_by
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(token_hash)
    .bind(Utc::now())
    .bind(expires_at)
    .fetch_one(pool)
    .await?;

    Ok(credential)
}

pub async fn get_refresh_credential_by_hash(
    pool: &DbPool,
    token_hash: &str,
) -> Result<Option<RefreshCredential>, CoreError> {
    let credential = sqlx::query_as::<_, RefreshCredential>(
        r#"
        SELECT id, user_id, token_hash, created_at, expires_at, revoked_at, replaced_by
        FROM refresh_credentials WHERE token_hash = $1
        "#,
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;

    Ok(credential)
}

/// Atomically revoke `old_id` and insert its replacement, linking the two.
pub async fn rotate_refresh_credential(
    pool: &DbPool,
    old_id: Uuid,
    user_id: Uuid,
    new_token_hash: &str,
    new_expires_at: DateTime<Utc>,
) -> Result<Uuid, CoreError> {
    let mut tx = pool.begin().await?;
    let new_id = Uuid::new_v4();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO refresh_credentials (id, user_id, token_hash, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(new_id)
    .bind(user_id)
    .bind(new_token_hash)
    .bind(now)
    .bind(new_expires_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE refresh_credentials
        SET revoked_at = $1, replaced_by = $2
        WHERE id = $3
        "#,
    )
    .bind(now)
    .bind(new_id)
    .bind(old_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(new_id)
}

pub async fn revoke_refresh_credential_by_hash(
    pool: &DbPool,
    token_hash: &str,
) -> Result<(), CoreError> {
    sqlx::query(
        "UPDATE refresh_credentials SET revoked_at = $1 WHERE token_hash = $2 AND revoked_at IS NULL",
    )
    .bind(Utc::now())
    .bind(token_hash)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn revoke_all_refresh_credentials(pool: &DbPool, user_id: Uuid) -> Result<(), CoreError> {
    sqlx::query(
        "UPDATE refresh_credentials SET revoked_at = $1 WHERE user_id = $2 AND revoked_at IS NULL",
    )
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// Federated identities
// =============================================================================

use crate::models::FederatedIdentity;

pub async fn get_user_by_federated_identity(
    pool: &DbPool,
    provider: &str,
    provider_user_id: &str,
) -> Result<Option<User>, CoreError> {
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT u.id, u.username, u.email, u.password_hash, u.display_name, u.avatar_url,
               u.show_online_status, u.read_receipts_enabled, u.created_at, u.updated_at
        FROM users u
        INNER JOIN federated_identities f ON f.user_id = u.id
        WHERE f.provider = $1 AND f.provider_user_id = $2
        "#,
    )
    .bind(provider)
    .bind(provider_user_id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Create the user row and its first federated-identity link in one
/// transaction (first-login-via-provider path; spec §3 `FederatedIdentity`
/// lifecycle).
pub async fn create_federated_user(
    pool: &DbPool,
    username: &str,
    email: &str,
    provider: &str,
    provider_user_id: &str,
) -> Result<User, CoreError> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, username, email, password_hash, display_name, created_at, updated_at)
        VALUES ($1, $2, $3, '', NULL, $4, $4)
        RETURNING id, username, email, password_hash, display_name, avatar_url,
                  show_online_status, read_receipts_enabled, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(username)
    .bind(email)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO federated_identities (id, user_id, provider, provider_user_id, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(provider)
    .bind(provider_user_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(user)
}

pub async fn link_federated_identity(
    pool: &DbPool,
    user_id: Uuid,
    provider: &str,
    provider_user_id: &str,
) -> Result<FederatedIdentity, CoreError> {
    let identity = sqlx::query_as::<_, FederatedIdentity>(
        r#"
        INSERT INTO federated_identities (id, user_id, provider, provider_user_id, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, user_id, provider, provider_user_id, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(provider)
    .bind(provider_user_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(identity)
}

// =============================================================================
// Conversations
// =============================================================================

/// Atomically insert a conversation row and one membership row per member id;
/// the creator gets `admin`. Fails with `AlreadyExists` on a unique-constraint
/// trip (e.g. re-creating a direct conversation that already exists).
pub async fn create_conversation(
    pool: &DbPool,
    kind: ConversationKind,
    title: Option<&str>,
    creator_id: Uuid,
    member_ids: &[Uuid],
) -> Result<Conversation, CoreError> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let id = Uuid::new_v4();

    let (direct_low, direct_high) = if kind == ConversationKind::Direct {
        let mut pair = member_ids.to_vec();
        pair.sort();
        (pair.first().copied(), pair.get(1).copied())
    } else {
        (None, None)
    };

    let conversation = sqlx::query_as::<_, Conversation>(
        r#"
        INSERT INTO conversations (id, kind, title, creator_id, created_at, updated_at, direct_user_low, direct_user_high)
        VALUES ($1, $2, $3, $4, $5, $5, $6, $7)
        RETURNING id, kind, title, creator_id, created_at, updated_at, archived_at
        "#,
    )
    .bind(id)
    .bind(kind)
    .bind(title)
    .bind(creator_id)
    .bind(now)
    .bind(direct_low)
    .bind(direct_high)
    .fetch_one(&mut *tx)
    .await?;

    for member_id in member_ids {
        let role = if *member_id == creator_id {
            MemberRole::Admin
        } else {
            MemberRole::Member
        };
        sqlx::query(
            r#"
            INSERT INTO conversation_members (conversation_id, user_id, role, joined_at, last_read_seq)
            VALUES ($1, $2, $3, $4, 0)
            "#,
        )
        .bind(id)
        .bind(member_id)
        .bind(role)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(conversation)
}

/// Return the single *unarchived* direct conversation whose member set is
/// exactly `{a, b}` (spec §3 invariant: at most one unarchived direct
/// conversation per unordered pair).
pub async fn find_direct_between(
    pool: &DbPool,
    a: Uuid,
    b: Uuid,
) -> Result<Option<Conversation>, CoreError> {
    let conversation = sqlx::query_as::<_, Conversation>(
        r#"
        SELECT c.id, c.kind, c.title, c.creator_id, c.created_at, c.updated_at, c.archived_at
        FROM conversations c
        WHERE c.kind = 'direct'
          AND c.archived_at IS NULL
          AND EXISTS (
              SELECT 1 FROM conversation_members m1
              WHERE m1.conversation_id = c.id AND m1.user_id = $1 AND m1.left_at IS NULL
          )
          AND EXISTS (
              SELECT 1 FROM conversation_members m2
              WHERE m2.conversation_id = c.id AND m2.user_id = $2 AND m2.left_at IS NULL
          )
        LIMIT 1
        "#,
    )
    .bind(a)
    .bind(b)
    .fetch_optional(pool)
    .await?;

    Ok(conversation)
}

pub async fn get_conversation(pool: &DbPool, conversation_id: Uuid) -> Result<Conversation, CoreError> {
    sqlx::query_as::<_, Conversation>(
        "SELECT id, kind, title, creator_id, created_at, updated_at, archived_at FROM conversations WHERE id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound("conversation".into()))
}

/// Role of `user_id` in `conversation_id`, or `NotMember` if absent/departed.
pub async fn get_member_role(
    pool: &DbPool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<MemberRole, CoreError> {
    sqlx::query_scalar::<_, MemberRole>(
        r#"
        SELECT role FROM conversation_members
        WHERE conversation_id = $1 AND user_id = $2 AND left_at IS NULL
        "#,
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or(CoreError::NotMember)
}

/// Add a member to an existing group conversation, as a plain `member`.
/// Fails with `AlreadyExists` if the user already holds an active row.
pub async fn add_member(
    pool: &DbPool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO conversation_members (conversation_id, user_id, role, joined_at, last_read_seq)
        VALUES ($1, $2, 'member', $3, 0)
        ON CONFLICT (conversation_id, user_id)
        DO UPDATE SET left_at = NULL, joined_at = EXCLUDED.joined_at
        WHERE conversation_members.left_at IS NOT NULL
        "#,
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Soft-remove a member. Leaves the row (and its `last_read_seq`) in place
/// with `left_at` set, matching the teacher's soft-delete membership
/// pattern, so history before departure is still attributable.
pub async fn remove_member(
    pool: &DbPool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<(), CoreError> {
    sqlx::query(
        "UPDATE conversation_members SET left_at = $1 WHERE conversation_id = $2 AND user_id = $3 AND left_at IS NULL",
    )
    .bind(Utc::now())
    .bind(conversation_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Count of active admins, used to enforce the "≥ 1 admin at all times"
/// group invariant (spec §3) before a demotion or removal is allowed.
pub async fn count_admins(pool: &DbPool, conversation_id: Uuid) -> Result<i64, CoreError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM conversation_members WHERE conversation_id = $1 AND role = 'admin' AND left_at IS NULL",
    )
    .bind(conversation_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn update_conversation_title(
    pool: &DbPool,
    conversation_id: Uuid,
    title: &str,
) -> Result<Conversation, CoreError> {
    sqlx::query_as::<_, Conversation>(
        r#"
        UPDATE conversations SET title = $1, updated_at = $2 WHERE id = $3
        RETURNING id, kind, title, creator_id, created_at, updated_at, archived_at
        "#,
    )
    .bind(title)
    .bind(Utc::now())
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound("conversation".into()))
}

/// Archive a conversation. Idempotent: archiving an already-archived
/// conversation is a no-op, not a `Conflict`.
pub async fn archive_conversation(pool: &DbPool, conversation_id: Uuid) -> Result<(), CoreError> {
    sqlx::query("UPDATE conversations SET archived_at = $1 WHERE id = $2 AND archived_at IS NULL")
        .bind(Utc::now())
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn unarchive_conversation(pool: &DbPool, conversation_id: Uuid) -> Result<(), CoreError> {
    sqlx::query("UPDATE conversations SET archived_at = NULL WHERE id = $1")
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_members(
    pool: &DbPool,
    conversation_id: Uuid,
) -> Result<Vec<ConversationMember>, CoreError> {
    let members = sqlx::query_as::<_, ConversationMember>(
        r#"
        SELECT conversation_id, user_id, role, joined_at, left_at, last_read_seq
        FROM conversation_members
        WHERE conversation_id = $1 AND left_at IS NULL
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    Ok(members)
}

/// The sliver of a [`User`] safe to show another member of a shared
/// conversation — no email, no password hash.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct PublicProfile {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// A conversation decorated with the fields the client list view needs:
/// unread count, member count, the most recent message, and — for direct
/// conversations only — the other member's public profile (spec §4.1).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub unread_count: i64,
    pub member_count: i64,
    pub last_message: Option<Message>,
    pub other_member: Option<PublicProfile>,
}

pub async fn get_user_conversations_with_details(
    pool: &DbPool,
    user_id: Uuid,
) -> Result<Vec<ConversationSummary>, CoreError> {
    let conversations = sqlx::query_as::<_, Conversation>(
        r#"
        SELECT c.id, c.kind, c.title, c.creator_id, c.created_at, c.updated_at, c.archived_at
        FROM conversations c
        INNER JOIN conversation_members m ON m.conversation_id = c.id
        WHERE m.user_id = $1 AND m.left_at IS NULL AND c.archived_at IS NULL
        ORDER BY c.updated_at DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut summaries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let unread_count = get_unread_count(pool, conversation.id, user_id).await?;
        let member_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_members WHERE conversation_id = $1 AND left_at IS NULL",
        )
        .bind(conversation.id)
        .fetch_one(pool)
        .await?;
        let last_message = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, conversation_id, sender_id, seq, body, attachment_id, client_msg_id, created_at, edited_at, deleted_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(conversation.id)
        .fetch_optional(pool)
        .await?;

        let other_member = if conversation.kind == ConversationKind::Direct {
            sqlx::query_as::<_, PublicProfile>(
                r#"
                SELECT u.id, u.username, u.display_name, u.avatar_url
                FROM users u
                INNER JOIN conversation_members m ON m.user_id = u.id
                WHERE m.conversation_id = $1 AND m.user_id != $2 AND m.left_at IS NULL
                LIMIT 1
                "#,
            )
            .bind(conversation.id)
            .bind(user_id)
            .fetch_optional(pool)
            .await?
        } else {
            None
        };

        summaries.push(ConversationSummary {
            conversation,
            unread_count,
            member_count,
            last_message,
            other_member,
        });
    }

    Ok(summaries)
}

// =============================================================================
// Messages
// =============================================================================

/// Insert a message, assigning its sequence number transactionally
/// (`MAX(seq)+1` scoped to the conversation), and bump the conversation's
/// `updated_at` in the same transaction. A repeated `client_msg_id` from the
/// same sender returns the existing row instead of inserting a duplicate.
/// `attachment_id` lets the "body non-empty OR attachment present" invariant
/// (spec §3) be satisfied via the attachment branch.
pub async fn create_message(
    pool: &DbPool,
    conversation_id: Uuid,
    sender_id: Uuid,
    body: Option<&str>,
    attachment_id: Option<Uuid>,
    client_msg_id: &str,
) -> Result<Message, CoreError> {
    let mut tx = pool.begin().await?;

    if let Some(existing) = sqlx::query_as::<_, Message>(
        r#"
        SELECT id, conversation_id, sender_id, seq, body, attachment_id, client_msg_id, created_at, edited_at, deleted_at
        FROM messages
        WHERE conversation_id = $1 AND sender_id = $2 AND client_msg_id = $3
        "#,
    )
    .bind(conversation_id)
    .bind(sender_id)
    .bind(client_msg_id)
    .fetch_optional(&mut *tx)
    .await?
    {
        tx.rollback().await.ok();
        return Ok(existing);
    }

    let seq: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = $1",
    )
    .bind(conversation_id)
    .fetch_one(&mut *tx)
    .await?;

    let id = Uuid::new_v4();
    let now = Utc::now();

    let message = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages (id, conversation_id, sender_id, seq, body, attachment_id, client_msg_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, conversation_id, sender_id, seq, body, attachment_id, client_msg_id, created_at, edited_at, deleted_at
        "#,
    )
    .bind(id)
    .bind(conversation_id)
    .bind(sender_id)
    .bind(seq)
    .bind(body)
    .bind(attachment_id)
    .bind(client_msg_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
        .bind(now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(message)
}

pub async fn get_message(pool: &DbPool, message_id: Uuid) -> Result<Message, CoreError> {
    sqlx::query_as::<_, Message>(
        r#"
        SELECT id, conversation_id, sender_id, seq, body, attachment_id, client_msg_id, created_at, edited_at, deleted_at
        FROM messages WHERE id = $1
        "#,
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound("message".into()))
}

/// A [`Message`] decorated with its sender's public profile, eagerly loaded
/// via a single `LEFT JOIN` (spec §4.1 `GetMessages`: "sender profile
/// eagerly loaded via single join"). `LEFT JOIN` rather than `INNER JOIN`
/// since `sender_id` goes `NULL` once the sender's account is deleted
/// (spec §3) and the message must still be returned.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct MessageWithSender {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub seq: i64,
    pub body: Option<String>,
    pub attachment_id: Option<Uuid>,
    #[serde(skip_serializing)]
    pub client_msg_id: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sender_username: Option<String>,
    pub sender_display_name: Option<String>,
    pub sender_avatar_url: Option<String>,
}

/// Up to `limit` (clamped) messages strictly older than `before` (or newest
/// if absent), newest-first, tie-broken by id descending.
pub async fn get_messages(
    pool: &DbPool,
    conversation_id: Uuid,
    before: Option<DateTime<Utc>>,
    limit: Option<i64>,
) -> Result<Vec<MessageWithSender>, CoreError> {
    let limit = clamp_limit(limit);
    let messages = sqlx::query_as::<_, MessageWithSender>(
        r#"
        SELECT m.id, m.conversation_id, m.sender_id, m.seq, m.body, m.attachment_id,
               m.client_msg_id, m.created_at, m.edited_at, m.deleted_at,
               u.username AS sender_username, u.display_name AS sender_display_name,
               u.avatar_url AS sender_avatar_url
        FROM messages m
        LEFT JOIN users u ON u.id = m.sender_id
        WHERE m.conversation_id = $1 AND ($2::timestamptz IS NULL OR m.created_at < $2)
        ORDER BY m.created_at DESC, m.id DESC
        LIMIT $3
        "#,
    )
    .bind(conversation_id)
    .bind(before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(messages)
}

/// Full-text search within a single conversation, ranked then newest-first.
pub async fn search_messages(
    pool: &DbPool,
    conversation_id: Uuid,
    query: &str,
    limit: Option<i64>,
) -> Result<Vec<Message>, CoreError> {
    let limit = clamp_limit(limit);
    let messages = sqlx::query_as::<_, Message>(
        r#"
        SELECT id, conversation_id, sender_id, seq, body, attachment_id, client_msg_id, created_at, edited_at, deleted_at
        FROM messages
        WHERE conversation_id = $1
          AND deleted_at IS NULL
          AND to_tsvector('english', coalesce(body, '')) @@ plainto_tsquery('english', $2)
        ORDER BY ts_rank(to_tsvector('english', coalesce(body, '')), plainto_tsquery('english', $2)) DESC,
                 created_at DESC
        LIMIT $3
        "#,
    )
    .bind(conversation_id)
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(messages)
}

/// Full-text search across every conversation `user_id` belongs to.
pub async fn search_all_messages(
    pool: &DbPool,
    user_id: Uuid,
    query: &str,
    limit: Option<i64>,
) -> Result<Vec<Message>, CoreError> {
    let limit = clamp_limit(limit);
    let messages = sqlx::query_as::<_, Message>(
        r#"
        SELECT m.id, m.conversation_id, m.sender_id, m.seq, m.body, m.attachment_id, m.client_msg_id, m.created_at, m.edited_at, m.deleted_at
        FROM messages m
        INNER JOIN conversation_members cm
            ON cm.conversation_id = m.conversation_id AND cm.user_id = $1 AND cm.left_at IS NULL
        WHERE m.deleted_at IS NULL
          AND to_tsvector('english', coalesce(m.body, '')) @@ plainto_tsquery('english', $2)
        ORDER BY ts_rank(to_tsvector('english', coalesce(m.body, '')), plainto_tsquery('english', $2)) DESC,
                 m.created_at DESC
        LIMIT $3
        "#,
    )
    .bind(user_id)
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(messages)
}

pub async fn delete_message(pool: &DbPool, message_id: Uuid) -> Result<(), CoreError> {
    sqlx::query("UPDATE messages SET deleted_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Create an attachment row in `uploading` status. The presigned-URL upload
/// flow that actually writes bytes to `bucket`/`key` is an external
/// collaborator (spec §2); this just reserves the row the message will
/// reference.
pub async fn create_attachment(
    pool: &DbPool,
    uploader_id: Uuid,
    conversation_id: Uuid,
    bucket: &str,
    key: &str,
    filename: &str,
    mime_type: &str,
    size_bytes: i64,
) -> Result<Attachment, CoreError> {
    let attachment = sqlx::query_as::<_, Attachment>(
        r#"
        INSERT INTO attachments (id, uploader_id, conversation_id, bucket, key, filename, mime_type, size_bytes, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'uploading', $9)
        RETURNING id, uploader_id, conversation_id, bucket, key, filename, mime_type, size_bytes, content_hash, status, created_at, completed_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(uploader_id)
    .bind(conversation_id)
    .bind(bucket)
    .bind(key)
    .bind(filename)
    .bind(mime_type)
    .bind(size_bytes)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(attachment)
}

pub async fn get_attachment(pool: &DbPool, attachment_id: Uuid) -> Result<Attachment, CoreError> {
    sqlx::query_as::<_, Attachment>(
        r#"
        SELECT id, uploader_id, conversation_id, bucket, key, filename, mime_type, size_bytes, content_hash, status, created_at, completed_at
        FROM attachments WHERE id = $1
        "#,
    )
    .bind(attachment_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::NotFound("attachment".into()))
}

/// `uploading` → `ready`, stamping `completed_at`. No-op (matches no rows)
/// if the attachment isn't currently `uploading`, so a completion callback
/// racing an error report can't resurrect a failed upload.
pub async fn complete_attachment(pool: &DbPool, attachment_id: Uuid, content_hash: Option<&str>) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE attachments
        SET status = 'ready', completed_at = $1, content_hash = COALESCE($2, content_hash)
        WHERE id = $3 AND status = 'uploading'
        "#,
    )
    .bind(Utc::now())
    .bind(content_hash)
    .bind(attachment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// `uploading` → `error`.
pub async fn fail_attachment(pool: &DbPool, attachment_id: Uuid) -> Result<(), CoreError> {
    sqlx::query(
        "UPDATE attachments SET status = 'error', completed_at = $1 WHERE id = $2 AND status = 'uploading'",
    )
    .bind(Utc::now())
    .bind(attachment_id)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// Read status / unread counts
// =============================================================================

/// Upsert ReadStatus; timestamp is server-now and the sequence never rewinds.
/// `last_message_id`, when given, marks read only up to that message's
/// sequence number (partial progress per spec §4.1's `lastMsgId` parameter)
/// rather than the whole conversation. Either way the sequence cursor never
/// rewinds, via `GREATEST`.
pub async fn mark_conversation_read(
    pool: &DbPool,
    conversation_id: Uuid,
    user_id: Uuid,
    last_message_id: Option<Uuid>,
) -> Result<(), CoreError> {
    let last_seq: i64 = match last_message_id {
        Some(message_id) => sqlx::query_scalar(
            "SELECT seq FROM messages WHERE id = $1 AND conversation_id = $2",
        )
        .bind(message_id)
        .bind(conversation_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CoreError::NotFound("message".into()))?,
        None => {
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_one(pool)
                .await?
        }
    };

    sqlx::query(
        r#"
        UPDATE conversation_members
        SET last_read_seq = GREATEST(last_read_seq, $1),
            last_read_message_id = CASE
                WHEN $4::uuid IS NOT NULL AND $1 > last_read_seq THEN $4
                ELSE last_read_message_id
            END
        WHERE conversation_id = $2 AND user_id = $3
        "#,
    )
    .bind(last_seq)
    .bind(conversation_id)
    .bind(user_id)
    .bind(last_message_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Messages newer than the member's last-read sequence, excluding their own.
pub async fn get_unread_count(
    pool: &DbPool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<i64, CoreError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM messages m
        WHERE m.conversation_id = $1
          AND m.sender_id IS DISTINCT FROM $2
          AND m.deleted_at IS NULL
          AND m.seq > (
              SELECT last_read_seq FROM conversation_members
              WHERE conversation_id = $1 AND user_id = $2
          )
        "#,
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

// =============================================================================
// Receipts
// =============================================================================

pub async fn mark_delivered(
    pool: &DbPool,
    message_ids: &[Uuid],
    user_id: Uuid,
) -> Result<(), CoreError> {
    if message_ids.is_empty() {
        return Ok(());
    }
    let now = Utc::now();
    for message_id in message_ids {
        sqlx::query(
            r#"
            INSERT INTO receipts (message_id, user_id, status, updated_at)
            VALUES ($1, $2, 'delivered', $3)
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .bind(now)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Upsert a `read` receipt. Never emitted if a `read` row already exists for
/// the pair — once read, always read.
pub async fn mark_read(
    pool: &DbPool,
    message_id: Uuid,
    user_id: Uuid,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO receipts (message_id, user_id, status, updated_at)
        VALUES ($1, $2, 'read', $3)
        ON CONFLICT (message_id, user_id)
        DO UPDATE SET status = 'read', updated_at = EXCLUDED.updated_at
        WHERE receipts.status != 'read'
        "#,
    )
    .bind(message_id)
    .bind(user_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn receipt_status(
    pool: &DbPool,
    message_id: Uuid,
    user_id: Uuid,
) -> Result<Option<ReceiptStatus>, CoreError> {
    let status = sqlx::query_scalar::<_, ReceiptStatus>(
        "SELECT status FROM receipts WHERE message_id = $1 AND user_id = $2",
    )
    .bind(message_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(status)
}

// =============================================================================
// Blocks / stars
// =============================================================================

/// True iff either direction is blocked.
pub async fn is_blocked(pool: &DbPool, a: Uuid, b: Uuid) -> Result<bool, CoreError> {
    let blocked: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM blocks
            WHERE (blocker_id = $1 AND blocked_id = $2)
               OR (blocker_id = $2 AND blocked_id = $1)
        )
        "#,
    )
    .bind(a)
    .bind(b)
    .fetch_one(pool)
    .await?;

    Ok(blocked)
}

pub async fn create_block(pool: &DbPool, blocker_id: Uuid, blocked_id: Uuid) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO blocks (blocker_id, blocked_id, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (blocker_id, blocked_id) DO NOTHING
        "#,
    )
    .bind(blocker_id)
    .bind(blocked_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn remove_block(pool: &DbPool, blocker_id: Uuid, blocked_id: Uuid) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM blocks WHERE blocker_id = $1 AND blocked_id = $2")
        .bind(blocker_id)
        .bind(blocked_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn star_message(pool: &DbPool, user_id: Uuid, message_id: Uuid) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO stars (user_id, message_id, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id, message_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(message_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn unstar_message(pool: &DbPool, user_id: Uuid, message_id: Uuid) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM stars WHERE user_id = $1 AND message_id = $2")
        .bind(user_id)
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_starred_messages(
    pool: &DbPool,
    user_id: Uuid,
    limit: Option<i64>,
) -> Result<Vec<Message>, CoreError> {
    let limit = clamp_limit(limit);
    let messages = sqlx::query_as::<_, Message>(
        r#"
        SELECT m.id, m.conversation_id, m.sender_id, m.seq, m.body, m.attachment_id, m.client_msg_id, m.created_at, m.edited_at, m.deleted_at
        FROM messages m
        INNER JOIN stars s ON s.message_id = m.id
        WHERE s.user_id = $1
        ORDER BY s.created_at DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_limit_defaults_to_fifty() {
        assert_eq!(clamp_limit(None), 50);
    }

    #[test]
    fn clamp_limit_caps_at_one_hundred() {
        assert_eq!(clamp_limit(Some(500)), 100);
    }

    #[test]
    fn clamp_limit_floors_at_one() {
        assert_eq!(clamp_limit(Some(-5)), 1);
    }

    async fn test_pool() -> Option<DbPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        PgPoolOptions::new().max_connections(2).connect(&url).await.ok()
    }

    #[tokio::test]
    async fn create_and_fetch_conversation_round_trips() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let creator = Uuid::new_v4();
        let conversation = create_conversation(
            &pool,
            ConversationKind::Direct,
            None,
            creator,
            &[creator, Uuid::new_v4()],
        )
        .await
        .unwrap();

        let fetched = get_conversation(&pool, conversation.id).await.unwrap();
        assert_eq!(fetched.id, conversation.id);
    }
}
