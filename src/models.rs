//! Database models for the messaging core.
//!
//! These map directly to rows returned by [`crate::store`] queries. Enum-like
//! string columns (`role`, `kind`, `status`) are typed as Rust enums at the
//! model boundary so callers never match on raw strings.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered account. Authentication lives in [`crate::auth_service`]; this
/// is just the row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub show_online_status: bool,
    pub read_receipts_enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A rotating refresh token. Only the SHA-256 hash of the opaque token value
/// is ever stored; the raw token is handed to the client once and never seen
/// again (spec §4.3).
#[derive(Debug, Clone, FromRow)]
pub struct RefreshCredential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub revoked_at: Option<chrono::DateTime<chrono::Utc>>,
    pub replaced_by: Option<Uuid>,
}

impl RefreshCredential {
    pub fn is_active(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// A linked external identity provider account (e.g. an OAuth login), kept
/// distinct from password auth so a user can hold more than one.
#[derive(Debug, Clone, FromRow)]
pub struct FederatedIdentity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A conversation: either a 1:1 direct message (exactly two members, no
/// title) or a group (1-100 members, a title, and role-gated moderation).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub creator_id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub archived_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Conversation {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Member,
    Admin,
}

/// A user's membership row in a conversation. `left_at` marks a soft
/// departure (spec's member-removal semantics mirror the teacher's
/// soft-delete membership pattern).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ConversationMember {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    pub left_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_read_seq: i64,
}

impl ConversationMember {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// A message body plus its monotonic per-conversation sequence number.
///
/// `seq` is assigned transactionally at insert time (`MAX(seq)+1` scoped to
/// `conversation_id`) and is the ordering/cursor key for pagination and
/// gap-detection.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Null once the sender's account has been deleted; the message itself
    /// survives (spec §3: `ON DELETE SET NULL`, never cascaded).
    pub sender_id: Option<Uuid>,
    pub seq: i64,
    pub body: Option<String>,
    /// Set when the message carries an attachment instead of (or alongside)
    /// body text; spec §3's "body non-empty OR attachment present" invariant
    /// is enforced where the message is constructed, not here.
    pub attachment_id: Option<Uuid>,
    /// Never serialized directly — the socket path echoes it back to the
    /// sending connection only, as `temp_id` (spec §6), so it must not leak
    /// to other room members via the generic `Message` payload.
    #[serde(skip_serializing)]
    pub client_msg_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub edited_at: Option<chrono::DateTime<chrono::Utc>>,
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Uploading,
    Ready,
    Error,
}

/// A file/media reference a user uploaded into a conversation (spec §3).
/// The messaging core owns this row's lifecycle (`uploading` → `ready` or
/// `error`); the presigned-URL upload flow that writes the bytes to
/// `bucket`/`key` is an external collaborator.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Attachment {
    pub id: Uuid,
    pub uploader_id: Uuid,
    pub conversation_id: Uuid,
    pub bucket: String,
    pub key: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub content_hash: Option<String>,
    pub status: AttachmentStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Attachment {
    pub fn is_ready(&self) -> bool {
        matches!(self.status, AttachmentStatus::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

/// Per-member, per-message delivery/read state. A `read` row implies
/// delivery happened first — the ReceiptEngine enforces this invariant at
/// write time rather than relying on a CHECK constraint (spec §4.7).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Receipt {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub status: ReceiptStatus,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Denormalized "read up to" marker per member, used for unread-count
/// queries without scanning the full receipt table.
#[derive(Debug, Clone, FromRow)]
pub struct ReadStatus {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub last_read_seq: i64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A one-directional block: `blocker_id` no longer receives direct messages
/// or invitations from `blocked_id`.
#[derive(Debug, Clone, FromRow)]
pub struct Block {
    pub blocker_id: Uuid,
    pub blocked_id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A user's personal star/bookmark on a message.
#[derive(Debug, Clone, FromRow)]
pub struct Star {
    pub user_id: Uuid,
    pub message_id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
