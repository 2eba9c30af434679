//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! to the server layer and hydrated into wire payloads without copying
//! field by field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{
    ConnectionId, ConversationId, GroupId, MediaId, MediaKind, MessageId, MessageKind,
    MessageTarget, NotificationId, NotificationKind, UserId,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered user. `is_online` and `last_seen` are mutated only by the
/// presence tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub full_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session (advisory mirror of a live connection)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// The direct-message thread between two users. At most one row exists per
/// unordered pair; the resolver queries both orderings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// The participant that is not `user`.
    pub fn other_participant(&self, user: UserId) -> UserId {
        if self.user_a == user {
            self.user_b
        } else {
            self.user_a
        }
    }

    pub fn has_participant(&self, user: UserId) -> bool {
        self.user_a == user || self.user_b == user
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// A group joined with its creator name and member count, as listed for a
/// user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupOverview {
    pub group: Group,
    pub created_by_name: String,
    pub member_count: i64,
}

/// A member row joined with the user's directory fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMemberProfile {
    pub user_id: UserId,
    pub username: String,
    pub full_name: Option<String>,
    pub is_admin: bool,
    pub is_online: bool,
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Addressed to exactly one conversation or group;
/// the two-nullable-columns storage shape never leaves this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub target: MessageTarget,
    pub kind: MessageKind,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub reply_to: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Metadata for an uploaded file; the bytes live on disk under
/// `file_path`, relative to the configured media root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Media {
    pub id: MediaId,
    pub file_name: String,
    pub file_path: String,
    pub content_type: String,
    pub file_size: i64,
    pub kind: MediaKind,
    pub thumbnail_path: Option<String>,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub from_user_id: Option<UserId>,
    pub title: String,
    pub body: Option<String>,
    pub kind: NotificationKind,
    pub related_entity: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
