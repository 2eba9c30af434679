//! Wire protocol for the real-time channel, plus the hydrated payload
//! structs shared with the REST surface.
//!
//! Frames are JSON text. Commands and events are tag/content encoded so a
//! frame reads as `{"op": "send-direct-message", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ConversationId, GroupId, MediaId, MediaKind, MessageId, MessageKind, MessageTarget,
    NotificationId, NotificationKind, UserId,
};

/// Longest preview string embedded in reply previews and notifications.
pub const PREVIEW_MAX_CHARS: usize = 100;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Operations a client may invoke over its live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    SendDirectMessage {
        recipient: UserId,
        content: String,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },
    SendDirectMessageWithMedia {
        recipient: UserId,
        content: String,
        media_ids: Vec<MediaId>,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },
    SendGroupMessage {
        group_id: GroupId,
        content: String,
    },
    SendGroupMessageWithMedia {
        group_id: GroupId,
        content: String,
        media_ids: Vec<MediaId>,
    },
    MarkMessageRead {
        message_id: MessageId,
    },
    JoinGroupChannel {
        group_id: GroupId,
    },
    LeaveGroupChannel {
        group_id: GroupId,
    },
    Typing {
        recipient: UserId,
    },
    StopTyping {
        recipient: UserId,
    },
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Events pushed to live connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ReceiveDirectMessage(MessagePayload),
    /// Echo of a sent message back to the sender's own sessions, so
    /// multi-device senders stay in sync.
    MessageSentConfirmation(MessagePayload),
    ReceiveGroupMessage(MessagePayload),
    UserOnline(PresenceUpdate),
    UserOffline(PresenceUpdate),
    MessageRead {
        message_id: MessageId,
    },
    UserTyping {
        user_id: UserId,
    },
    UserStoppedTyping {
        user_id: UserId,
    },
    ReceiveNotification(NotificationPayload),
    Error {
        reason: String,
    },
}

/// Carried by `user-online` / `user-offline`; the new state is the event
/// name itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Hydrated payloads
// ---------------------------------------------------------------------------

/// A fully-hydrated message as delivered to clients: sender display name,
/// resolved media, and a one-level reply preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub target: MessageTarget,
    pub sender_id: UserId,
    pub sender_name: String,
    /// Blank when the message has been soft-deleted.
    pub content: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_deleted: bool,
    pub media: Vec<MediaPayload>,
    pub reply_to: Option<ReplyPreview>,
}

/// One level of the reply chain: enough for display, never the full chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub id: MediaId,
    pub file_name: String,
    pub file_path: String,
    pub content_type: String,
    pub file_size: i64,
    pub kind: MediaKind,
    pub thumbnail_path: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: UserId,
    pub uploader_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub id: UserId,
    pub username: String,
    pub full_name: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: NotificationId,
    pub title: String,
    pub body: Option<String>,
    pub kind: NotificationKind,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub related_entity: Option<String>,
    pub from_user_id: Option<UserId>,
    pub from_user_name: Option<String>,
}

/// One row of the caller's conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub other_user_id: UserId,
    pub other_user_name: String,
    pub other_user_online: bool,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPayload {
    pub id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub created_by: UserId,
    pub created_by_name: String,
    pub created_at: DateTime<Utc>,
    pub member_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberPayload {
    pub user_id: UserId,
    pub username: String,
    pub full_name: Option<String>,
    pub is_admin: bool,
    pub is_online: bool,
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Truncate `content` to at most `max` characters for previews, appending
/// an ellipsis when anything was cut. Works on character boundaries so
/// multi-byte content never splits mid-codepoint.
pub fn preview(content: &str, max: usize) -> String {
    let mut chars = content.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{truncated}…")
    } else {
        truncated
    }
}
