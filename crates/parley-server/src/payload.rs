//! Assembly of wire payloads from store rows.
//!
//! The hydration contract: sender display names are resolved, attached
//! media carries its uploader's name, reply chains resolve exactly one
//! level, and soft-deleted content is blanked.

use parley_shared::{
    preview, MediaPayload, MessagePayload, NotificationPayload, ReplyPreview, UserPayload,
    PREVIEW_MAX_CHARS,
};
use parley_store::{Database, Media, Message, Notification, StoreError, User};

/// Build the full message payload pushed to clients and returned by the
/// history and search endpoints.
pub fn hydrate_message(db: &Database, message: &Message) -> Result<MessagePayload, StoreError> {
    let sender_name = db.display_name(message.sender_id)?;

    let media = db
        .media_for_message(message.id)?
        .into_iter()
        .map(|(media, uploader_name)| media_payload(media, uploader_name))
        .collect();

    let reply_to = match message.reply_to {
        Some(reply_id) => match db.get_message(reply_id) {
            Ok(original) => {
                let original_sender = db.display_name(original.sender_id)?;
                let content = if original.is_deleted {
                    String::new()
                } else {
                    preview(&original.content, PREVIEW_MAX_CHARS)
                };
                Some(ReplyPreview {
                    id: original.id,
                    sender_id: original.sender_id,
                    sender_name: original_sender,
                    content,
                })
            }
            // the referenced message was deleted from under us
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e),
        },
        None => None,
    };

    let content = if message.is_deleted {
        String::new()
    } else {
        message.content.clone()
    };

    Ok(MessagePayload {
        id: message.id,
        target: message.target,
        sender_id: message.sender_id,
        sender_name,
        content,
        kind: message.kind,
        sent_at: message.sent_at,
        is_read: message.is_read,
        is_deleted: message.is_deleted,
        media,
        reply_to,
    })
}

pub fn media_payload(media: Media, uploader_name: String) -> MediaPayload {
    MediaPayload {
        id: media.id,
        file_name: media.file_name,
        file_path: media.file_path,
        content_type: media.content_type,
        file_size: media.file_size,
        kind: media.kind,
        thumbnail_path: media.thumbnail_path,
        uploaded_at: media.uploaded_at,
        uploaded_by: media.uploaded_by,
        uploader_name,
    }
}

pub fn user_payload(user: User) -> UserPayload {
    UserPayload {
        id: user.id,
        username: user.username,
        full_name: user.full_name,
        is_online: user.is_online,
        last_seen: user.last_seen,
        avatar_url: user.avatar_url,
        bio: user.bio,
    }
}

pub fn notification_payload(
    notification: Notification,
    from_user_name: Option<String>,
) -> NotificationPayload {
    NotificationPayload {
        id: notification.id,
        title: notification.title,
        body: notification.body,
        kind: notification.kind,
        is_read: notification.is_read,
        created_at: notification.created_at,
        related_entity: notification.related_entity,
        from_user_id: notification.from_user_id,
        from_user_name,
    }
}
