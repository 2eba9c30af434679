//! Notification dispatcher: persist, then best-effort push.
//!
//! A secondary side effect of the primary delivery path. It must never
//! fail the send that triggered it, so every error ends here as a log
//! line.

use chrono::Utc;
use tracing::error;

use parley_shared::{NotificationId, NotificationKind, ServerEvent, UserId};
use parley_store::Notification;

use crate::payload::notification_payload;
use crate::registry::SessionRegistry;
use crate::state::SharedDb;

pub struct NotificationDispatcher {
    db: SharedDb,
    registry: SessionRegistry,
}

impl NotificationDispatcher {
    pub fn new(db: SharedDb, registry: SessionRegistry) -> Self {
        Self { db, registry }
    }

    /// Store a notification for `recipient` and push it to their live
    /// sessions. Failures are logged and swallowed.
    pub async fn dispatch(
        &self,
        recipient: UserId,
        from: Option<UserId>,
        title: &str,
        body: Option<String>,
        kind: NotificationKind,
        related_entity: Option<String>,
    ) {
        let notification = Notification {
            id: NotificationId::new(),
            user_id: recipient,
            from_user_id: from,
            title: title.to_string(),
            body,
            kind,
            related_entity,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        };

        let payload = {
            let db = self.db.lock().await;
            if let Err(e) = db.insert_notification(&notification) {
                error!(recipient = %recipient, error = %e, "failed to store notification");
                return;
            }
            let from_user_name = match from {
                Some(from_user) => db.display_name(from_user).ok(),
                None => None,
            };
            notification_payload(notification, from_user_name)
        };

        self.registry
            .send_to_user(recipient, ServerEvent::ReceiveNotification(payload))
            .await;
    }
}
