//! The message router: the protocol core behind every real-time command.
//!
//! Every send follows the same shape: authorize, persist (one
//! transaction), then publish. Publication is best-effort fan-out through
//! the session registry; a recipient with zero live sessions is the
//! normal offline path, never an error, and nothing about a failed push
//! unwinds the write.

use chrono::Utc;

use parley_shared::{
    preview, ConnectionId, GroupId, MediaId, MessageId, MessageKind, MessagePayload,
    MessageTarget, NotificationKind, ServerEvent, UserId, PREVIEW_MAX_CHARS,
};
use parley_store::{Database, Message, StoreError};

use crate::error::ServerError;
use crate::notify::NotificationDispatcher;
use crate::payload::hydrate_message;
use crate::rate_limit::KeyedLimiter;
use crate::registry::SessionRegistry;
use crate::state::SharedDb;

const MEDIA_PREVIEW_DIRECT: &str = "Sent you media files";
const MEDIA_PREVIEW_GROUP: &str = "Sent media files to the group";

pub struct MessageRouter {
    db: SharedDb,
    registry: SessionRegistry,
    notifier: NotificationDispatcher,
    /// Typing signals per sender; excess is dropped silently.
    typing_limiter: KeyedLimiter<UserId>,
}

impl MessageRouter {
    pub fn new(db: SharedDb, registry: SessionRegistry, notifier: NotificationDispatcher) -> Self {
        Self {
            db,
            registry,
            notifier,
            // 4 signals/s sustained, burst of 8
            typing_limiter: KeyedLimiter::new(4.0, 8.0),
        }
    }

    // ------------------------------------------------------------------
    // Direct messages
    // ------------------------------------------------------------------

    /// Send into a two-party conversation, resolving (or creating) the
    /// conversation first.
    pub async fn send_direct(
        &self,
        sender: UserId,
        recipient: UserId,
        content: String,
        media_ids: Vec<MediaId>,
        reply_to: Option<MessageId>,
    ) -> Result<MessagePayload, ServerError> {
        validate_content(&content, &media_ids)?;
        let notification_body = notification_preview(&content, &media_ids, MEDIA_PREVIEW_DIRECT);

        let payload = {
            let db = self.db.lock().await;
            db.get_user(recipient).map_err(|e| match e {
                StoreError::NotFound => ServerError::NotFound("Recipient"),
                other => other.into(),
            })?;

            let conversation = db.find_or_create_conversation(sender, recipient)?;
            let target = MessageTarget::Direct {
                conversation_id: conversation.id,
            };

            self.persist_message(&db, sender, target, content, &media_ids, reply_to)?
        };

        self.registry
            .send_to_user(
                recipient,
                ServerEvent::ReceiveDirectMessage(payload.clone()),
            )
            .await;
        self.registry
            .send_to_user(
                sender,
                ServerEvent::MessageSentConfirmation(payload.clone()),
            )
            .await;

        self.notifier
            .dispatch(
                recipient,
                Some(sender),
                "New Message",
                Some(notification_body),
                NotificationKind::NewMessage,
                Some(payload.id.to_string()),
            )
            .await;

        Ok(payload)
    }

    // ------------------------------------------------------------------
    // Group messages
    // ------------------------------------------------------------------

    /// Broadcast into a group. Membership is checked up front and the
    /// delivery target set is the membership snapshot taken at send time.
    pub async fn send_group(
        &self,
        sender: UserId,
        group_id: GroupId,
        content: String,
        media_ids: Vec<MediaId>,
    ) -> Result<MessagePayload, ServerError> {
        validate_content(&content, &media_ids)?;
        let notification_body = notification_preview(&content, &media_ids, MEDIA_PREVIEW_GROUP);

        let (payload, members) = {
            let db = self.db.lock().await;
            // A missing group looks exactly like a group the sender does
            // not belong to.
            if !db.is_group_member(group_id, sender)? {
                return Err(ServerError::NotAMember);
            }
            let members = db.group_member_ids(group_id)?;

            let target = MessageTarget::Group { group_id };
            let payload =
                self.persist_message(&db, sender, target, content, &media_ids, None)?;
            (payload, members)
        };

        for member in &members {
            if *member == sender {
                continue;
            }
            self.registry
                .send_to_user(*member, ServerEvent::ReceiveGroupMessage(payload.clone()))
                .await;
        }
        self.registry
            .send_to_user(
                sender,
                ServerEvent::MessageSentConfirmation(payload.clone()),
            )
            .await;

        for member in &members {
            if *member == sender {
                continue;
            }
            self.notifier
                .dispatch(
                    *member,
                    Some(sender),
                    "New Group Message",
                    Some(notification_body.clone()),
                    NotificationKind::NewGroupMessage,
                    Some(group_id.to_string()),
                )
                .await;
        }

        Ok(payload)
    }

    /// Shared persist step: ownership-filter the media references, infer
    /// the kind, validate the reply reference, write everything in one
    /// transaction, and hydrate the result.
    fn persist_message(
        &self,
        db: &Database,
        sender: UserId,
        target: MessageTarget,
        content: String,
        media_ids: &[MediaId],
        reply_to: Option<MessageId>,
    ) -> Result<MessagePayload, ServerError> {
        // References not uploaded by the sender are dropped, not fatal.
        let owned: Vec<MediaId> = db
            .media_owned_by(media_ids, sender)?
            .into_iter()
            .map(|m| m.id)
            .collect();

        let kind = if media_ids.is_empty() {
            MessageKind::Text
        } else {
            MessageKind::Media
        };

        let message = Message {
            id: MessageId::new(),
            content,
            sender_id: sender,
            target,
            kind,
            is_read: false,
            read_at: None,
            is_deleted: false,
            reply_to: validated_reply(db, reply_to, target)?,
            sent_at: Utc::now(),
        };

        db.insert_message(&message, &owned)?;
        Ok(hydrate_message(db, &message)?)
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Idempotent read-receipt. Only the first transition stamps read-at
    /// and notifies the original sender; everything that would leak the
    /// message's existence to outsiders is silently ignored.
    pub async fn mark_read(
        &self,
        reader: UserId,
        message_id: MessageId,
    ) -> Result<(), ServerError> {
        let flipped_sender = {
            let db = self.db.lock().await;
            let message = match db.get_message(message_id) {
                Ok(message) => message,
                Err(StoreError::NotFound) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            // read tracking applies to conversation messages only
            let Some(conversation_id) = message.target.conversation_id() else {
                return Ok(());
            };
            let conversation = db.get_conversation(conversation_id)?;
            if !conversation.has_participant(reader) {
                return Ok(());
            }
            if message.sender_id == reader {
                return Ok(());
            }

            if db.mark_message_read(message_id, Utc::now())? {
                Some(message.sender_id)
            } else {
                None
            }
        };

        if let Some(sender) = flipped_sender {
            self.registry
                .send_to_user(sender, ServerEvent::MessageRead { message_id })
                .await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typing indicators
    // ------------------------------------------------------------------

    /// Forward an ephemeral typing signal. Nothing is persisted, and the
    /// per-sender limiter drops abusive bursts on the floor.
    pub async fn typing(
        &self,
        sender: UserId,
        recipient: UserId,
        started: bool,
    ) -> Result<(), ServerError> {
        if !self.typing_limiter.check(sender).await {
            return Ok(());
        }

        let event = if started {
            ServerEvent::UserTyping { user_id: sender }
        } else {
            ServerEvent::UserStoppedTyping { user_id: sender }
        };
        self.registry.send_to_user(recipient, event).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Group channel subscriptions
    // ------------------------------------------------------------------

    /// Membership-checked subscription bookkeeping. Delivery resolves the
    /// membership snapshot at send time and never consults this.
    pub async fn join_group_channel(
        &self,
        user: UserId,
        connection: ConnectionId,
        group_id: GroupId,
    ) -> Result<(), ServerError> {
        {
            let db = self.db.lock().await;
            if !db.is_group_member(group_id, user)? {
                return Err(ServerError::NotAMember);
            }
        }
        self.registry.subscribe_group(connection, group_id).await;
        Ok(())
    }

    pub async fn leave_group_channel(
        &self,
        connection: ConnectionId,
        group_id: GroupId,
    ) -> Result<(), ServerError> {
        self.registry.unsubscribe_group(connection, group_id).await;
        Ok(())
    }
}

fn validate_content(content: &str, media_ids: &[MediaId]) -> Result<(), ServerError> {
    if content.trim().is_empty() && media_ids.is_empty() {
        return Err(ServerError::Validation(
            "Message content cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Preview string for the notification: fixed placeholder for media-only
/// messages, truncated content otherwise.
fn notification_preview(content: &str, media_ids: &[MediaId], placeholder: &str) -> String {
    if content.trim().is_empty() && !media_ids.is_empty() {
        placeholder.to_string()
    } else {
        preview(content, PREVIEW_MAX_CHARS)
    }
}

/// A reply reference survives only when the target message exists in the
/// same conversation or group; otherwise it is dropped like an unowned
/// media reference.
fn validated_reply(
    db: &Database,
    reply_to: Option<MessageId>,
    target: MessageTarget,
) -> Result<Option<MessageId>, StoreError> {
    let Some(reply_id) = reply_to else {
        return Ok(None);
    };
    match db.get_message(reply_id) {
        Ok(original) if original.target == target => Ok(Some(reply_id)),
        Ok(_) => Ok(None),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::{mpsc, Mutex};

    use parley_shared::ConnectionId;
    use parley_store::{Group, User};

    struct Fixture {
        router: MessageRouter,
        registry: SessionRegistry,
        db: SharedDb,
        _dir: tempfile::TempDir,
        alice: User,
        bob: User,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let database = Database::open_at(&dir.path().join("test.db")).unwrap();

        let alice = sample_user("alice");
        let bob = sample_user("bob");
        database.create_user(&alice).unwrap();
        database.create_user(&bob).unwrap();

        let db: SharedDb = Arc::new(Mutex::new(database));
        let registry = SessionRegistry::new();
        let notifier = NotificationDispatcher::new(db.clone(), registry.clone());
        let router = MessageRouter::new(db.clone(), registry.clone(), notifier);

        Fixture {
            router,
            registry,
            db,
            _dir: dir,
            alice,
            bob,
        }
    }

    fn sample_user(username: &str) -> User {
        User {
            id: UserId::new(),
            username: username.to_string(),
            full_name: None,
            bio: None,
            avatar_url: None,
            is_online: false,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    async fn connect(
        fx: &Fixture,
        user: UserId,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();
        fx.registry.admit(user, connection, tx).await;
        (connection, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_offline_recipient_message_is_persisted() {
        let fx = fixture().await;
        let (_conn, mut sender_rx) = connect(&fx, fx.alice.id).await;

        let payload = fx
            .router
            .send_direct(fx.alice.id, fx.bob.id, "hello".to_string(), vec![], None)
            .await
            .unwrap();

        // sender got the confirmation even though the recipient is offline
        let events = drain(&mut sender_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::MessageSentConfirmation(_)]
        ));

        // retrievable via history, identical content
        let db = fx.db.lock().await;
        let conversation = db
            .find_conversation_between(fx.alice.id, fx.bob.id)
            .unwrap()
            .unwrap();
        let history = db.conversation_messages(conversation.id, 50, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[0].id, payload.id);
        assert!(!history[0].is_read);
    }

    #[tokio::test]
    async fn test_online_recipient_gets_message_and_notification() {
        let fx = fixture().await;
        let (_a, _alice_rx) = connect(&fx, fx.alice.id).await;
        let (_b, mut bob_rx) = connect(&fx, fx.bob.id).await;

        fx.router
            .send_direct(fx.alice.id, fx.bob.id, "ping".to_string(), vec![], None)
            .await
            .unwrap();

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ServerEvent::ReceiveDirectMessage(payload) => {
                assert_eq!(payload.content, "ping");
                assert_eq!(payload.sender_name, "alice");
            }
            other => panic!("expected message, got {other:?}"),
        }
        match &events[1] {
            ServerEvent::ReceiveNotification(notification) => {
                assert_eq!(notification.kind, NotificationKind::NewMessage);
                assert_eq!(notification.body.as_deref(), Some("ping"));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multi_device_sender_confirmation() {
        let fx = fixture().await;
        let (_c1, mut rx1) = connect(&fx, fx.alice.id).await;
        let (_c2, mut rx2) = connect(&fx, fx.alice.id).await;

        fx.router
            .send_direct(fx.alice.id, fx.bob.id, "hi".to_string(), vec![], None)
            .await
            .unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let events = drain(rx);
            assert!(matches!(
                events.as_slice(),
                [ServerEvent::MessageSentConfirmation(_)]
            ));
        }
    }

    #[tokio::test]
    async fn test_empty_message_without_media_is_rejected() {
        let fx = fixture().await;
        let err = fx
            .router
            .send_direct(fx.alice.id, fx.bob.id, "  ".to_string(), vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_foreign_media_is_dropped_not_fatal() {
        let fx = fixture().await;

        let (mine, theirs) = {
            let db = fx.db.lock().await;
            let mut mine = sample_media(fx.alice.id);
            mine.file_name = "mine.png".to_string();
            let theirs = sample_media(fx.bob.id);
            db.insert_media(&mine).unwrap();
            db.insert_media(&theirs).unwrap();
            (mine, theirs)
        };

        let payload = fx
            .router
            .send_direct(
                fx.alice.id,
                fx.bob.id,
                "with media".to_string(),
                vec![theirs.id, mine.id],
                None,
            )
            .await
            .unwrap();

        assert_eq!(payload.kind, MessageKind::Media);
        assert_eq!(payload.media.len(), 1);
        assert_eq!(payload.media[0].id, mine.id);
        assert_eq!(payload.media[0].uploader_name, "alice");
    }

    fn sample_media(uploader: UserId) -> parley_store::Media {
        parley_store::Media {
            id: parley_shared::MediaId::new(),
            file_name: "photo.png".to_string(),
            file_path: format!("{}.png", uuid::Uuid::new_v4()),
            content_type: "image/png".to_string(),
            file_size: 64,
            kind: parley_shared::MediaKind::Image,
            thumbnail_path: None,
            uploaded_by: uploader,
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_media_only_notification_uses_placeholder() {
        let fx = fixture().await;
        let (_b, mut bob_rx) = connect(&fx, fx.bob.id).await;

        let media = {
            let db = fx.db.lock().await;
            let media = sample_media(fx.alice.id);
            db.insert_media(&media).unwrap();
            media
        };

        fx.router
            .send_direct(fx.alice.id, fx.bob.id, String::new(), vec![media.id], None)
            .await
            .unwrap();

        let events = drain(&mut bob_rx);
        match &events[1] {
            ServerEvent::ReceiveNotification(notification) => {
                assert_eq!(notification.body.as_deref(), Some(MEDIA_PREVIEW_DIRECT));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reply_reference_survives_only_within_target() {
        let fx = fixture().await;

        let first = fx
            .router
            .send_direct(fx.alice.id, fx.bob.id, "original".to_string(), vec![], None)
            .await
            .unwrap();

        let reply = fx
            .router
            .send_direct(
                fx.bob.id,
                fx.alice.id,
                "replying".to_string(),
                vec![],
                Some(first.id),
            )
            .await
            .unwrap();
        let reply_preview = reply.reply_to.expect("reply preview resolved");
        assert_eq!(reply_preview.id, first.id);
        assert_eq!(reply_preview.content, "original");

        // a dangling reference is dropped silently
        let dangling = fx
            .router
            .send_direct(
                fx.alice.id,
                fx.bob.id,
                "dangling".to_string(),
                vec![],
                Some(MessageId::new()),
            )
            .await
            .unwrap();
        assert!(dangling.reply_to.is_none());
    }

    #[tokio::test]
    async fn test_group_send_requires_membership() {
        let fx = fixture().await;
        let group_id = {
            let db = fx.db.lock().await;
            let group = Group {
                id: GroupId::new(),
                name: "team".to_string(),
                description: None,
                created_by: fx.bob.id,
                created_at: Utc::now(),
            };
            db.create_group(&group, &[]).unwrap();
            group.id
        };

        let err = fx
            .router
            .send_group(fx.alice.id, group_id, "hi".to_string(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotAMember));

        // a missing group answers the same way
        let err = fx
            .router
            .send_group(fx.alice.id, GroupId::new(), "hi".to_string(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotAMember));

        // and nothing was persisted
        let db = fx.db.lock().await;
        assert!(db.group_messages(group_id, 50, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_delivery_uses_membership_snapshot() {
        let fx = fixture().await;
        let carol = sample_user("carol");
        let group_id = {
            let db = fx.db.lock().await;
            db.create_user(&carol).unwrap();
            let group = Group {
                id: GroupId::new(),
                name: "trio".to_string(),
                description: None,
                created_by: fx.alice.id,
                created_at: Utc::now(),
            };
            db.create_group(&group, &[fx.bob.id, carol.id]).unwrap();
            group.id
        };

        let (_a, mut alice_rx) = connect(&fx, fx.alice.id).await;
        let (_c, mut carol_rx) = connect(&fx, carol.id).await;

        // carol leaves before the send resolves membership
        {
            let db = fx.db.lock().await;
            db.remove_group_member(group_id, carol.id).unwrap();
        }

        fx.router
            .send_group(fx.bob.id, group_id, "for the group".to_string(), vec![])
            .await
            .unwrap();

        let alice_events = drain(&mut alice_rx);
        assert!(alice_events
            .iter()
            .any(|e| matches!(e, ServerEvent::ReceiveGroupMessage(_))));
        // the ex-member hears nothing at all
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_flow_and_idempotence() {
        let fx = fixture().await;
        let (_a, mut alice_rx) = connect(&fx, fx.alice.id).await;

        let payload = fx
            .router
            .send_direct(fx.alice.id, fx.bob.id, "read me".to_string(), vec![], None)
            .await
            .unwrap();
        drain(&mut alice_rx);

        // the reader marking it twice yields exactly one confirmation
        fx.router.mark_read(fx.bob.id, payload.id).await.unwrap();
        fx.router.mark_read(fx.bob.id, payload.id).await.unwrap();

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::MessageRead { message_id } if message_id == payload.id));

        let db = fx.db.lock().await;
        let message = db.get_message(payload.id).unwrap();
        assert!(message.is_read);
        assert!(message.read_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_read_ignores_sender_and_outsiders() {
        let fx = fixture().await;
        let (_a, mut alice_rx) = connect(&fx, fx.alice.id).await;

        let payload = fx
            .router
            .send_direct(fx.alice.id, fx.bob.id, "mine".to_string(), vec![], None)
            .await
            .unwrap();
        drain(&mut alice_rx);

        // sender marking their own message: no-op
        fx.router.mark_read(fx.alice.id, payload.id).await.unwrap();
        // an outsider: silently ignored, no information leak
        let mallory = sample_user("mallory");
        {
            let db = fx.db.lock().await;
            db.create_user(&mallory).unwrap();
        }
        fx.router.mark_read(mallory.id, payload.id).await.unwrap();
        // a missing message: also silent
        fx.router.mark_read(fx.bob.id, MessageId::new()).await.unwrap();

        assert!(drain(&mut alice_rx).is_empty());
        let db = fx.db.lock().await;
        assert!(!db.get_message(payload.id).unwrap().is_read);
    }

    #[tokio::test]
    async fn test_typing_forwards_and_is_rate_limited() {
        let fx = fixture().await;
        let (_b, mut bob_rx) = connect(&fx, fx.bob.id).await;

        for _ in 0..20 {
            fx.router.typing(fx.alice.id, fx.bob.id, true).await.unwrap();
        }
        let delivered = drain(&mut bob_rx).len();
        // burst capacity is 8; the tail of the flood is dropped
        assert!((8..=10).contains(&delivered), "delivered {delivered}");
    }

    #[tokio::test]
    async fn test_stop_typing_event_kind() {
        let fx = fixture().await;
        let (_b, mut bob_rx) = connect(&fx, fx.bob.id).await;

        fx.router.typing(fx.alice.id, fx.bob.id, false).await.unwrap();
        let events = drain(&mut bob_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::UserStoppedTyping { user_id }] if *user_id == fx.alice.id
        ));
    }

    #[tokio::test]
    async fn test_join_group_channel_checks_membership() {
        let fx = fixture().await;
        let (connection, _rx) = connect(&fx, fx.alice.id).await;

        let group_id = {
            let db = fx.db.lock().await;
            let group = Group {
                id: GroupId::new(),
                name: "insiders".to_string(),
                description: None,
                created_by: fx.bob.id,
                created_at: Utc::now(),
            };
            db.create_group(&group, &[]).unwrap();
            group.id
        };

        let err = fx
            .router
            .join_group_channel(fx.alice.id, connection, group_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotAMember));

        {
            let db = fx.db.lock().await;
            db.add_group_member(group_id, fx.alice.id, false).unwrap();
        }
        fx.router
            .join_group_channel(fx.alice.id, connection, group_id)
            .await
            .unwrap();
        fx.router
            .leave_group_channel(connection, group_id)
            .await
            .unwrap();
    }
}
