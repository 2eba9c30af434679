//! Session registry and presence tracking.
//!
//! The only in-memory shared mutable structure in the system: a table of
//! live connections keyed by connection id, with a secondary index from
//! user id to that user's connection set. One mutex guards both maps, and
//! every presence transition is computed inside the same critical section
//! as the bookkeeping that caused it, so concurrent admits and dismissals
//! can never double-report a transition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use parley_shared::{ConnectionId, GroupId, ServerEvent, UserId};

/// Outbound handle to one connection's writer task.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Presence transition caused by an admit or dismiss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// First live session for the user.
    CameOnline,
    /// Last live session for the user went away.
    WentOffline,
    /// The user had other live sessions; no transition.
    Unchanged,
}

struct LiveSession {
    user_id: UserId,
    sender: EventSender,
    /// Group channels this session asked to follow. Advisory: delivery
    /// resolves membership at send time and never consults this.
    subscriptions: HashSet<GroupId>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<ConnectionId, LiveSession>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session. Never fails; the identity was
    /// authenticated upstream.
    pub async fn admit(
        &self,
        user: UserId,
        connection: ConnectionId,
        sender: EventSender,
    ) -> PresenceChange {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(
            connection,
            LiveSession {
                user_id: user,
                sender,
                subscriptions: HashSet::new(),
            },
        );
        let connections = inner.by_user.entry(user).or_default();
        let first = connections.is_empty();
        connections.insert(connection);

        if first {
            PresenceChange::CameOnline
        } else {
            PresenceChange::Unchanged
        }
    }

    /// Remove a session. Idempotent: dismissing an unknown connection
    /// returns `None` and changes nothing.
    pub async fn dismiss(&self, connection: ConnectionId) -> Option<(UserId, PresenceChange)> {
        let mut inner = self.inner.lock().await;
        let session = inner.sessions.remove(&connection)?;
        let user = session.user_id;

        let mut last = false;
        if let Some(connections) = inner.by_user.get_mut(&user) {
            connections.remove(&connection);
            if connections.is_empty() {
                inner.by_user.remove(&user);
                last = true;
            }
        }

        let change = if last {
            PresenceChange::WentOffline
        } else {
            PresenceChange::Unchanged
        };
        Some((user, change))
    }

    /// The user's live connection ids; empty when offline.
    pub async fn live_sessions_for(&self, user: UserId) -> Vec<ConnectionId> {
        let inner = self.inner.lock().await;
        inner
            .by_user
            .get(&user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Push an event to every live session of one user. Returns how many
    /// sessions accepted it; zero means the user is offline, which is the
    /// normal push-when-present steady state, not an error.
    pub async fn send_to_user(&self, user: UserId, event: ServerEvent) -> usize {
        let inner = self.inner.lock().await;
        let Some(connections) = inner.by_user.get(&user) else {
            return 0;
        };

        let mut delivered = 0;
        for connection in connections {
            if let Some(session) = inner.sessions.get(connection) {
                if session.sender.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    debug!(connection = %connection, "push to closing session dropped");
                }
            }
        }
        delivered
    }

    /// Push an event to every live session except the subject's own.
    /// Used for presence broadcasts.
    pub async fn broadcast_to_others(&self, subject: UserId, event: ServerEvent) -> usize {
        let inner = self.inner.lock().await;
        let mut delivered = 0;
        for session in inner.sessions.values() {
            if session.user_id == subject {
                continue;
            }
            if session.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Record a group-channel subscription for one session. Returns
    /// `false` for unknown connections.
    pub async fn subscribe_group(&self, connection: ConnectionId, group: GroupId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(&connection) {
            Some(session) => {
                session.subscriptions.insert(group);
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe_group(&self, connection: ConnectionId, group: GroupId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(&connection) {
            Some(session) => session.subscriptions.remove(&group),
            None => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::{MessageId, PresenceUpdate};

    fn channel() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_presence_transition_matrix() {
        let registry = SessionRegistry::new();
        let user = UserId::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();

        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        // first admit flips online, second does not
        assert_eq!(registry.admit(user, first, tx1).await, PresenceChange::CameOnline);
        assert_eq!(registry.admit(user, second, tx2).await, PresenceChange::Unchanged);

        // dismissing one of two sessions is not an offline transition
        assert_eq!(
            registry.dismiss(first).await,
            Some((user, PresenceChange::Unchanged))
        );
        // dismissing the last one is
        assert_eq!(
            registry.dismiss(second).await,
            Some((user, PresenceChange::WentOffline))
        );
        // dismissing an already-removed connection is a no-op
        assert_eq!(registry.dismiss(second).await, None);
    }

    #[tokio::test]
    async fn test_lookups_never_return_dismissed_connections() {
        let registry = SessionRegistry::new();
        let user = UserId::new();
        let connection = ConnectionId::new();
        let (tx, _rx) = channel();

        registry.admit(user, connection, tx).await;
        assert_eq!(registry.live_sessions_for(user).await, vec![connection]);
        assert_eq!(registry.connection_count().await, 1);

        registry.dismiss(connection).await;
        assert!(registry.live_sessions_for(user).await.is_empty());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_every_session() {
        let registry = SessionRegistry::new();
        let user = UserId::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.admit(user, ConnectionId::new(), tx1).await;
        registry.admit(user, ConnectionId::new(), tx2).await;

        let event = ServerEvent::MessageRead {
            message_id: MessageId::new(),
        };
        assert_eq!(registry.send_to_user(user, event).await, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_send_to_offline_user_delivers_nothing() {
        let registry = SessionRegistry::new();
        let event = ServerEvent::MessageRead {
            message_id: MessageId::new(),
        };
        assert_eq!(registry.send_to_user(UserId::new(), event).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_skips_subject_sessions() {
        let registry = SessionRegistry::new();
        let subject = UserId::new();
        let other = UserId::new();

        let (subject_tx, mut subject_rx) = channel();
        let (other_tx, mut other_rx) = channel();
        registry.admit(subject, ConnectionId::new(), subject_tx).await;
        registry.admit(other, ConnectionId::new(), other_tx).await;

        let event = ServerEvent::UserOnline(PresenceUpdate {
            user_id: subject,
            last_seen: chrono::Utc::now(),
        });
        assert_eq!(registry.broadcast_to_others(subject, event).await, 1);
        assert!(subject_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_group_subscriptions_track_per_session() {
        let registry = SessionRegistry::new();
        let user = UserId::new();
        let connection = ConnectionId::new();
        let group = GroupId::new();
        let (tx, _rx) = channel();
        registry.admit(user, connection, tx).await;

        assert!(registry.subscribe_group(connection, group).await);
        assert!(registry.unsubscribe_group(connection, group).await);
        // second unsubscribe: nothing left to remove
        assert!(!registry.unsubscribe_group(connection, group).await);
        // unknown connection
        assert!(!registry.subscribe_group(ConnectionId::new(), group).await);
    }
}
