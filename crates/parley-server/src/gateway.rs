//! The real-time gateway: WebSocket upgrade, per-connection lifecycle,
//! and command dispatch.
//!
//! Each accepted socket gets two tasks: this read loop and a writer task
//! draining an unbounded channel into the sink. The channel sender is what
//! the registry fans out to, so a slow client never blocks a send path.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use parley_shared::{ClientCommand, ConnectionId, PresenceUpdate, ServerEvent, UserId};
use parley_store::Session;

use crate::auth::bearer_from_headers;
use crate::error::ServerError;
use crate::registry::{EventSender, PresenceChange};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws` -- authenticate the bearer credential, then upgrade.
/// Browsers cannot set headers on socket upgrades, so the token is also
/// accepted as a query parameter.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let token = query
        .token
        .or_else(|| bearer_from_headers(&headers))
        .ok_or(ServerError::Unauthorized)?;

    let user = state
        .credentials
        .identify(&token)
        .await?
        .ok_or(ServerError::Unauthorized)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, user)))
}

async fn handle_socket(state: AppState, socket: WebSocket, user: UserId) {
    let connection = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to serialize event frame");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    register_connection(&state, user, connection, tx.clone()).await;
    let live = state.registry.live_sessions_for(user).await.len();
    info!(user = %user, connection = %connection, sessions = live, "session admitted");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => {
                    if let Err(e) = dispatch_command(&state, user, connection, command).await {
                        warn!(user = %user, error = %e, "command failed");
                        let _ = tx.send(ServerEvent::Error {
                            reason: e.client_reason(),
                        });
                    }
                }
                Err(e) => {
                    let _ = tx.send(ServerEvent::Error {
                        reason: format!("Malformed frame: {e}"),
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            // pings are answered by the protocol layer; binary is ignored
            Ok(_) => {}
            Err(e) => {
                warn!(user = %user, error = %e, "socket error");
                break;
            }
        }
    }

    unregister_connection(&state, connection).await;
    writer.abort();
    info!(user = %user, connection = %connection, "session closed");
}

/// Admit the session, mirror it durably, and broadcast the online
/// transition when this was the user's first live session.
pub(crate) async fn register_connection(
    state: &AppState,
    user: UserId,
    connection: ConnectionId,
    sender: EventSender,
) {
    let change = state.registry.admit(user, connection, sender).await;
    let now = Utc::now();

    {
        let db = state.db.lock().await;
        if let Err(e) = db.insert_session(&Session {
            connection_id: connection,
            user_id: user,
            connected_at: now,
        }) {
            warn!(connection = %connection, error = %e, "failed to mirror session");
        }
        if change == PresenceChange::CameOnline {
            if let Err(e) = db.set_presence(user, true, now) {
                warn!(user = %user, error = %e, "failed to persist presence");
            }
        }
    }

    if change == PresenceChange::CameOnline {
        state
            .registry
            .broadcast_to_others(
                user,
                ServerEvent::UserOnline(PresenceUpdate {
                    user_id: user,
                    last_seen: now,
                }),
            )
            .await;
    }
}

/// Dismiss the session and broadcast the offline transition when the last
/// session went away. Idempotent, like the registry dismissal under it.
pub(crate) async fn unregister_connection(state: &AppState, connection: ConnectionId) {
    let Some((user, change)) = state.registry.dismiss(connection).await else {
        return;
    };
    let now = Utc::now();

    {
        let db = state.db.lock().await;
        if let Err(e) = db.delete_session(connection) {
            warn!(connection = %connection, error = %e, "failed to clear session mirror");
        }
        if change == PresenceChange::WentOffline {
            if let Err(e) = db.set_presence(user, false, now) {
                warn!(user = %user, error = %e, "failed to persist presence");
            }
        }
    }

    if change == PresenceChange::WentOffline {
        state
            .registry
            .broadcast_to_others(
                user,
                ServerEvent::UserOffline(PresenceUpdate {
                    user_id: user,
                    last_seen: now,
                }),
            )
            .await;
    }
}

async fn dispatch_command(
    state: &AppState,
    user: UserId,
    connection: ConnectionId,
    command: ClientCommand,
) -> Result<(), ServerError> {
    match command {
        ClientCommand::SendDirectMessage {
            recipient,
            content,
            reply_to,
        } => {
            state
                .router
                .send_direct(user, recipient, content, Vec::new(), reply_to)
                .await?;
        }
        ClientCommand::SendDirectMessageWithMedia {
            recipient,
            content,
            media_ids,
            reply_to,
        } => {
            state
                .router
                .send_direct(user, recipient, content, media_ids, reply_to)
                .await?;
        }
        ClientCommand::SendGroupMessage { group_id, content } => {
            state
                .router
                .send_group(user, group_id, content, Vec::new())
                .await?;
        }
        ClientCommand::SendGroupMessageWithMedia {
            group_id,
            content,
            media_ids,
        } => {
            state
                .router
                .send_group(user, group_id, content, media_ids)
                .await?;
        }
        ClientCommand::MarkMessageRead { message_id } => {
            state.router.mark_read(user, message_id).await?;
        }
        ClientCommand::JoinGroupChannel { group_id } => {
            state
                .router
                .join_group_channel(user, connection, group_id)
                .await?;
        }
        ClientCommand::LeaveGroupChannel { group_id } => {
            state.router.leave_group_channel(connection, group_id).await?;
        }
        ClientCommand::Typing { recipient } => {
            state.router.typing(user, recipient, true).await?;
        }
        ClientCommand::StopTyping { recipient } => {
            state.router.typing(user, recipient, false).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::mpsc;

    use parley_store::{Database, User};

    use crate::config::Config;
    use crate::media_store::MediaStore;

    async fn test_state() -> (AppState, tempfile::TempDir, User, User) {
        let dir = tempfile::TempDir::new().unwrap();
        let database = Database::open_at(&dir.path().join("test.db")).unwrap();

        let alice = sample_user("alice");
        let bob = sample_user("bob");
        database.create_user(&alice).unwrap();
        database.create_user(&bob).unwrap();

        let media_store = MediaStore::new(dir.path().join("media"), 1024 * 1024)
            .await
            .unwrap();
        let state = AppState::new(database, media_store, Config::default());
        (state, dir, alice, bob)
    }

    fn sample_user(username: &str) -> User {
        User {
            id: parley_shared::UserId::new(),
            username: username.to_string(),
            full_name: None,
            bio: None,
            avatar_url: None,
            is_online: false,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_connect_lifecycle_updates_presence_and_mirror() {
        let (state, _dir, alice, bob) = test_state().await;

        // bob is online and will observe alice's transitions
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        register_connection(&state, bob.id, ConnectionId::new(), bob_tx).await;

        let first = ConnectionId::new();
        let second = ConnectionId::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        register_connection(&state, alice.id, first, tx1).await;
        register_connection(&state, alice.id, second, tx2).await;

        // exactly one online broadcast despite two admits
        let mut online_events = 0;
        while let Ok(event) = bob_rx.try_recv() {
            if matches!(event, ServerEvent::UserOnline(_)) {
                online_events += 1;
            }
        }
        assert_eq!(online_events, 1);

        {
            let db = state.db.lock().await;
            assert!(db.get_user(alice.id).unwrap().is_online);
            assert_eq!(db.sessions_for_user(alice.id).unwrap().len(), 2);
        }

        // dismissing one of two sessions: no offline broadcast
        unregister_connection(&state, first).await;
        assert!(bob_rx.try_recv().is_err());

        // dismissing the last one: exactly one offline broadcast
        unregister_connection(&state, second).await;
        let event = bob_rx.try_recv().unwrap();
        assert!(matches!(event, ServerEvent::UserOffline(update) if update.user_id == alice.id));

        {
            let db = state.db.lock().await;
            assert!(!db.get_user(alice.id).unwrap().is_online);
            assert!(db.sessions_for_user(alice.id).unwrap().is_empty());
        }

        // unregistering an unknown connection is a no-op
        unregister_connection(&state, ConnectionId::new()).await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_broadcast_never_reaches_subject() {
        let (state, _dir, alice, _bob) = test_state().await;

        let existing = ConnectionId::new();
        let (existing_tx, mut existing_rx) = mpsc::unbounded_channel();
        register_connection(&state, alice.id, existing, existing_tx).await;
        // drain the admit-time noise (there is none for the first session)
        assert!(existing_rx.try_recv().is_err());

        // a second session of the same user comes up elsewhere; the first
        // session must not hear an online broadcast about its own user
        let (tx, _rx) = mpsc::unbounded_channel();
        register_connection(&state, alice.id, ConnectionId::new(), tx).await;
        assert!(existing_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_routes_commands() {
        let (state, _dir, alice, bob) = test_state().await;
        let connection = ConnectionId::new();

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        register_connection(&state, bob.id, ConnectionId::new(), bob_tx).await;

        dispatch_command(
            &state,
            alice.id,
            connection,
            ClientCommand::SendDirectMessage {
                recipient: bob.id,
                content: "via dispatch".to_string(),
                reply_to: None,
            },
        )
        .await
        .unwrap();

        let event = bob_rx.try_recv().unwrap();
        assert!(matches!(
            event,
            ServerEvent::ReceiveDirectMessage(payload) if payload.content == "via dispatch"
        ));
    }
}
