//! Conversation listing, message history, read receipts over REST,
//! scoped search, and soft deletion.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{
    ConversationId, ConversationSummary, GroupId, MessageId, MessagePayload, UserId,
};
use parley_store::{MessageSearch, StoreError};

use crate::api::page_bounds;
use crate::auth::AuthedUser;
use crate::error::ServerError;
use crate::payload::hydrate_message;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route(
            "/conversations/:other_user/messages",
            get(conversation_history),
        )
        .route("/messages/:message_id/read", post(mark_read))
        .route("/messages/read-bulk", post(mark_read_bulk))
        .route("/messages/search", get(search_messages))
        .route("/messages/:message_id", delete(delete_message))
}

async fn list_conversations(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    let db = state.db.lock().await;
    Ok(Json(db.list_conversations_for(caller)?))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

/// History with the other participant. Paginated newest-first server-side;
/// each page is reversed before return so the body reads oldest-first. A
/// missing conversation is an empty history, not an error.
async fn conversation_history(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(other_user): Path<UserId>,
    Query(page_query): Query<PageQuery>,
) -> Result<Json<Vec<MessagePayload>>, ServerError> {
    let (_, page_size, offset) = page_bounds(page_query.page, page_query.page_size);

    let db = state.db.lock().await;
    let Some(conversation) = db.find_conversation_between(caller, other_user)? else {
        return Ok(Json(Vec::new()));
    };

    let mut messages = db.conversation_messages(conversation.id, page_size, offset)?;
    messages.reverse();

    let mut payloads = Vec::with_capacity(messages.len());
    for message in &messages {
        payloads.push(hydrate_message(&db, message)?);
    }
    Ok(Json(payloads))
}

/// REST twin of the real-time mark-read. Unlike the silent WS path, a
/// non-participant gets a 403 here and a missing message a 404.
async fn mark_read(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    {
        let db = state.db.lock().await;
        let message = db.get_message(message_id).map_err(|e| match e {
            StoreError::NotFound => ServerError::NotFound("Message"),
            other => other.into(),
        })?;

        if let Some(conversation_id) = message.target.conversation_id() {
            let conversation = db.get_conversation(conversation_id)?;
            if !conversation.has_participant(caller) {
                return Err(ServerError::NotParticipant);
            }
        }
    }

    // the router applies the idempotence rules and pushes the receipt
    state.router.mark_read(caller, message_id).await?;
    Ok(Json(serde_json::json!({ "marked": true })))
}

#[derive(Deserialize)]
struct BulkReadRequest {
    message_ids: Vec<MessageId>,
}

/// Bulk variant: per-id rules are identical to the WS path; ids that do
/// not qualify are skipped silently.
async fn mark_read_bulk(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Json(request): Json<BulkReadRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let count = request.message_ids.len();
    for message_id in request.message_ids {
        state.router.mark_read(caller, message_id).await?;
    }
    Ok(Json(serde_json::json!({ "processed": count })))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
    conversation_id: Option<ConversationId>,
    group_id: Option<GroupId>,
    sender_id: Option<UserId>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Serialize)]
struct SearchResponse {
    messages: Vec<MessagePayload>,
    total_count: i64,
    page: u32,
    page_size: u32,
    total_pages: i64,
}

async fn search_messages(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ServerError> {
    let (page, page_size, offset) = page_bounds(query.page, query.page_size);

    let search = MessageSearch {
        term: query.q.filter(|q| !q.trim().is_empty()),
        conversation_id: query.conversation_id,
        group_id: query.group_id,
        sender_id: query.sender_id,
        from: query.from,
        to: query.to,
    };

    let db = state.db.lock().await;
    let (messages, total_count) = db.search_messages(caller, &search, page_size, offset)?;

    let mut payloads = Vec::with_capacity(messages.len());
    for message in &messages {
        payloads.push(hydrate_message(&db, message)?);
    }

    let total_pages = (total_count + i64::from(page_size) - 1) / i64::from(page_size);
    Ok(Json(SearchResponse {
        messages: payloads,
        total_count,
        page,
        page_size,
        total_pages,
    }))
}

/// Soft delete, sender only. The row survives; hydration blanks the
/// content from then on.
async fn delete_message(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let db = state.db.lock().await;
    let message = db.get_message(message_id).map_err(|e| match e {
        StoreError::NotFound => ServerError::NotFound("Message"),
        other => other.into(),
    })?;

    if message.sender_id != caller {
        return Err(ServerError::NotParticipant);
    }

    db.soft_delete_message(message_id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
