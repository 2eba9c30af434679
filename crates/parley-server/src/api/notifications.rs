//! Notification listing and read-state management. Everything is scoped
//! to the authenticated owner; nothing here can touch or reveal another
//! user's notifications.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use parley_shared::{NotificationId, NotificationPayload};
use parley_store::Database;

use crate::api::page_bounds;
use crate::auth::AuthedUser;
use crate::error::ServerError;
use crate::payload::notification_payload;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/unread-count", get(unread_count))
        .route("/:notification_id/read", post(mark_read))
        .route("/read-all", post(mark_all_read))
        .route("/:notification_id", delete(delete_notification))
}

#[derive(Deserialize)]
struct ListQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    #[serde(default)]
    unread_only: bool,
}

#[derive(Serialize)]
struct ListResponse {
    notifications: Vec<NotificationPayload>,
    total_count: i64,
    unread_count: i64,
    page: u32,
    page_size: u32,
    total_pages: i64,
}

fn hydrate(db: &Database, notification: parley_store::Notification) -> NotificationPayload {
    let from_user_name = notification
        .from_user_id
        .and_then(|from| db.display_name(from).ok());
    notification_payload(notification, from_user_name)
}

async fn list_notifications(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ServerError> {
    let (page, page_size, offset) = page_bounds(query.page, query.page_size);

    let db = state.db.lock().await;
    let notifications = db.list_notifications(caller, page_size, offset, query.unread_only)?;
    let total_count = db.count_notifications(caller, query.unread_only)?;
    let unread_count = db.count_notifications(caller, true)?;

    let payloads = notifications
        .into_iter()
        .map(|notification| hydrate(&db, notification))
        .collect();

    let total_pages = (total_count + i64::from(page_size) - 1) / i64::from(page_size);
    Ok(Json(ListResponse {
        notifications: payloads,
        total_count,
        unread_count,
        page,
        page_size,
        total_pages,
    }))
}

async fn unread_count(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let db = state.db.lock().await;
    let count = db.count_notifications(caller, true)?;
    Ok(Json(serde_json::json!({ "unread_count": count })))
}

async fn mark_read(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(notification_id): Path<NotificationId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let db = state.db.lock().await;
    // someone else's notification and a missing one answer identically
    if !db.notification_exists(notification_id, caller)? {
        return Err(ServerError::NotFound("Notification"));
    }
    // already-read is an idempotent no-op
    db.mark_notification_read(notification_id, caller, Utc::now())?;
    Ok(Json(serde_json::json!({ "marked": true })))
}

async fn mark_all_read(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let db = state.db.lock().await;
    let count = db.mark_all_notifications_read(caller, Utc::now())?;
    Ok(Json(serde_json::json!({ "marked": count })))
}

async fn delete_notification(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(notification_id): Path<NotificationId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let db = state.db.lock().await;
    if !db.delete_notification(notification_id, caller)? {
        return Err(ServerError::NotFound("Notification"));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}
