//! Directory lookups: user listing and substring search.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use parley_shared::{UserId, UserPayload};
use parley_store::StoreError;

use crate::auth::AuthedUser;
use crate::error::ServerError;
use crate::payload::user_payload;
use crate::state::AppState;

const SEARCH_LIMIT: u32 = 20;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_users))
        .route("/search", get(search_users))
        .route("/:user_id", get(get_user))
}

async fn list_users(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<UserPayload>>, ServerError> {
    let db = state.db.lock().await;
    let users = db.list_users_except(caller)?;
    Ok(Json(users.into_iter().map(user_payload).collect()))
}

async fn get_user(
    AuthedUser(_caller): AuthedUser,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<UserPayload>, ServerError> {
    let db = state.db.lock().await;
    let user = db.get_user(user_id).map_err(|e| match e {
        StoreError::NotFound => ServerError::NotFound("User"),
        other => other.into(),
    })?;
    Ok(Json(user_payload(user)))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

async fn search_users(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserPayload>>, ServerError> {
    if query.q.trim().is_empty() {
        return Err(ServerError::Validation(
            "Search query cannot be empty".to_string(),
        ));
    }

    let db = state.db.lock().await;
    let users = db.search_users(caller, query.q.trim(), SEARCH_LIMIT)?;
    Ok(Json(users.into_iter().map(user_payload).collect()))
}
