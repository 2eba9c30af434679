//! Group CRUD and membership management.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;

use parley_shared::{GroupId, GroupMemberPayload, GroupPayload, MessagePayload, UserId};
use parley_store::{Group, GroupOverview};

use crate::api::page_bounds;
use crate::auth::AuthedUser;
use crate::error::ServerError;
use crate::payload::hydrate_message;
use crate::state::AppState;

const MAX_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_groups).post(create_group))
        .route("/:group_id", get(get_group).delete(delete_group))
        .route("/:group_id/members", get(list_members).post(add_member))
        .route("/:group_id/members/:user_id", delete(remove_member))
        .route("/:group_id/messages", get(group_history))
}

fn overview_payload(overview: GroupOverview) -> GroupPayload {
    GroupPayload {
        id: overview.group.id,
        name: overview.group.name,
        description: overview.group.description,
        created_by: overview.group.created_by,
        created_by_name: overview.created_by_name,
        created_at: overview.group.created_at,
        member_count: overview.member_count,
    }
}

async fn list_groups(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<GroupPayload>>, ServerError> {
    let db = state.db.lock().await;
    let overviews = db.list_groups_for(caller)?;
    Ok(Json(overviews.into_iter().map(overview_payload).collect()))
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    description: Option<String>,
    #[serde(default)]
    member_ids: Vec<UserId>,
}

async fn create_group(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupPayload>), ServerError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ServerError::Validation(
            "Group name cannot be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ServerError::Validation(format!(
            "Group name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(description) = &request.description {
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ServerError::Validation(format!(
                "Description exceeds {MAX_DESCRIPTION_LEN} characters"
            )));
        }
    }

    let group = Group {
        id: GroupId::new(),
        name: name.to_string(),
        description: request.description,
        created_by: caller,
        created_at: Utc::now(),
    };

    let db = state.db.lock().await;
    db.create_group(&group, &request.member_ids)?;

    tracing::info!(group = %group.id, name = %group.name, creator = %caller, "group created");

    let overview = db.group_overview(group.id)?;
    Ok((StatusCode::CREATED, Json(overview_payload(overview))))
}

async fn get_group(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> Result<Json<GroupPayload>, ServerError> {
    let db = state.db.lock().await;
    if !db.is_group_member(group_id, caller)? {
        return Err(ServerError::NotAMember);
    }
    let overview = db.group_overview(group_id)?;
    Ok(Json(overview_payload(overview)))
}

async fn list_members(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> Result<Json<Vec<GroupMemberPayload>>, ServerError> {
    let db = state.db.lock().await;
    if !db.is_group_member(group_id, caller)? {
        return Err(ServerError::NotAMember);
    }

    let members = db
        .list_group_members(group_id)?
        .into_iter()
        .map(|member| GroupMemberPayload {
            user_id: member.user_id,
            username: member.username,
            full_name: member.full_name,
            is_admin: member.is_admin,
            is_online: member.is_online,
            joined_at: member.joined_at,
        })
        .collect();
    Ok(Json(members))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

/// Member-gated history, paginated newest-first and reversed per page like
/// the conversation endpoint.
async fn group_history(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    Query(page_query): Query<PageQuery>,
) -> Result<Json<Vec<MessagePayload>>, ServerError> {
    let (_, page_size, offset) = page_bounds(page_query.page, page_query.page_size);

    let db = state.db.lock().await;
    if !db.is_group_member(group_id, caller)? {
        return Err(ServerError::NotAMember);
    }

    let mut messages = db.group_messages(group_id, page_size, offset)?;
    messages.reverse();

    let mut payloads = Vec::with_capacity(messages.len());
    for message in &messages {
        payloads.push(hydrate_message(&db, message)?);
    }
    Ok(Json(payloads))
}

#[derive(Deserialize)]
struct AddMemberRequest {
    user_id: UserId,
}

async fn add_member(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    Json(request): Json<AddMemberRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let db = state.db.lock().await;
    if !db.is_group_admin(group_id, caller)? {
        return Err(ServerError::NotAMember);
    }

    // the new member must exist in the directory
    db.get_user(request.user_id)
        .map_err(|_| ServerError::NotFound("User"))?;

    if !db.add_group_member(group_id, request.user_id, false)? {
        return Err(ServerError::Validation(
            "User is already a member".to_string(),
        ));
    }
    Ok(Json(serde_json::json!({ "added": true })))
}

/// Admins may remove anyone; everyone may remove themselves. Removing the
/// last admin promotes the earliest-joined remaining member.
async fn remove_member(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path((group_id, user_id)): Path<(GroupId, UserId)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let db = state.db.lock().await;
    if caller != user_id && !db.is_group_admin(group_id, caller)? {
        return Err(ServerError::NotAMember);
    }

    if !db.remove_group_member(group_id, user_id)? {
        return Err(ServerError::NotFound("Membership"));
    }
    Ok(Json(serde_json::json!({ "removed": true })))
}

/// Only the creator may delete a group; members and messages cascade.
async fn delete_group(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let db = state.db.lock().await;
    let group = db.get_group(group_id).map_err(|e| match e {
        parley_store::StoreError::NotFound => ServerError::NotFound("Group"),
        other => other.into(),
    })?;

    if group.created_by != caller {
        return Err(ServerError::NotAMember);
    }

    db.delete_group(group_id)?;
    tracing::info!(group = %group_id, "group deleted");
    Ok(Json(serde_json::json!({ "deleted": true })))
}
