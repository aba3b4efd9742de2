use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use huddle_db::{Database, StoreError, StoreResult};
use huddle_types::api::{AddMemberRequest, CreateGroupRequest, SendGroupMessageRequest};
use huddle_types::models::{Group, GroupMessage, Identity};

use crate::{AppState, error::ApiError, store};

/// Reading a group's messages or roster requires durable membership, same
/// as writing to it.
fn require_member(db: &Database, user_id: Uuid, group_id: Uuid) -> StoreResult<()> {
    if db.is_group_member(user_id, group_id)? {
        Ok(())
    } else {
        Err(StoreError::NotAMember { user_id, group_id })
    }
}

pub async fn list_groups(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
) -> Result<Json<Vec<Group>>, ApiError> {
    let user_id = who.id;
    Ok(Json(
        store(&state, move |db| db.list_groups_for_user(user_id)).await?,
    ))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let creator_id = who.id;
    let group = store(&state, move |db| {
        db.create_group(creator_id, &req.name, &req.member_ids, chrono::Utc::now())
    })
    .await?;

    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn group_messages(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<Vec<GroupMessage>>, ApiError> {
    let user_id = who.id;
    let messages = store(&state, move |db| {
        require_member(db, user_id, group_id)?;
        db.list_group_messages(group_id)
    })
    .await?;

    Ok(Json(messages))
}

/// Durable group send. Membership check and insert are one transaction in
/// the store; a non-member gets 403 and no row appears.
pub async fn send_group_message(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<SendGroupMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender_id = who.id;
    let message = store(&state, move |db| {
        db.create_group_message(sender_id, group_id, &req.content, chrono::Utc::now())
    })
    .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn group_members(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<Vec<Identity>>, ApiError> {
    let user_id = who.id;
    let members = store(&state, move |db| {
        require_member(db, user_id, group_id)?;
        db.list_group_members(group_id)
    })
    .await?;

    Ok(Json(members))
}

pub async fn add_member(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> Result<StatusCode, ApiError> {
    let user_id = who.id;
    store(&state, move |db| {
        require_member(db, user_id, group_id)?;
        db.add_group_member(group_id, req.user_id)
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Members may remove anyone, including themselves (leaving the group).
pub async fn remove_member(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path((group_id, member_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let user_id = who.id;
    store(&state, move |db| {
        require_member(db, user_id, group_id)?;
        db.remove_group_member(group_id, member_id)
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}
