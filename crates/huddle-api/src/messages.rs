use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use huddle_conversations::{Conversation, build_conversations, thread};
use huddle_types::api::{SendMessageRequest, UnreadCountResponse};
use huddle_types::models::{DirectMessage, Identity};

use crate::{AppState, error::ApiError, store};

/// `POST /messages` — the durable write. The live fan-out is a separate
/// gateway emit performed by the client after this call succeeds; the two
/// paths are deliberately decoupled and this handler never touches the
/// gateway.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender_id = who.id;
    let message = store(&state, move |db| {
        db.create_direct_message(sender_id, req.receiver_id, &req.content, chrono::Utc::now())
    })
    .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn inbox(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
) -> Result<Json<Vec<DirectMessage>>, ApiError> {
    let user_id = who.id;
    Ok(Json(store(&state, move |db| db.list_inbox(user_id)).await?))
}

pub async fn sent(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
) -> Result<Json<Vec<DirectMessage>>, ApiError> {
    let user_id = who.id;
    Ok(Json(store(&state, move |db| db.list_sent(user_id)).await?))
}

/// `GET /messages/conversations` — the pull path. Recomputed from the flat
/// message rows on every call; works with or without a live gateway
/// connection.
pub async fn conversations(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let user_id = who.id;
    let messages = store(&state, move |db| {
        let mut all = db.list_inbox(user_id)?;
        all.extend(db.list_sent(user_id)?);
        Ok(all)
    })
    .await?;

    Ok(Json(build_conversations(who.id, &messages)))
}

pub async fn conversation_with(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(partner_id): Path<Uuid>,
) -> Result<Json<Vec<DirectMessage>>, ApiError> {
    let user_id = who.id;
    let messages = store(&state, move |db| {
        let mut all = db.list_inbox(user_id)?;
        all.extend(db.list_sent(user_id)?);
        Ok(all)
    })
    .await?;

    Ok(Json(thread(who.id, partner_id, &messages)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let reader_id = who.id;
    store(&state, move |db| db.mark_read(message_id, reader_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let requester_id = who.id;
    store(&state, move |db| db.delete_message(message_id, requester_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let user_id = who.id;
    let count = store(&state, move |db| db.unread_count(user_id)).await?;
    Ok(Json(UnreadCountResponse { count }))
}
