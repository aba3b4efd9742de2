use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use huddle_db::StoreError;

/// HTTP-facing error taxonomy. Store failures map onto it; nothing is
/// surfaced as ambiguous empty success.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("not a member of this group")]
    NotAMember,

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("internal error")]
    Internal,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotAMember { .. } => ApiError::NotAMember,
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::UnknownUser(id) => ApiError::Validation(format!("unknown user {id}")),
            StoreError::InvalidInput(msg) => ApiError::Validation(msg),
            StoreError::Corrupt(_) | StoreError::LockPoisoned | StoreError::Sqlite(_) => {
                error!("store failure: {err}");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotAMember => StatusCode::FORBIDDEN,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
