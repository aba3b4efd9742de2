use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{AppState, error::ApiError, store};

/// Resolve the bearer token into a normalized `Identity` and stash it in
/// request extensions. The identity is also mirrored into the store so
/// message foreign keys and receiver lookups can see this user.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized)?;

    let identity = state.resolver.resolve(token).map_err(|_| {
        warn!("rejected request with unresolvable token");
        ApiError::Unauthorized
    })?;

    let mirrored = identity.clone();
    store(&state, move |db| db.upsert_user(&mirrored)).await?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
