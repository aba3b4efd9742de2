pub mod error;
pub mod groups;
pub mod identity;
pub mod messages;
pub mod middleware;

use std::sync::Arc;

use tracing::error;

use huddle_db::{Database, StoreResult};

use crate::error::ApiError;
use crate::identity::IdentityResolver;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub resolver: Arc<dyn IdentityResolver>,
}

/// Run a store operation on the blocking pool and map failures into the
/// API error taxonomy.
pub(crate) async fn store<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {e}");
            ApiError::Internal
        })?
        .map_err(ApiError::from)
}
