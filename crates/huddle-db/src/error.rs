use thiserror::Error;
use uuid::Uuid;

/// Typed store failures. Callers always see one of these — never an
/// ambiguous empty success.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sender {user_id} is not a member of group {group_id}")]
    NotAMember { user_id: Uuid, group_id: Uuid },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unknown user {0}")]
    UnknownUser(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
