//! Error types for the job store.

use thiserror::Error;

/// Result type alias for job store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during job store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    /// Lock contention with another writer; safe to retry.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StateError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Busy(_))
    }
}

impl From<rusqlite::Error> for StateError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                StateError::Busy(e.to_string())
            }
            _ => StateError::Query(e.to_string()),
        }
    }
}
