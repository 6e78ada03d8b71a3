//! Transport error types.

use thiserror::Error;
use tune_core::AbortReason;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// A binary the command needs is not installed. Never retried.
    #[error("machine {machine_id}: missing binary `{binary}` in command: {command}")]
    Precondition {
        machine_id: i64,
        binary: String,
        command: String,
    },

    /// Connection or command retries were exhausted.
    #[error("machine {machine_id}: {message}")]
    Connectivity { machine_id: i64, message: String },

    /// An abort sentinel fired. Callers treat this as "try later".
    #[error("aborted: {0}")]
    Aborted(AbortReason),
}

impl TransportError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TransportError::Aborted(_))
    }
}
