//! Machine error types.

use thiserror::Error;
use tunegrid_remote::TransportError;

pub type MachineResult<T> = Result<T, MachineError>;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected tool output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<regex::Error> for MachineError {
    fn from(e: regex::Error) -> Self {
        MachineError::Parse(e.to_string())
    }
}
