//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("state store error: {0}")]
    State(#[from] tunegrid_state::StateError),

    #[error("machine error: {0}")]
    Machine(#[from] tunegrid_machine::MachineError),

    /// The bound GPU failed its health probes; in-flight jobs were requeued.
    #[error("gpu {gpu_id} on machine {machine_id} failed health check")]
    DeviceHealth { machine_id: i64, gpu_id: u32 },

    #[error("session {0} not found")]
    SessionNotFound(i64),

    /// The machine does not match what the session was created for.
    #[error("environment mismatch: {0}")]
    Environment(String),
}
