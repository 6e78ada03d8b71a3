//! tunegrid-worker — the per-GPU claim/execute/finalize loop.
//!
//! One worker process serves one `(machine, gpu)` pair. Each iteration:
//!
//! ```text
//! abort sentinel?        -> stop, nothing written
//! pause policy?          -> wait or restart the machine
//! periodic health probe  -> requeue in-flight jobs if the GPU is gone
//! claim(fetch -> start)  -> 0 rows: idle
//! for each claimed job:
//!     start -> running -> run tool -> success | *_error | errored
//! ```
//!
//! What a pipeline step runs is a [`TuningStep`]; when to stop and restart
//! a machine is a [`PausePolicy`].

pub mod error;
pub mod pause;
pub mod step;
pub mod worker;

pub use error::{WorkerError, WorkerResult};
pub use pause::{DiskGuard, NeverPause, PauseAction, PausePolicy, PauseReason};
pub use step::{FinCompile, FinEvaluate, TuningStep, render_command};
pub use worker::{IterationOutcome, RunExit, Worker, WorkerSettings};
