//! tunegrid-state — the shared job store for a tuning fleet.
//!
//! Backed by SQLite through [rusqlite](https://docs.rs/rusqlite). Every
//! worker process opens its own handle on the same database file; the only
//! cross-process coordination is the claim statement itself.
//!
//! # Claim protocol
//!
//! ```text
//! claim(source, target, n, selector)
//!   BEGIN IMMEDIATE
//!   UPDATE job SET state=target, machine_id=me, gpu_id=me
//!    WHERE id IN (SELECT id FROM job
//!                  WHERE state=source AND <selector>
//!                  ORDER BY id LIMIT n)
//!   COMMIT
//! claimed_jobs(target, me) -> rows tagged with (machine_id, gpu_id)
//! ```
//!
//! The `(machine_id, gpu_id)` pair is a worker's ownership tag; it is
//! stored in the row, never in a side table.

pub mod claim;
pub mod error;
pub mod schema;
pub mod store;
pub mod types;

pub use claim::{ClaimMode, ClaimSelector, WorkerTag};
pub use error::{StateError, StateResult};
pub use store::JobStore;
pub use types::*;
