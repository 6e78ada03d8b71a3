//! tune-core — shared building blocks for the tunegrid fleet tuner.
//!
//! - [`config`]: the `tune.toml` configuration tree
//! - [`abort`]: cooperative, filesystem-sentinel cancellation
//! - [`backoff`]: jittered sleep intervals for retry loops
//! - [`duration`]: "5s" / "500ms" / "2m" duration strings

pub mod abort;
pub mod backoff;
pub mod config;
pub mod duration;

pub use abort::{AbortCheck, AbortReason, AbortSwitch, NeverAbort, SentinelFiles};
pub use config::TuneConfig;
pub use duration::parse_duration;
