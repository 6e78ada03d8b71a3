//! tunegrid-machine — what a tuning host has and whether it still works.
//!
//! - [`topology`]: parse the device enumeration report into property trees
//! - [`inventory`]: classify agents into CPU and GPU entries
//! - [`health`]: per-GPU probe bookkeeping with backoff
//! - [`clock`]: clock level parsing and set commands
//! - [`disk`]: root filesystem usage
//! - [`machine`]: the per-host handle tying these to a transport

pub mod clock;
pub mod disk;
pub mod error;
pub mod health;
pub mod inventory;
pub mod machine;
pub mod topology;

pub use clock::GpuClocks;
pub use error::{MachineError, MachineResult};
pub use health::{GpuHealth, GpuHealthTracker, ProbeResult};
pub use inventory::{CpuEntry, GpuEntry, Inventory};
pub use machine::{Machine, RestartVia};
pub use topology::{Property, PropertyTree, parse_agents};
