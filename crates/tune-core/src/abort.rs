//! Cooperative abort protocol.
//!
//! Two sentinel files stop a fleet without a central controller:
//!
//! ```text
//! <dir>/<prefix>_<arch>            fleet-wide, per architecture
//! <dir>/<prefix>_mid_<machine_id>  one machine
//! ```
//!
//! Only existence matters. Nothing in tunegrid deletes a sentinel; removing
//! it is the operator's "resume". Every blocking loop (connect retries,
//! command retries, job claims) polls an [`AbortCheck`] before each attempt
//! and gives up quietly when it fires.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// Which sentinel fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The per-architecture sentinel exists.
    Arch(String),
    /// The per-machine sentinel exists.
    Machine(i64),
    /// Raised programmatically (tests, in-process shutdown).
    Requested,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Arch(arch) => write!(f, "arch {arch} sentinel"),
            AbortReason::Machine(id) => write!(f, "machine {id} sentinel"),
            AbortReason::Requested => write!(f, "abort requested"),
        }
    }
}

/// Level-triggered cancellation probe.
///
/// Implementations must be cheap; they are polled once per retry iteration.
pub trait AbortCheck: Send + Sync {
    /// Returns the reason if work should stop now.
    fn check(&self) -> Option<AbortReason>;

    fn is_aborted(&self) -> bool {
        self.check().is_some()
    }
}

/// The filesystem sentinels for one machine (and optionally its arch).
#[derive(Debug, Clone)]
pub struct SentinelFiles {
    dir: PathBuf,
    prefix: String,
    machine_id: i64,
    arch: Option<String>,
}

impl SentinelFiles {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, machine_id: i64) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            machine_id,
            arch: None,
        }
    }

    /// Also honor the fleet-wide sentinel for `arch`.
    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    /// Path of the per-architecture sentinel, if an arch is bound.
    pub fn arch_path(&self) -> Option<PathBuf> {
        self.arch.as_deref().map(|a| arch_sentinel(&self.dir, &self.prefix, a))
    }

    /// Path of the per-machine sentinel.
    pub fn machine_path(&self) -> PathBuf {
        machine_sentinel(&self.dir, &self.prefix, self.machine_id)
    }
}

impl AbortCheck for SentinelFiles {
    fn check(&self) -> Option<AbortReason> {
        let mut fired = None;
        if let (Some(arch), Some(path)) = (self.arch.as_deref(), self.arch_path()) {
            if path.exists() {
                warn!(path = %path.display(), %arch, "abort sentinel found");
                fired = Some(AbortReason::Arch(arch.to_string()));
            }
        }
        let path = self.machine_path();
        if path.exists() {
            warn!(path = %path.display(), machine_id = self.machine_id, "abort sentinel found");
            fired.get_or_insert(AbortReason::Machine(self.machine_id));
        }
        fired
    }
}

/// Build the fleet-wide sentinel path for `arch`.
pub fn arch_sentinel(dir: &Path, prefix: &str, arch: &str) -> PathBuf {
    dir.join(format!("{prefix}_{arch}"))
}

/// Build the per-machine sentinel path.
pub fn machine_sentinel(dir: &Path, prefix: &str, machine_id: i64) -> PathBuf {
    dir.join(format!("{prefix}_mid_{machine_id}"))
}

/// An [`AbortCheck`] that never fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAbort;

impl AbortCheck for NeverAbort {
    fn check(&self) -> Option<AbortReason> {
        None
    }
}

/// In-memory abort switch, for tests and in-process shutdown.
#[derive(Debug, Default)]
pub struct AbortSwitch {
    raised: AtomicBool,
}

impl AbortSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}

impl AbortCheck for AbortSwitch {
    fn check(&self) -> Option<AbortReason> {
        self.raised
            .load(Ordering::SeqCst)
            .then_some(AbortReason::Requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_sentinels_no_abort() {
        let dir = tempfile::tempdir().unwrap();
        let files = SentinelFiles::new(dir.path(), "miopen_abort", 7).with_arch("gfx90a");
        assert_eq!(files.check(), None);
    }

    #[test]
    fn machine_sentinel_fires() {
        let dir = tempfile::tempdir().unwrap();
        let files = SentinelFiles::new(dir.path(), "miopen_abort", 7);
        std::fs::write(dir.path().join("miopen_abort_mid_7"), b"").unwrap();
        assert_eq!(files.check(), Some(AbortReason::Machine(7)));
    }

    #[test]
    fn other_machine_sentinel_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let files = SentinelFiles::new(dir.path(), "miopen_abort", 7);
        std::fs::write(dir.path().join("miopen_abort_mid_8"), b"").unwrap();
        assert!(!files.is_aborted());
    }

    #[test]
    fn arch_sentinel_fires_only_when_bound() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("miopen_abort_gfx90a"), b"").unwrap();

        let unbound = SentinelFiles::new(dir.path(), "miopen_abort", 1);
        assert!(!unbound.is_aborted());

        let bound = unbound.with_arch("gfx90a");
        assert_eq!(bound.check(), Some(AbortReason::Arch("gfx90a".into())));
    }

    #[test]
    fn removing_sentinel_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let files = SentinelFiles::new(dir.path(), "p", 3);
        std::fs::write(files.machine_path(), b"").unwrap();
        assert!(files.is_aborted());
        std::fs::remove_file(files.machine_path()).unwrap();
        assert!(!files.is_aborted());
    }

    #[test]
    fn switch_toggles() {
        let switch = AbortSwitch::new();
        assert!(!switch.is_aborted());
        switch.raise();
        assert_eq!(switch.check(), Some(AbortReason::Requested));
        switch.clear();
        assert!(!switch.is_aborted());
    }
}
