//! When a worker stops taking work.
//!
//! Before each claim the worker reads its machine's disk usage and the time
//! since the last restart, and asks a [`PausePolicy`] what to do.

use std::time::Duration;

use tracing::warn;

/// Why the worker is asking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PauseReason {
    /// Disk usage could not be read.
    DiskUnreadable,
    /// Disk usage (percent) is above the limit.
    DiskFull(f64),
    /// The periodic restart interval has passed.
    ResetDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseAction {
    Proceed,
    Wait(Duration),
    /// Restart the machine, then resume.
    Restart,
}

pub trait PausePolicy: Send + Sync {
    fn decide(&self, reason: PauseReason) -> PauseAction;
}

/// Restart when the disk can't be read or a reset is due; wait out a full disk.
#[derive(Debug, Clone)]
pub struct DiskGuard {
    pub wait: Duration,
}

impl DiskGuard {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }
}

impl PausePolicy for DiskGuard {
    fn decide(&self, reason: PauseReason) -> PauseAction {
        match reason {
            PauseReason::DiskUnreadable => {
                warn!("disk usage unreadable, restarting machine");
                PauseAction::Restart
            }
            PauseReason::DiskFull(used) => {
                warn!(used, "used space overflow detected");
                PauseAction::Wait(self.wait)
            }
            PauseReason::ResetDue => PauseAction::Restart,
        }
    }
}

/// Never pause. For local development hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverPause;

impl PausePolicy for NeverPause {
    fn decide(&self, _reason: PauseReason) -> PauseAction {
        PauseAction::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_guard_decisions() {
        let guard = DiskGuard::new(Duration::from_secs(30));
        assert_eq!(guard.decide(PauseReason::DiskUnreadable), PauseAction::Restart);
        assert_eq!(
            guard.decide(PauseReason::DiskFull(95.0)),
            PauseAction::Wait(Duration::from_secs(30))
        );
        assert_eq!(guard.decide(PauseReason::ResetDue), PauseAction::Restart);
    }

    #[test]
    fn never_pause_proceeds() {
        assert_eq!(NeverPause.decide(PauseReason::DiskUnreadable), PauseAction::Proceed);
    }
}
