//! GPU health bookkeeping.
//!
//! A worker probes its GPU on a schedule. Failures back the schedule off
//! exponentially; one success restores the base interval.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Result of a single GPU probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The device answered with the expected architecture.
    Healthy,
    /// The device answered with something else, or nothing.
    Unhealthy,
    /// The probe could not run (transport failure).
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Tracks consecutive probe results for the GPU a worker is bound to.
#[derive(Debug)]
pub struct GpuHealthTracker {
    gpu_id: u32,
    status: GpuHealth,
    consecutive_failures: u32,
    /// Failures before the device is declared unhealthy.
    unhealthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
    last_probe: Option<Instant>,
}

impl GpuHealthTracker {
    pub fn new(gpu_id: u32, interval: Duration, unhealthy_threshold: u32) -> Self {
        Self {
            gpu_id,
            status: GpuHealth::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: interval * 8,
            last_probe: None,
        }
    }

    /// Record a probe result and return the new status.
    pub fn record(&mut self, result: ProbeResult) -> GpuHealth {
        self.last_probe = Some(Instant::now());
        match result {
            ProbeResult::Healthy => {
                if self.status == GpuHealth::Unhealthy {
                    debug!(gpu_id = self.gpu_id, "gpu recovered");
                }
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                self.status = GpuHealth::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.status != GpuHealth::Unhealthy
                {
                    warn!(
                        gpu_id = self.gpu_id,
                        failures = self.consecutive_failures,
                        "gpu marked unhealthy"
                    );
                    self.status = GpuHealth::Unhealthy;
                }
            }
        }
        self.status
    }

    /// Whether the next periodic probe is due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_probe {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.current_backoff,
        }
    }

    pub fn status(&self) -> GpuHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}
