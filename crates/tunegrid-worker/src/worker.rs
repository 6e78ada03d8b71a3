//! The claim → execute → finalize loop for one `(machine, gpu)` pair.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tune_core::backoff::jitter_between;
use tune_core::{AbortCheck, AbortReason, TuneConfig};
use tunegrid_machine::{GpuHealth, GpuHealthTracker, Machine, MachineError};
use tunegrid_remote::{CommandOutput, TransportError};
use tunegrid_state::{
    ClaimMode, ClaimSelector, Job, JobState, JobStore, JobUpdate, StateResult, WorkerTag,
};

use crate::error::{WorkerError, WorkerResult};
use crate::pause::{DiskGuard, PauseAction, PausePolicy, PauseReason};
use crate::step::TuningStep;

/// Tool output that marks a transient failure of the tool's own local database.
const DISK_IO_ERROR: &str = "disk I/O error";

/// Everything a worker needs to know besides its collaborators.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub gpu_id: u32,
    pub session: i64,
    pub claim_num: u32,
    pub selector: ClaimSelector,
    /// A failing job moves to `errored` once its retries reach this.
    pub max_job_retries: u32,
    pub store_retries: u32,
    pub health_interval: Duration,
    pub health_attempts: u32,
    pub idle_backoff: Duration,
    pub disk_limit_percent: f64,
    pub reset_interval: Option<Duration>,
    /// Idle limit between tool output lines; `None` uses the transport default.
    pub command_timeout: Option<Duration>,
    pub exit_when_drained: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &TuneConfig, gpu_id: u32) -> Self {
        let worker = &config.worker;
        let mut selector =
            ClaimSelector::new(worker.session).with_max_retries(worker.max_job_retries);
        if let Some(label) = &worker.label {
            selector = selector.with_reason(label.clone());
        }
        if let Some(step) = &worker.fin_step {
            selector = selector.with_fin_step(step.clone());
        }
        Self {
            gpu_id,
            session: worker.session,
            claim_num: worker.claim_num,
            selector,
            max_job_retries: worker.max_job_retries,
            store_retries: worker.store_retries,
            health_interval: worker.health_interval(),
            health_attempts: worker.health_attempts.max(1),
            idle_backoff: worker.idle_backoff(),
            disk_limit_percent: worker.disk_limit_percent,
            reset_interval: worker.reset_interval(),
            command_timeout: None,
            exit_when_drained: worker.exit_when_drained,
        }
    }
}

/// What one [`Worker::run_once`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// An abort sentinel fired. Nothing was claimed.
    Aborted(AbortReason),
    /// The claim came back empty.
    Idle,
    /// Jobs carried to a final state this iteration.
    Processed(usize),
    /// The pause policy stopped work; resume after the given delay.
    Paused(Duration),
}

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, PartialEq)]
pub enum RunExit {
    Shutdown,
    Aborted(AbortReason),
    /// The queue was empty and `exit_when_drained` is set.
    Drained,
}

enum JobOutcome {
    Done,
    /// Another worker or a requeue took the row.
    Lost,
    Aborted(AbortReason),
}

pub struct Worker {
    store: JobStore,
    machine: Arc<Machine>,
    step: Arc<dyn TuningStep>,
    pause: Arc<dyn PausePolicy>,
    settings: WorkerSettings,
    tag: WorkerTag,
    abort: Arc<dyn AbortCheck>,
    health: GpuHealthTracker,
    last_reset: Instant,
}

impl Worker {
    pub fn new(
        store: JobStore,
        machine: Arc<Machine>,
        step: Arc<dyn TuningStep>,
        settings: WorkerSettings,
        abort: Arc<dyn AbortCheck>,
    ) -> Self {
        let tag = WorkerTag::new(machine.id(), i64::from(settings.gpu_id));
        let health = GpuHealthTracker::new(
            settings.gpu_id,
            settings.health_interval,
            settings.health_attempts,
        );
        let pause: Arc<dyn PausePolicy> = Arc::new(DiskGuard::new(settings.idle_backoff));
        Self {
            store,
            machine,
            step,
            pause,
            settings,
            tag,
            abort,
            health,
            last_reset: Instant::now(),
        }
    }

    pub fn with_pause_policy(mut self, policy: impl PausePolicy + 'static) -> Self {
        self.pause = Arc::new(policy);
        self
    }

    pub fn tag(&self) -> WorkerTag {
        self.tag
    }

    /// Verify the machine matches the session and apply clock targets.
    /// A no-op for steps that don't pin a GPU.
    pub async fn prepare(&mut self) -> WorkerResult<()> {
        if !self.step.checks_environment() {
            return Ok(());
        }
        let session_id = self.settings.session;
        let session = self
            .store
            .get_session(session_id)?
            .ok_or(WorkerError::SessionNotFound(session_id))?;
        let (arch, num_cu) = self.machine.gpu_identity().await?;
        if base_arch(&arch) != base_arch(&session.arch) || num_cu != session.num_cu {
            return Err(WorkerError::Environment(format!(
                "session {session_id} targets {} with {} CUs, machine {} has {arch} with {num_cu}",
                session.arch,
                session.num_cu,
                self.machine.id()
            )));
        }
        if let Err(e) = self.machine.set_gpu_clocks(self.settings.gpu_id).await {
            warn!(tag = %self.tag, error = %e, "could not set gpu clocks");
        }
        info!(tag = %self.tag, %arch, num_cu, "environment check passed");
        Ok(())
    }

    /// Loop [`run_once`](Self::run_once) until shutdown, abort, or (when
    /// configured) an empty queue.
    ///
    /// On shutdown, jobs this worker still holds in flight are requeued.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<RunExit> {
        self.prepare().await?;
        info!(tag = %self.tag, step = self.step.name(), session = self.settings.session, "worker started");

        loop {
            if *shutdown.borrow() {
                return self.shut_down().await;
            }

            let outcome = tokio::select! {
                outcome = self.run_once() => Some(outcome),
                _ = shutdown.changed() => None,
            };
            let Some(outcome) = outcome else {
                return self.shut_down().await;
            };

            let wait = match outcome {
                Ok(IterationOutcome::Processed(n)) => {
                    debug!(tag = %self.tag, processed = n, "iteration done");
                    continue;
                }
                Ok(IterationOutcome::Idle) => {
                    if self.settings.exit_when_drained {
                        info!(tag = %self.tag, "queue drained, exiting");
                        return Ok(RunExit::Drained);
                    }
                    debug!(tag = %self.tag, "no jobs to claim");
                    self.settings.idle_backoff
                }
                Ok(IterationOutcome::Paused(wait)) => wait,
                Ok(IterationOutcome::Aborted(reason)) => {
                    warn!(tag = %self.tag, %reason, "worker aborted");
                    return Ok(RunExit::Aborted(reason));
                }
                Err(WorkerError::DeviceHealth { .. }) => {
                    let wait = self.health.next_interval();
                    warn!(tag = %self.tag, wait = ?wait, "gpu unhealthy, waiting before next check");
                    wait
                }
                Err(e) => {
                    error!(tag = %self.tag, error = %e, "iteration failed");
                    self.settings.idle_backoff
                }
            };

            let stop = tokio::select! {
                _ = tokio::time::sleep(wait) => false,
                _ = shutdown.changed() => true,
            };
            if stop {
                return self.shut_down().await;
            }
        }
    }

    async fn shut_down(&mut self) -> WorkerResult<RunExit> {
        info!(tag = %self.tag, "shutdown requested");
        self.requeue().await?;
        Ok(RunExit::Shutdown)
    }

    /// One pass of the loop: abort check, pause check, health check, claim,
    /// then execute and finalize every claimed job.
    pub async fn run_once(&mut self) -> WorkerResult<IterationOutcome> {
        if let Some(reason) = self.abort.check() {
            info!(tag = %self.tag, %reason, "abort sentinel present, not claiming");
            return Ok(IterationOutcome::Aborted(reason));
        }

        if let Some(wait) = self.check_pause().await? {
            return Ok(IterationOutcome::Paused(wait));
        }

        let recheck = self.health.status() == GpuHealth::Unhealthy || self.health.is_due(Instant::now());
        if self.step.checks_health() && recheck {
            self.periodic_health_check().await?;
        }

        let step = Arc::clone(&self.step);
        let tag = self.tag;
        let claimed = self
            .with_store_retry(|store| {
                store.claim(
                    step.fetch_state(),
                    step.claim_state(),
                    self.settings.claim_num,
                    &self.settings.selector,
                    tag,
                    ClaimMode::Commit,
                )
            })
            .await?;
        if claimed == 0 {
            return Ok(IterationOutcome::Idle);
        }
        info!(%tag, claimed, state = %step.claim_state(), "jobs claimed");

        let jobs = self
            .with_store_retry(|store| store.claimed_jobs(step.claim_state(), tag))
            .await?;
        let mut processed = 0;
        for job in jobs {
            match self.process(job).await? {
                JobOutcome::Done => processed += 1,
                JobOutcome::Lost => {}
                JobOutcome::Aborted(reason) => {
                    self.requeue().await?;
                    return Ok(IterationOutcome::Aborted(reason));
                }
            }
        }
        Ok(IterationOutcome::Processed(processed))
    }

    async fn process(&mut self, job: Job) -> WorkerResult<JobOutcome> {
        let step = Arc::clone(&self.step);
        let tag = self.tag;
        let job_id = job.id;

        let start = JobUpdate::to(step.running_state()).from_state(step.claim_state());
        if !self
            .with_store_retry(|store| store.finalize_job(job_id, tag, &start))
            .await?
        {
            warn!(%tag, job_id, "job no longer held, skipping");
            return Ok(JobOutcome::Lost);
        }

        let cmd = step.command(&job, self.settings.gpu_id);
        info!(%tag, job_id, config = job.config, step = step.name(), command = %cmd, "running job");

        let update = match self.run_tool(&cmd).await {
            Ok(out) => {
                // Check the device before recording either outcome.
                if step.checks_health() && !self.verify_device().await {
                    self.requeue().await?;
                    return Err(self.device_error());
                }
                if step.succeeded(&out) {
                    info!(%tag, job_id, state = %step.success_state(), "job succeeded");
                    JobUpdate::to(step.success_state())
                } else {
                    let next = if job.retries + 1 >= self.settings.max_job_retries {
                        JobState::Errored
                    } else {
                        step.error_state()
                    };
                    warn!(%tag, job_id, exit_code = out.exit_code, timed_out = out.timed_out, state = %next, "job failed");
                    JobUpdate::to(next).with_result(diagnostic(&out)).failed()
                }
            }
            Err(MachineError::Transport(TransportError::Aborted(reason))) => {
                return Ok(JobOutcome::Aborted(reason));
            }
            Err(MachineError::Transport(
                e @ (TransportError::Precondition { .. } | TransportError::Connectivity { .. }),
            )) => {
                error!(%tag, job_id, command = %cmd, error = %e, "job could not run");
                JobUpdate::to(JobState::Errored).with_result(e.to_string())
            }
            Err(e) => {
                error!(%tag, job_id, command = %cmd, error = %e, "tool run failed, requeueing");
                self.requeue().await?;
                return Err(e.into());
            }
        };

        let update = update.from_state(step.running_state());
        if !self
            .with_store_retry(|store| store.finalize_job(job_id, tag, &update))
            .await?
        {
            warn!(%tag, job_id, "job taken away while running, result dropped");
            return Ok(JobOutcome::Lost);
        }
        Ok(JobOutcome::Done)
    }

    /// Run the tool, retrying while it reports a transient disk I/O error.
    async fn run_tool(&self, cmd: &str) -> Result<CommandOutput, MachineError> {
        let mut attempt = 0;
        loop {
            let out = self
                .machine
                .exec_command(cmd, self.settings.command_timeout)
                .await?;
            if out.success()
                || !out.stdout.contains(DISK_IO_ERROR)
                || attempt >= self.settings.max_job_retries
            {
                return Ok(out);
            }
            attempt += 1;
            let wait = jitter_between(Duration::from_secs(1), Duration::from_secs(10));
            warn!(tag = %self.tag, attempt, wait = ?wait, "tool hit disk I/O error, retrying");
            tokio::time::sleep(wait).await;
        }
    }

    // ── Health ─────────────────────────────────────────────────────

    async fn periodic_health_check(&mut self) -> WorkerResult<()> {
        if !self.verify_device().await {
            self.requeue().await?;
            return Err(self.device_error());
        }
        Ok(())
    }

    fn device_error(&self) -> WorkerError {
        WorkerError::DeviceHealth {
            machine_id: self.tag.machine_id,
            gpu_id: self.settings.gpu_id,
        }
    }

    /// Probe up to `health_attempts` times; one healthy answer is enough.
    async fn verify_device(&mut self) -> bool {
        let gpu = self.settings.gpu_id;
        for attempt in 1..=self.settings.health_attempts {
            let result = self.machine.probe_gpu(gpu).await;
            if self.health.record(result) == GpuHealth::Healthy {
                return true;
            }
            warn!(tag = %self.tag, attempt, ?result, "gpu probe failed");
            if attempt < self.settings.health_attempts {
                tokio::time::sleep(jitter_between(Duration::from_millis(500), Duration::from_secs(2))).await;
            }
        }
        false
    }

    // ── Pause ──────────────────────────────────────────────────────

    async fn check_pause(&mut self) -> WorkerResult<Option<Duration>> {
        let reset_due = self
            .settings
            .reset_interval
            .is_some_and(|every| self.last_reset.elapsed() >= every);

        let reason = if reset_due {
            Some(PauseReason::ResetDue)
        } else {
            match self.machine.used_space().await {
                Ok(Some(used)) if used > self.settings.disk_limit_percent => {
                    Some(PauseReason::DiskFull(used))
                }
                Ok(Some(_)) => None,
                Ok(None) => Some(PauseReason::DiskUnreadable),
                Err(e) => {
                    warn!(tag = %self.tag, error = %e, "disk usage query failed");
                    Some(PauseReason::DiskUnreadable)
                }
            }
        };
        let Some(reason) = reason else {
            return Ok(None);
        };

        match self.pause.decide(reason) {
            PauseAction::Proceed => Ok(None),
            PauseAction::Wait(wait) => {
                info!(tag = %self.tag, ?reason, wait = ?wait, "pausing");
                Ok(Some(wait))
            }
            PauseAction::Restart => {
                self.machine.restart_server(true).await?;
                self.last_reset = Instant::now();
                Ok(Some(Duration::ZERO))
            }
        }
    }

    // ── Store ──────────────────────────────────────────────────────

    /// Move this worker's in-flight jobs back to the step's fetch state.
    async fn requeue(&self) -> WorkerResult<usize> {
        let states = self.step.in_flight();
        let tag = self.tag;
        self.with_store_retry(|store| store.requeue_in_flight(tag, &states))
            .await
    }

    async fn with_store_retry<T>(
        &self,
        mut op: impl FnMut(&JobStore) -> StateResult<T>,
    ) -> WorkerResult<T> {
        let mut attempt = 0;
        loop {
            match op(&self.store) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.store_retries => {
                    attempt += 1;
                    let wait = jitter_between(Duration::from_secs(1), Duration::from_secs(30));
                    warn!(tag = %self.tag, attempt, wait = ?wait, error = %e, "store busy, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Architecture without target feature flags: `gfx90a:sramecc+:xnack-` → `gfx90a`.
fn base_arch(arch: &str) -> &str {
    arch.split(':').next().unwrap_or(arch)
}

fn diagnostic(out: &CommandOutput) -> String {
    if out.timed_out {
        return format!("timed out waiting for output\n{}", out.stderr.trim_end());
    }
    format!("exit code {}\n{}", out.exit_code, out.stderr.trim_end())
}
