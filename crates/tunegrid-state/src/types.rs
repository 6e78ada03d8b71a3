//! Domain types for the job store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Job ───────────────────────────────────────────────────────────

/// Lifecycle state of a tuning job.
///
/// ```text
/// new → compile_start → compiling → compiled | compile_error
///     compiled → eval_start → evaluating → evaluated | evaluate_error
///     evaluated → completed
/// ```
///
/// plus the side states `errored`, `timeout`, `aborted`, `not_applicable`,
/// `not_tunable`, `bad_param`, `transfer_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    CompileStart,
    Compiling,
    Compiled,
    CompileError,
    EvalStart,
    Evaluating,
    Evaluated,
    EvaluateError,
    Completed,
    Errored,
    Timeout,
    Aborted,
    NotApplicable,
    NotTunable,
    BadParam,
    TransferError,
}

impl JobState {
    pub const ALL: [JobState; 17] = [
        JobState::New,
        JobState::CompileStart,
        JobState::Compiling,
        JobState::Compiled,
        JobState::CompileError,
        JobState::EvalStart,
        JobState::Evaluating,
        JobState::Evaluated,
        JobState::EvaluateError,
        JobState::Completed,
        JobState::Errored,
        JobState::Timeout,
        JobState::Aborted,
        JobState::NotApplicable,
        JobState::NotTunable,
        JobState::BadParam,
        JobState::TransferError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::CompileStart => "compile_start",
            JobState::Compiling => "compiling",
            JobState::Compiled => "compiled",
            JobState::CompileError => "compile_error",
            JobState::EvalStart => "eval_start",
            JobState::Evaluating => "evaluating",
            JobState::Evaluated => "evaluated",
            JobState::EvaluateError => "evaluate_error",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
            JobState::Timeout => "timeout",
            JobState::Aborted => "aborted",
            JobState::NotApplicable => "not_applicable",
            JobState::NotTunable => "not_tunable",
            JobState::BadParam => "bad_param",
            JobState::TransferError => "transfer_error",
        }
    }

    /// A worker currently holds the job and is working on it.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            JobState::CompileStart | JobState::Compiling | JobState::EvalStart | JobState::Evaluating
        )
    }

    /// The last known-good state an in-flight job falls back to on requeue.
    pub fn requeue_target(self) -> Option<JobState> {
        match self {
            JobState::CompileStart | JobState::Compiling => Some(JobState::New),
            JobState::EvalStart | JobState::Evaluating => Some(JobState::Compiled),
            _ => None,
        }
    }

    /// Timestamp column stamped when a job enters this state.
    pub(crate) fn timestamp_column(self) -> Option<&'static str> {
        match self {
            JobState::CompileStart => Some("compile_start"),
            JobState::Compiled => Some("compile_end"),
            JobState::EvalStart => Some("eval_start"),
            JobState::Evaluated => Some("eval_end"),
            _ => None,
        }
    }

    /// Entering this state allocates a fresh kernel cache location.
    pub(crate) fn allocates_cache(self) -> bool {
        matches!(self, JobState::CompileStart | JobState::EvalStart)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// One tuning trial row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub session: i64,
    /// Opaque reference to the problem configuration.
    pub config: i64,
    /// Opaque reference to the solver, when the job targets one.
    pub solver: Option<i64>,
    pub state: JobState,
    pub valid: bool,
    pub reason: String,
    pub fin_step: String,
    pub retries: u32,
    pub result: Option<String>,
    pub cache_loc: Option<String>,
    /// Owner tag; -1 until first claimed.
    pub machine_id: i64,
    pub gpu_id: i64,
    pub compile_start: Option<u64>,
    pub compile_end: Option<u64>,
    pub eval_start: Option<u64>,
    pub eval_end: Option<u64>,
}

/// Fields supplied when a loader inserts a job in state `new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub session: i64,
    pub config: i64,
    pub solver: Option<i64>,
    pub reason: String,
    pub fin_step: String,
}

impl NewJob {
    pub fn new(session: i64, config: i64) -> Self {
        Self {
            session,
            config,
            solver: None,
            reason: String::new(),
            fin_step: "not_fin".to_string(),
        }
    }
}

/// A state write-back performed by the owning worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    /// Only apply while the row is still in this state.
    pub expect: Option<JobState>,
    pub result: Option<String>,
    pub increment_retries: bool,
}

impl JobUpdate {
    pub fn to(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn from_state(mut self, state: JobState) -> Self {
        self.expect = Some(state);
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.increment_retries = true;
        self
    }
}

// ── Session ───────────────────────────────────────────────────────

/// Immutable context shared by a batch of jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningSession {
    pub id: i64,
    pub arch: String,
    pub num_cu: u32,
    pub rocm_v: String,
    pub miopen_v: String,
    /// Docker image the tuning tool runs in.
    pub docker: String,
    pub reason: Option<String>,
}

// ── Machine ───────────────────────────────────────────────────────

/// A host in the fleet inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: i64,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    /// Private key used for the SSH session; `None` uses the agent/default keys.
    pub keyfile: Option<String>,
    pub arch: String,
    pub num_cu: u32,
    pub avail_gpus: Vec<u32>,
    /// Target shader clock level.
    pub sclk: Option<u32>,
    /// Target memory clock level.
    pub mclk: Option<u32>,
    pub available: bool,
    pub ipmi: Option<IpmiCredentials>,
    pub ipmi_inaccessible: bool,
    pub remarks: Option<String>,
}

/// Out-of-band management (BMC) access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpmiCredentials {
    pub ip: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
}

impl MachineRecord {
    /// Comma-separated form stored in the `avail_gpus` column.
    pub(crate) fn avail_gpus_column(&self) -> String {
        self.avail_gpus
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse the `avail_gpus` column ("0,1,2,3"); blanks and junk are skipped.
pub fn parse_gpu_list(s: &str) -> Vec<u32> {
    s.split(',').filter_map(|v| v.trim().parse().ok()).collect()
}
