//! Claim selectors and worker identity.

use std::fmt;

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::types::JobState;

/// The `(machine_id, gpu_id)` pair a worker stamps into rows it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerTag {
    pub machine_id: i64,
    pub gpu_id: i64,
}

impl WorkerTag {
    pub fn new(machine_id: i64, gpu_id: i64) -> Self {
        Self { machine_id, gpu_id }
    }
}

impl fmt::Display for WorkerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}:g{}", self.machine_id, self.gpu_id)
    }
}

/// Whether a claim call writes or only counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimMode {
    /// Move matching rows to the target state in this call.
    #[default]
    Commit,
    /// Report how many rows are eligible, without touching them.
    DryRun,
}

/// Which rows a worker may claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSelector {
    pub session: i64,
    /// Exact match on the `reason` label.
    pub reason: Option<String>,
    /// Substring match on the `fin_step` set column.
    pub fin_step: Option<String>,
    /// Rows with `retries >= max_retries` are skipped.
    pub max_retries: Option<u32>,
}

impl ClaimSelector {
    pub fn new(session: i64) -> Self {
        Self {
            session,
            reason: None,
            fin_step: None,
            max_retries: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_fin_step(mut self, fin_step: impl Into<String>) -> Self {
        self.fin_step = Some(fin_step.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Build the eligibility predicate for rows in `source`, appending
    /// its positional parameters to `params`.
    pub(crate) fn predicate(&self, source: JobState, params: &mut Vec<Value>) -> String {
        let mut conds = vec!["session = ?", "state = ?", "valid = 1"];
        params.push(Value::Integer(self.session));
        params.push(Value::Text(source.as_str().to_string()));

        if let Some(reason) = &self.reason {
            conds.push("reason = ?");
            params.push(Value::Text(reason.clone()));
        }
        if let Some(step) = &self.fin_step {
            conds.push("fin_step LIKE ?");
            params.push(Value::Text(format!("%{step}%")));
        }
        if let Some(max) = self.max_retries {
            conds.push("retries < ?");
            params.push(Value::Integer(i64::from(max)));
        }
        conds.join(" AND ")
    }
}
