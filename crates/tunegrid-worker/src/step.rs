//! Pipeline steps.
//!
//! A step names the states it moves jobs through and renders the tool
//! invocation for one job. Claiming, running, and finalizing are the
//! worker's job; a step only says what.

use tunegrid_remote::CommandOutput;
use tunegrid_state::{Job, JobState};

pub trait TuningStep: Send + Sync {
    /// Short name, also substituted for `{step}` in the tool template.
    fn name(&self) -> &'static str;

    /// State a job must be in to be claimed.
    fn fetch_state(&self) -> JobState;

    /// State a claim moves jobs into.
    fn claim_state(&self) -> JobState;

    /// State while the tool runs.
    fn running_state(&self) -> JobState;

    fn success_state(&self) -> JobState;

    /// State after a tool failure with retries left.
    fn error_state(&self) -> JobState;

    /// The tool invocation for `job` on GPU `gpu`.
    fn command(&self, job: &Job, gpu: u32) -> String;

    /// Probe the GPU before committing a success.
    fn checks_health(&self) -> bool {
        false
    }

    /// Compare the session's arch and compute units with the machine first.
    fn checks_environment(&self) -> bool {
        false
    }

    fn succeeded(&self, output: &CommandOutput) -> bool {
        output.success()
    }

    /// States a requeue moves back to [`fetch_state`](Self::fetch_state).
    fn in_flight(&self) -> [JobState; 2] {
        [self.claim_state(), self.running_state()]
    }
}

/// Fill a tool template's placeholders for one job.
pub fn render_command(template: &str, step: &str, job: &Job, gpu: u32) -> String {
    let solver = job.solver.map(|s| s.to_string()).unwrap_or_default();
    template
        .replace("{step}", step)
        .replace("{job}", &job.id.to_string())
        .replace("{config}", &job.config.to_string())
        .replace("{solver}", &solver)
        .replace("{session}", &job.session.to_string())
        .replace("{gpu}", &gpu.to_string())
        .replace("{cache}", job.cache_loc.as_deref().unwrap_or_default())
}

/// `new -> compile_start -> compiling -> compiled | compile_error`.
#[derive(Debug, Clone)]
pub struct FinCompile {
    template: String,
}

impl FinCompile {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl TuningStep for FinCompile {
    fn name(&self) -> &'static str {
        "compile"
    }

    fn fetch_state(&self) -> JobState {
        JobState::New
    }

    fn claim_state(&self) -> JobState {
        JobState::CompileStart
    }

    fn running_state(&self) -> JobState {
        JobState::Compiling
    }

    fn success_state(&self) -> JobState {
        JobState::Compiled
    }

    fn error_state(&self) -> JobState {
        JobState::CompileError
    }

    fn command(&self, job: &Job, gpu: u32) -> String {
        render_command(&self.template, self.name(), job, gpu)
    }
}

/// `compiled -> eval_start -> evaluating -> evaluated | evaluate_error`,
/// pinned to one GPU and health-checked before success is recorded.
#[derive(Debug, Clone)]
pub struct FinEvaluate {
    template: String,
}

impl FinEvaluate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl TuningStep for FinEvaluate {
    fn name(&self) -> &'static str {
        "evaluate"
    }

    fn fetch_state(&self) -> JobState {
        JobState::Compiled
    }

    fn claim_state(&self) -> JobState {
        JobState::EvalStart
    }

    fn running_state(&self) -> JobState {
        JobState::Evaluating
    }

    fn success_state(&self) -> JobState {
        JobState::Evaluated
    }

    fn error_state(&self) -> JobState {
        JobState::EvaluateError
    }

    fn command(&self, job: &Job, gpu: u32) -> String {
        format!(
            "HIP_VISIBLE_DEVICES={gpu} {}",
            render_command(&self.template, self.name(), job, gpu)
        )
    }

    fn checks_health(&self) -> bool {
        true
    }

    fn checks_environment(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job {
            id: 42,
            session: 2,
            config: 1007,
            solver: Some(31),
            state: JobState::CompileStart,
            valid: true,
            reason: String::new(),
            fin_step: "not_fin".to_string(),
            retries: 0,
            result: None,
            cache_loc: Some("~/.cache/miopen_0a1b2c3d4e".to_string()),
            machine_id: 1,
            gpu_id: 0,
            compile_start: None,
            compile_end: None,
            eval_start: None,
            eval_end: None,
        }
    }

    #[test]
    fn placeholders_are_filled() {
        let cmd = render_command(
            "fin --{step} -j {job} -c {config} -s {solver} -S {session} -g {gpu} --cache {cache}",
            "compile",
            &job(),
            3,
        );
        assert_eq!(
            cmd,
            "fin --compile -j 42 -c 1007 -s 31 -S 2 -g 3 --cache ~/.cache/miopen_0a1b2c3d4e"
        );
    }

    #[test]
    fn missing_solver_renders_empty() {
        let mut j = job();
        j.solver = None;
        assert_eq!(render_command("x{solver}y", "compile", &j, 0), "xy");
    }

    #[test]
    fn compile_states() {
        let step = FinCompile::new("true");
        assert_eq!(step.fetch_state(), JobState::New);
        assert_eq!(step.in_flight(), [JobState::CompileStart, JobState::Compiling]);
        assert!(!step.checks_health());
        for state in step.in_flight() {
            assert_eq!(state.requeue_target(), Some(step.fetch_state()));
        }
    }

    #[test]
    fn evaluate_pins_the_gpu() {
        let step = FinEvaluate::new("fin -i /tmp/fin_input_{job}.json");
        assert_eq!(
            step.command(&job(), 2),
            "HIP_VISIBLE_DEVICES=2 fin -i /tmp/fin_input_42.json"
        );
        assert!(step.checks_health());
        for state in step.in_flight() {
            assert_eq!(state.requeue_target(), Some(step.fetch_state()));
        }
    }
}
