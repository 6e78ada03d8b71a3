//! `tuned worker`: one claim loop in this process.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tune_core::{AbortCheck, TuneConfig};
use tunegrid_machine::Machine;
use tunegrid_remote::RetryPolicy;
use tunegrid_state::JobStore;
use tunegrid_worker::{FinCompile, FinEvaluate, RunExit, TuningStep, Worker, WorkerSettings};

use crate::StepKind;

pub async fn run(
    config: &TuneConfig,
    machine_id: i64,
    gpu: u32,
    step: StepKind,
    local: bool,
) -> anyhow::Result<()> {
    let store = JobStore::open(&config.store.path, config.store.busy_timeout())
        .with_context(|| format!("opening job store {}", config.store.path.display()))?;
    let record = store
        .get_machine(machine_id)?
        .with_context(|| format!("machine {machine_id} is not in the inventory"))?;
    let session_id = config.worker.session;
    let session = store
        .get_session(session_id)?
        .with_context(|| format!("session {session_id} not found"))?;

    let abort: Arc<dyn AbortCheck> = Arc::new(config.sentinels(machine_id, Some(&session.arch)));
    let policy = RetryPolicy::from_config(&config.transport);
    let tools = config.tools.clone();
    let machine = if local {
        Machine::local(record, tools, policy, Arc::clone(&abort))
    } else if session.docker.is_empty() {
        Machine::remote(record, tools, policy, Arc::clone(&abort))
    } else {
        Machine::remote(record, tools, policy, Arc::clone(&abort)).with_docker_image(session.docker.clone())
    };

    let template = config.worker.tool_command.clone();
    let step: Arc<dyn TuningStep> = match step {
        StepKind::Compile => Arc::new(FinCompile::new(template)),
        StepKind::Evaluate => Arc::new(FinEvaluate::new(template)),
    };

    let settings = WorkerSettings::from_config(config, gpu);
    let mut worker = Worker::new(store, Arc::new(machine), step, settings, abort);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c");
                // Keep the sender alive so the worker doesn't see a closed channel.
                std::future::pending::<()>().await;
            }
        }
    });

    match worker.run(shutdown_rx).await? {
        RunExit::Shutdown => info!(tag = %worker.tag(), "worker stopped"),
        RunExit::Drained => info!(tag = %worker.tag(), "worker finished, queue drained"),
        RunExit::Aborted(reason) => warn!(tag = %worker.tag(), %reason, "worker stopped by abort sentinel"),
    }
    Ok(())
}
