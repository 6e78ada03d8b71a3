//! `tuned fleet`: one `tuned worker` OS process per machine × GPU × slot.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};
use tune_core::TuneConfig;
use tunegrid_machine::Machine;
use tunegrid_remote::RetryPolicy;
use tunegrid_state::{JobStore, MachineRecord};

use crate::StepKind;

struct Slot {
    machine_id: i64,
    gpu: u32,
    proc: u32,
    child: Child,
}

pub async fn run(
    config_path: &Path,
    config: &TuneConfig,
    step: StepKind,
    only: &[i64],
    local: bool,
) -> anyhow::Result<()> {
    let store = JobStore::open(&config.store.path, config.store.busy_timeout())
        .with_context(|| format!("opening job store {}", config.store.path.display()))?;
    let machines: Vec<MachineRecord> = store
        .list_machines(true)?
        .into_iter()
        .filter(|m| only.is_empty() || only.contains(&m.id))
        .collect();
    info!(count = machines.len(), step = step.as_str(), "starting fleet");

    let exe = std::env::current_exe().context("locating the tuned executable")?;
    let procs_per_gpu = config.worker.procs_per_gpu.max(1);
    let mut slots = Vec::new();

    for record in machines {
        let machine_id = record.id;
        let gpus = match gpu_slots(config, record, step, local).await {
            Ok(gpus) => gpus,
            Err(e) => {
                warn!(machine_id, error = %e, "skipping machine, cannot list gpus");
                continue;
            }
        };
        for gpu in gpus {
            for proc in 0..procs_per_gpu {
                let mut cmd = Command::new(&exe);
                cmd.arg("--config")
                    .arg(config_path)
                    .arg("worker")
                    .args(["--machine", &machine_id.to_string()])
                    .args(["--gpu", &gpu.to_string()])
                    .args(["--step", step.as_str()])
                    .kill_on_drop(true);
                if local {
                    cmd.arg("--local");
                }
                let child = cmd
                    .spawn()
                    .with_context(|| format!("spawning worker for machine {machine_id} gpu {gpu}"))?;
                info!(machine_id, gpu_id = gpu, proc, pid = ?child.id(), "worker started");
                slots.push(Slot {
                    machine_id,
                    gpu,
                    proc,
                    child,
                });
            }
        }
    }

    if slots.is_empty() {
        warn!("no workers started");
        return Ok(());
    }

    // Workers share our process group and get the same interrupt; keep
    // waiting so they can requeue before we exit.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, waiting for workers to stop");
        }
    });

    let mut failed = 0;
    for mut slot in slots {
        match slot.child.wait().await {
            Ok(status) if status.success() => {
                info!(machine_id = slot.machine_id, gpu_id = slot.gpu, proc = slot.proc, "worker exited");
            }
            Ok(status) => {
                failed += 1;
                warn!(machine_id = slot.machine_id, gpu_id = slot.gpu, proc = slot.proc, %status, "worker failed");
            }
            Err(e) => {
                failed += 1;
                error!(machine_id = slot.machine_id, gpu_id = slot.gpu, error = %e, "lost track of worker");
            }
        }
    }
    info!(failed, "fleet stopped");
    Ok(())
}

/// GPU indices to start workers on. Compile-only hosts without GPUs still
/// get one slot for the compile step.
async fn gpu_slots(
    config: &TuneConfig,
    record: MachineRecord,
    step: StepKind,
    local: bool,
) -> anyhow::Result<Vec<u32>> {
    if !record.avail_gpus.is_empty() {
        return Ok(record.avail_gpus);
    }
    let abort = Arc::new(config.sentinels(record.id, None));
    let policy = RetryPolicy::from_config(&config.transport);
    let tools = config.tools.clone();
    let machine = if local {
        Machine::local(record, tools, policy, abort)
    } else {
        Machine::remote(record, tools, policy, abort)
    };
    let gpus = machine.avail_gpus().await?;
    if gpus.is_empty() && step == StepKind::Compile {
        return Ok(vec![0]);
    }
    Ok(gpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(avail_gpus: Vec<u32>) -> MachineRecord {
        MachineRecord {
            id: 5,
            hostname: "localhost".to_string(),
            port: 22,
            user: "tuna".to_string(),
            keyfile: None,
            arch: "gfx90a".to_string(),
            num_cu: 104,
            avail_gpus,
            sclk: None,
            mclk: None,
            available: true,
            ipmi: None,
            ipmi_inaccessible: false,
            remarks: None,
        }
    }

    fn no_gpu_config() -> TuneConfig {
        let mut config = TuneConfig::default();
        config.tools.rocminfo = "tuned_no_rocminfo_xyz".to_string();
        config
    }

    #[tokio::test]
    async fn configured_gpus_win() {
        let gpus = gpu_slots(&no_gpu_config(), record(vec![1, 3]), StepKind::Evaluate, true)
            .await
            .unwrap();
        assert_eq!(gpus, vec![1, 3]);
    }

    #[tokio::test]
    async fn gpu_less_host_compiles_on_one_slot() {
        let config = no_gpu_config();
        let compile = gpu_slots(&config, record(vec![]), StepKind::Compile, true).await.unwrap();
        assert_eq!(compile, vec![0]);
        let evaluate = gpu_slots(&config, record(vec![]), StepKind::Evaluate, true).await.unwrap();
        assert!(evaluate.is_empty());
    }
}
