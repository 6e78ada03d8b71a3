//! Operator commands: abort sentinels and queue status.

use std::io;
use std::path::PathBuf;

use anyhow::Context;
use tracing::info;
use tune_core::TuneConfig;
use tune_core::abort::{arch_sentinel, machine_sentinel};
use tunegrid_state::{JobState, JobStore};

use crate::SentinelArgs;

fn sentinel_paths(config: &TuneConfig, args: &SentinelArgs) -> Vec<PathBuf> {
    let dir = &config.abort.dir;
    let prefix = &config.abort.prefix;
    let mut paths = Vec::new();
    if let Some(arch) = &args.arch {
        paths.push(arch_sentinel(dir, prefix, arch));
    }
    if let Some(machine_id) = args.machine {
        paths.push(machine_sentinel(dir, prefix, machine_id));
    }
    paths
}

pub fn set_sentinels(config: &TuneConfig, args: &SentinelArgs) -> anyhow::Result<()> {
    for path in sentinel_paths(config, args) {
        std::fs::write(&path, b"").with_context(|| format!("creating {}", path.display()))?;
        info!(path = %path.display(), "abort sentinel set");
    }
    Ok(())
}

pub fn clear_sentinels(config: &TuneConfig, args: &SentinelArgs) -> anyhow::Result<()> {
    for path in sentinel_paths(config, args) {
        match std::fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "abort sentinel cleared"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "abort sentinel was not set");
            }
            Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
    Ok(())
}

pub fn print_status(config: &TuneConfig, session: i64, json: bool) -> anyhow::Result<()> {
    let store = JobStore::open(&config.store.path, config.store.busy_timeout())
        .with_context(|| format!("opening job store {}", config.store.path.display()))?;
    let counts = store.count_by_state(session)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }

    println!("session {session}");
    let mut total = 0;
    for state in JobState::ALL {
        if let Some(count) = counts.get(&state) {
            println!("  {:<16}{count}", state.as_str());
            total += count;
        }
    }
    println!("  {:<16}{total}", "total");
    Ok(())
}
