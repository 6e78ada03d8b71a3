//! tuned — the tunegrid daemon.
//!
//! One binary for every role in a tuning fleet:
//! - `worker`: the claim/execute/finalize loop for one (machine, GPU)
//! - `fleet`: start one `worker` process per available machine × GPU × slot
//! - `abort`: create or remove the cooperative abort sentinels
//! - `status`: job counts per state for a session
//!
//! # Usage
//!
//! ```text
//! tuned --config tune.toml worker --machine 3 --gpu 1 --step evaluate
//! tuned --config tune.toml fleet --step compile
//! tuned abort set --arch gfx90a
//! tuned status --session 12
//! ```

mod fleet_mode;
mod operator;
mod worker_mode;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use tune_core::TuneConfig;

#[derive(Parser)]
#[command(name = "tuned", about = "tunegrid fleet tuning daemon")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "tune.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one worker bound to a machine and GPU index.
    Worker {
        /// Machine id from the inventory.
        #[arg(long)]
        machine: i64,

        /// GPU index on that machine.
        #[arg(long, default_value = "0")]
        gpu: u32,

        #[arg(long, value_enum)]
        step: StepKind,

        /// Run commands on this host instead of over SSH.
        #[arg(long)]
        local: bool,
    },

    /// Start workers on every available machine and wait for them.
    Fleet {
        #[arg(long, value_enum)]
        step: StepKind,

        /// Only these machine ids (default: every available machine).
        #[arg(long = "machine")]
        machines: Vec<i64>,

        /// Pass `--local` to every worker.
        #[arg(long)]
        local: bool,
    },

    /// Manage abort sentinels.
    Abort {
        #[command(subcommand)]
        action: AbortAction,
    },

    /// Print job counts by state.
    Status {
        /// Session id (default: `worker.session` from the config).
        #[arg(long)]
        session: Option<i64>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AbortAction {
    /// Create sentinels; workers stop at their next check.
    Set(SentinelArgs),
    /// Remove sentinels; workers may be started again.
    Clear(SentinelArgs),
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = true)]
struct SentinelArgs {
    /// Fleet-wide sentinel for this architecture.
    #[arg(long)]
    arch: Option<String>,

    /// Sentinel for one machine id.
    #[arg(long)]
    machine: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StepKind {
    Compile,
    Evaluate,
}

impl StepKind {
    fn as_str(self) -> &'static str {
        match self {
            StepKind::Compile => "compile",
            StepKind::Evaluate => "evaluate",
        }
    }
}

const DEFAULT_FILTER: &str = "info,tuned=debug,tunegrid=debug";

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = TuneConfig::from_file(&cli.config)?;

    match cli.command {
        Command::Worker {
            machine,
            gpu,
            step,
            local,
        } => worker_mode::run(&config, machine, gpu, step, local).await,
        Command::Fleet {
            step,
            machines,
            local,
        } => fleet_mode::run(&cli.config, &config, step, &machines, local).await,
        Command::Abort { action } => match action {
            AbortAction::Set(args) => operator::set_sentinels(&config, &args),
            AbortAction::Clear(args) => operator::clear_sentinels(&config, &args),
        },
        Command::Status { session, json } => {
            operator::print_status(&config, session.unwrap_or(config.worker.session), json)
        }
    }
}
