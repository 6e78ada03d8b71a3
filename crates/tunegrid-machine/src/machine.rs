//! Per-host handle: transport, discovery, health, clocks, disk, restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{info, warn};
use tune_core::AbortCheck;
use tune_core::config::ToolsConfig;
use tunegrid_remote::{CommandOutput, Connection, RemoteEndpoint, RetryPolicy, TransportError};
use tunegrid_state::MachineRecord;

use crate::clock::{GpuClocks, parse_clock_levels, set_clock_commands};
use crate::disk::{local_used_percent, parse_df_usage};
use crate::error::{MachineError, MachineResult};
use crate::health::ProbeResult;
use crate::inventory::Inventory;
use crate::topology::parse_agents;

/// Timeout for the scoped device query in a health probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period after a restart command before the host is used again.
const REBOOT_WAIT: Duration = Duration::from_secs(40);

/// How a restart will be issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartVia {
    /// Out-of-band, run from this host against the BMC.
    Ipmi(String),
    /// In-band, over the machine's own transport.
    Shell(String),
}

/// A tuning host as seen from one worker process.
pub struct Machine {
    record: MachineRecord,
    local: bool,
    tools: ToolsConfig,
    docker_image: Option<String>,
    policy: RetryPolicy,
    abort: Arc<dyn AbortCheck>,
    /// One connection per OS process, created on first use.
    connections: Mutex<HashMap<u32, Arc<AsyncMutex<Connection>>>>,
    inventory: OnceCell<Inventory>,
}

impl Machine {
    /// A host reached over SSH.
    pub fn remote(
        record: MachineRecord,
        tools: ToolsConfig,
        policy: RetryPolicy,
        abort: Arc<dyn AbortCheck>,
    ) -> Self {
        Self::build(record, false, tools, policy, abort)
    }

    /// The host this process runs on.
    pub fn local(
        record: MachineRecord,
        tools: ToolsConfig,
        policy: RetryPolicy,
        abort: Arc<dyn AbortCheck>,
    ) -> Self {
        Self::build(record, true, tools, policy, abort)
    }

    fn build(
        record: MachineRecord,
        local: bool,
        tools: ToolsConfig,
        policy: RetryPolicy,
        abort: Arc<dyn AbortCheck>,
    ) -> Self {
        info!(machine_id = record.id, hostname = %record.hostname, avail_gpus = ?record.avail_gpus, local, "machine handle created");
        Self {
            record,
            local,
            tools,
            docker_image: None,
            policy,
            abort,
            connections: Mutex::new(HashMap::new()),
            inventory: OnceCell::new(),
        }
    }

    /// Run remote tool commands inside this image.
    pub fn with_docker_image(mut self, image: impl Into<String>) -> Self {
        self.docker_image = Some(image.into());
        self
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn record(&self) -> &MachineRecord {
        &self.record
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// This process's connection, created on first call.
    pub fn connection(&self) -> Arc<AsyncMutex<Connection>> {
        let pid = std::process::id();
        let mut cache = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(pid)
            .or_insert_with(|| {
                info!(machine_id = self.record.id, pid, "no connection for process, creating one");
                Arc::new(AsyncMutex::new(self.new_connection()))
            })
            .clone()
    }

    fn new_connection(&self) -> Connection {
        if self.local {
            return Connection::local(self.record.id, Arc::clone(&self.abort), self.policy.clone());
        }
        let endpoint = RemoteEndpoint {
            hostname: self.record.hostname.clone(),
            port: self.record.port,
            user: self.record.user.clone(),
            keyfile: self.record.keyfile.as_ref().map(PathBuf::from),
        };
        Connection::remote(self.record.id, endpoint, Arc::clone(&self.abort), self.policy.clone())
    }

    async fn run(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
        allow_abort: bool,
    ) -> MachineResult<CommandOutput> {
        let conn = self.connection();
        let mut conn = conn.lock().await;
        Ok(conn.execute(cmd, timeout, allow_abort).await?)
    }

    /// Run a tuning command; on remote hosts it goes through the docker wrapper.
    pub async fn exec_command(&self, cmd: &str, timeout: Option<Duration>) -> MachineResult<CommandOutput> {
        let command = match (&self.docker_image, self.local) {
            (Some(image), false) => self
                .tools
                .docker
                .replace("{image}", image)
                .replace("{cmd}", cmd),
            _ => cmd.to_string(),
        };
        info!(machine_id = self.record.id, command = %command, "running command");
        self.run(&command, timeout, true).await
    }

    // ── Discovery ──────────────────────────────────────────────────

    /// Device inventory, queried once per process.
    pub async fn properties(&self) -> MachineResult<&Inventory> {
        self.inventory.get_or_try_init(|| self.discover()).await
    }

    async fn discover(&self) -> MachineResult<Inventory> {
        let agents = match self.run(&self.tools.rocminfo, None, false).await {
            Ok(out) => parse_agents(&out.stdout),
            Err(MachineError::Transport(TransportError::Precondition { binary, .. })) => {
                warn!(machine_id = self.record.id, binary = %binary, "device enumeration tool missing");
                Default::default()
            }
            Err(e) => return Err(e),
        };

        if agents.is_empty() {
            // Compile-only hosts have no GPU driver.
            let out = self.run("nproc", None, false).await?;
            let num_cpus = out
                .lines()
                .next()
                .and_then(|l| l.trim().parse().ok())
                .ok_or_else(|| MachineError::Parse(format!("nproc: {}", out.stdout.trim())))?;
            info!(machine_id = self.record.id, num_cpus, "no agents reported, cpu only");
            return Ok(Inventory::cpu_only(num_cpus));
        }

        let inventory = Inventory::from_agents(&agents);
        info!(
            machine_id = self.record.id,
            gpus = inventory.num_gpus(),
            num_cpus = inventory.num_cpus,
            "device inventory built"
        );
        Ok(inventory)
    }

    /// GPU indices this host may use: the configured list, or every GPU found.
    pub async fn avail_gpus(&self) -> MachineResult<Vec<u32>> {
        if !self.record.avail_gpus.is_empty() {
            return Ok(self.record.avail_gpus.clone());
        }
        let inventory = self.properties().await?;
        Ok((0..inventory.num_gpus() as u32).collect())
    }

    /// Architecture and compute units of the host's GPUs: the first GPU
    /// found locally, otherwise the inventory record.
    pub async fn gpu_identity(&self) -> MachineResult<(String, u32)> {
        if self.local {
            if let Some(gpu) = self.properties().await?.gpu(0) {
                return Ok((gpu.arch.clone(), gpu.num_cu));
            }
        }
        Ok((self.record.arch.clone(), self.record.num_cu))
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Ask the device query tool, scoped to one GPU, for its architecture.
    pub async fn probe_gpu(&self, gpu: u32) -> ProbeResult {
        let machine_id = self.record.id;
        match self.avail_gpus().await {
            Ok(avail) if avail.contains(&gpu) => {}
            Ok(_) => {
                info!(machine_id, gpu_id = gpu, "gpu index out of bounds");
                return ProbeResult::Unhealthy;
            }
            Err(e) => {
                warn!(machine_id, gpu_id = gpu, error = %e, "cannot list gpus");
                return ProbeResult::Failed;
            }
        }
        let arch = match self.properties().await {
            Ok(inventory) => match inventory.gpu(gpu as usize) {
                Some(entry) => entry.arch.clone(),
                None => {
                    warn!(machine_id, gpu_id = gpu, "gpu missing from inventory");
                    return ProbeResult::Unhealthy;
                }
            },
            Err(e) => {
                warn!(machine_id, gpu_id = gpu, error = %e, "inventory unavailable");
                return ProbeResult::Failed;
            }
        };

        info!(machine_id, gpu_id = gpu, "checking gpu status");
        let cmd = format!("GPU_DEVICE_ORDINAL={gpu} {} | grep gfx", self.tools.clinfo);
        let out = match self.run(&cmd, Some(HEALTH_PROBE_TIMEOUT), false).await {
            Ok(out) => out,
            Err(e) => {
                warn!(machine_id, gpu_id = gpu, error = %e, "device query failed");
                return ProbeResult::Failed;
            }
        };
        if out.timed_out {
            warn!(machine_id, gpu_id = gpu, "device query timed out");
            return ProbeResult::Failed;
        }
        match out.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(line) if line.contains(&arch) => {
                info!(machine_id, gpu_id = gpu, "gpu status success");
                ProbeResult::Healthy
            }
            Some(line) => {
                warn!(machine_id, gpu_id = gpu, output = line, expected = %arch, "device query mismatch");
                ProbeResult::Unhealthy
            }
            None => {
                warn!(machine_id, gpu_id = gpu, "device query returned nothing");
                ProbeResult::Unhealthy
            }
        }
    }

    pub async fn gpu_is_healthy(&self, gpu: u32) -> bool {
        self.probe_gpu(gpu).await == ProbeResult::Healthy
    }

    // ── Clocks ─────────────────────────────────────────────────────

    /// Current clock levels of local GPU index `gpu`.
    pub async fn gpu_clocks(&self, gpu: u32) -> MachineResult<Option<GpuClocks>> {
        let out = self.run(&format!("{} -c", self.tools.rocm_smi), None, false).await?;
        let clocks = parse_clock_levels(&out.stdout)?;
        Ok(clocks.get(gpu as usize).copied())
    }

    /// Apply the configured clock targets. Failures are logged, not returned.
    pub async fn set_gpu_clocks(&self, gpu: u32) -> MachineResult<()> {
        let target = GpuClocks {
            sclk: self.record.sclk,
            mclk: self.record.mclk,
        };
        for cmd in set_clock_commands(&self.tools.rocm_smi, gpu, target) {
            let out = self.run(&cmd, None, false).await?;
            if !out.success() {
                warn!(machine_id = self.record.id, gpu_id = gpu, command = %cmd, exit_code = out.exit_code, "clock set failed");
            }
        }
        Ok(())
    }

    // ── Disk ───────────────────────────────────────────────────────

    /// Used percentage of the root filesystem, `None` if unreadable.
    pub async fn used_space(&self) -> MachineResult<Option<f64>> {
        let used = if self.local {
            match local_used_percent(Path::new("/")) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(machine_id = self.record.id, error = %e, "statvfs failed");
                    None
                }
            }
        } else {
            let out = self.run("df -h / | grep dev", None, false).await?;
            parse_df_usage(&out.stdout)
        };
        info!(machine_id = self.record.id, hostname = %self.record.hostname, used = ?used, "used space");
        Ok(used)
    }

    // ── Restart ────────────────────────────────────────────────────

    /// IPMI when usable credentials exist, otherwise `sudo reboot`.
    pub fn restart_via(&self) -> RestartVia {
        match &self.record.ipmi {
            Some(ipmi) if !self.record.ipmi_inaccessible => {
                let port = ipmi.port.map(|p| format!(" -p {p}")).unwrap_or_default();
                RestartVia::Ipmi(format!(
                    "{} -H {} -U {} -P {}{port} chassis power reset",
                    self.tools.ipmitool, ipmi.ip, ipmi.user, ipmi.password
                ))
            }
            _ => RestartVia::Shell("sudo reboot".to_string()),
        }
    }

    /// Reboot the host, then optionally wait for it to go down.
    pub async fn restart_server(&self, wait: bool) -> MachineResult<()> {
        let machine_id = self.record.id;
        warn!(machine_id, "sending reboot command");
        match self.restart_via() {
            RestartVia::Ipmi(cmd) => {
                info!(machine_id, "using ipmi to reboot machine");
                let mut bmc = Connection::local(machine_id, Arc::clone(&self.abort), self.policy.clone());
                let out = bmc.execute_with(&cmd, None, false, |_| {}).await?;
                if !out.success() {
                    warn!(machine_id, exit_code = out.exit_code, output = %out.stderr.trim(), "ipmi reset failed");
                }
            }
            RestartVia::Shell(cmd) => {
                info!(machine_id, "no ipmi credentials, using shell to reboot machine");
                self.run(&cmd, None, false).await?;
            }
        }
        if wait {
            warn!(machine_id, "waiting for machine to reboot");
            tokio::time::sleep(REBOOT_WAIT).await;
        }
        Ok(())
    }
}
