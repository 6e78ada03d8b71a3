//! tune.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::abort::SentinelFiles;
use crate::duration::parse_or;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    pub store: StoreConfig,
    pub abort: AbortConfig,
    pub transport: TransportConfig,
    pub tools: ToolsConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database shared by every worker process.
    pub path: PathBuf,
    pub busy_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbortConfig {
    pub dir: PathBuf,
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_retries: u32,
    pub command_retries: u32,
    /// Per connection attempt; also the upper bound of the retry sleep.
    pub attempt_timeout: String,
    /// Idle time allowed between two output lines of a running command.
    pub command_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub rocminfo: String,
    pub rocm_smi: String,
    pub clinfo: String,
    pub ipmitool: String,
    /// Wrapper for commands run on remote hosts. `{image}` and `{cmd}` are substituted.
    pub docker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub session: i64,
    pub claim_num: u32,
    pub label: Option<String>,
    pub fin_step: Option<String>,
    pub max_job_retries: u32,
    pub store_retries: u32,
    pub health_interval: String,
    pub health_attempts: u32,
    pub idle_backoff: String,
    pub disk_limit_percent: f64,
    pub reset_interval: Option<String>,
    pub procs_per_gpu: u32,
    /// Stop the worker once a claim comes back empty instead of idling.
    pub exit_when_drained: bool,
    /// Tuning tool invocation. Placeholders: `{step}`, `{job}`, `{config}`,
    /// `{solver}`, `{session}`, `{gpu}`, `{cache}`.
    pub tool_command: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/tunegrid/tuna.db"),
            busy_timeout: "5s".to_string(),
        }
    }
}

impl Default for AbortConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp"),
            prefix: "miopen_abort".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_retries: 40,
            command_retries: 30,
            attempt_timeout: "60s".to_string(),
            command_timeout: "600s".to_string(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            rocminfo: "/opt/rocm/bin/rocminfo".to_string(),
            rocm_smi: "/opt/rocm/bin/rocm-smi".to_string(),
            clinfo: "/opt/rocm/opencl/bin/clinfo".to_string(),
            ipmitool: "ipmitool".to_string(),
            docker: "sudo docker run --device='/dev/kfd' --device='/dev/dri' -w /tmp/miopenpdb \
                     -v /tmp/miopenpdb:/tmp/miopenpdb --user=root --group-add video \
                     --privileged=true --rm {image} bash -c \"{cmd}\""
                .to_string(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            session: 0,
            claim_num: 1,
            label: None,
            fin_step: None,
            max_job_retries: 10,
            store_retries: 10,
            health_interval: "5m".to_string(),
            health_attempts: 5,
            idle_backoff: "30s".to_string(),
            disk_limit_percent: 90.0,
            reset_interval: None,
            procs_per_gpu: 1,
            exit_when_drained: false,
            tool_command: "/opt/rocm/bin/fin -i /tmp/fin_input_{job}.json -o /tmp/fin_output_{job}.json"
                .to_string(),
        }
    }
}

impl TuneConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TuneConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Sentinels for `machine_id`, honoring the arch-wide file when `arch` is known.
    pub fn sentinels(&self, machine_id: i64, arch: Option<&str>) -> SentinelFiles {
        let files = SentinelFiles::new(&self.abort.dir, &self.abort.prefix, machine_id);
        match arch {
            Some(arch) => files.with_arch(arch),
            None => files,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        parse_or(&self.busy_timeout, Duration::from_secs(5))
    }
}

impl TransportConfig {
    pub fn attempt_timeout(&self) -> Duration {
        parse_or(&self.attempt_timeout, Duration::from_secs(60))
    }

    pub fn command_timeout(&self) -> Duration {
        parse_or(&self.command_timeout, Duration::from_secs(600))
    }
}

impl WorkerConfig {
    pub fn health_interval(&self) -> Duration {
        parse_or(&self.health_interval, Duration::from_secs(300))
    }

    pub fn idle_backoff(&self) -> Duration {
        parse_or(&self.idle_backoff, Duration::from_secs(30))
    }

    pub fn reset_interval(&self) -> Option<Duration> {
        self.reset_interval.as_deref().and_then(crate::parse_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: TuneConfig = toml::from_str("").unwrap();
        assert_eq!(config.transport.connect_retries, 40);
        assert_eq!(config.transport.command_retries, 30);
        assert_eq!(config.worker.claim_num, 1);
        assert_eq!(config.abort.prefix, "miopen_abort");
        assert_eq!(config.transport.attempt_timeout(), Duration::from_secs(60));
        assert!(config.worker.reset_interval().is_none());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let toml_str = r#"
[worker]
session = 4
claim_num = 8
label = "nightly"
reset_interval = "24h"

[abort]
dir = "/run/tuna"
"#;
        let config: TuneConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker.session, 4);
        assert_eq!(config.worker.claim_num, 8);
        assert_eq!(config.worker.label.as_deref(), Some("nightly"));
        assert_eq!(config.worker.max_job_retries, 10);
        assert_eq!(config.worker.reset_interval(), Some(Duration::from_secs(86_400)));
        assert_eq!(config.abort.dir, PathBuf::from("/run/tuna"));
        assert_eq!(config.abort.prefix, "miopen_abort");
    }

    #[test]
    fn sentinel_paths_follow_config() {
        let config = TuneConfig::default();
        let files = config.sentinels(12, Some("gfx942"));
        assert_eq!(files.machine_path(), PathBuf::from("/tmp/miopen_abort_mid_12"));
        assert_eq!(files.arch_path(), Some(PathBuf::from("/tmp/miopen_abort_gfx942")));
    }

    #[test]
    fn from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.toml");
        std::fs::write(&path, "[store]\npath = \"/tmp/x.db\"\n").unwrap();
        let config = TuneConfig::from_file(&path).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/x.db"));
    }
}
