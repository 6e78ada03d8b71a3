//! Local and SSH command execution with retry.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openssh::{KnownHosts, Session, SessionBuilder};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, error, info, warn};
use tune_core::AbortCheck;
use tune_core::backoff::jitter;
use tune_core::config::TransportConfig;

use crate::command::{binary_of, split_subcommands};
use crate::error::{TransportError, TransportResult};

/// Number of trailing output lines reported as `stderr`.
const STDERR_TAIL_LINES: usize = 5;

/// Retry ceilings and timeouts for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub connect_retries: u32,
    pub command_retries: u32,
    /// Per connection attempt; also bounds the sleep between attempts.
    pub attempt_timeout: Duration,
    /// Default idle time allowed between output lines.
    pub command_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            connect_retries: config.connect_retries,
            command_retries: config.command_retries,
            attempt_timeout: config.attempt_timeout(),
            command_timeout: config.command_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

/// Where and as whom to open the SSH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub keyfile: Option<PathBuf>,
}

/// Collected result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Every output line, stderr merged in.
    pub stdout: String,
    /// The last few output lines, for error reports.
    pub stderr: String,
    /// The read loop gave up waiting for the next line.
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

enum Backend {
    Local {
        shell: PathBuf,
    },
    Remote {
        endpoint: RemoteEndpoint,
        session: Option<Session>,
    },
}

/// A command transport bound to one machine, owned by one OS process.
///
/// Both backends share one command loop: abort check, (re)connect, run.
/// An I/O failure while spawning, reading, or reaping the command drops
/// the SSH session and retries up to the policy's command ceiling.
pub struct Connection {
    machine_id: i64,
    backend: Backend,
    /// Lookup results, seeded with the shell builtins commands lean on.
    installed: HashMap<String, bool>,
    abort: Arc<dyn AbortCheck>,
    policy: RetryPolicy,
}

impl Connection {
    /// Run commands as local subprocesses.
    pub fn local(machine_id: i64, abort: Arc<dyn AbortCheck>, policy: RetryPolicy) -> Self {
        let backend = Backend::Local {
            shell: PathBuf::from("sh"),
        };
        Self::with_backend(machine_id, backend, abort, policy)
    }

    /// Run commands over SSH. No session is opened until first use.
    pub fn remote(
        machine_id: i64,
        endpoint: RemoteEndpoint,
        abort: Arc<dyn AbortCheck>,
        policy: RetryPolicy,
    ) -> Self {
        let backend = Backend::Remote {
            endpoint,
            session: None,
        };
        Self::with_backend(machine_id, backend, abort, policy)
    }

    fn with_backend(
        machine_id: i64,
        backend: Backend,
        abort: Arc<dyn AbortCheck>,
        policy: RetryPolicy,
    ) -> Self {
        let installed = [("which", true), ("cd", true)]
            .into_iter()
            .map(|(bin, ok)| (bin.to_string(), ok))
            .collect();
        Self {
            machine_id,
            backend,
            installed,
            abort,
            policy,
        }
    }

    pub fn machine_id(&self) -> i64 {
        self.machine_id
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local { .. })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether the transport can take a command right now.
    pub async fn is_alive(&self) -> bool {
        match &self.backend {
            Backend::Local { .. } => true,
            Backend::Remote { session, .. } => match session {
                Some(session) => session.check().await.is_ok(),
                None => false,
            },
        }
    }

    /// Open the SSH session if it is missing or dead. A no-op for local.
    ///
    /// With `allow_abort`, the sentinels are polled before every attempt and
    /// a hit ends the loop with [`TransportError::Aborted`].
    pub async fn connect(&mut self, allow_abort: bool) -> TransportResult<()> {
        let machine_id = self.machine_id;
        let Backend::Remote { endpoint, session } = &mut self.backend else {
            return Ok(());
        };
        if let Some(existing) = session.as_ref() {
            if existing.check().await.is_ok() {
                return Ok(());
            }
            debug!(machine_id, "cached ssh session is dead, reconnecting");
            *session = None;
        }

        let mut builder = SessionBuilder::default();
        builder
            .user(endpoint.user.clone())
            .port(endpoint.port)
            .connect_timeout(self.policy.attempt_timeout)
            .known_hosts_check(KnownHosts::Add);
        if let Some(key) = &endpoint.keyfile {
            builder.keyfile(key);
        }

        let retries = self.policy.connect_retries;
        for attempt in 0..retries {
            if allow_abort {
                if let Some(reason) = self.abort.check() {
                    warn!(machine_id, %reason, "ssh connection aborted");
                    return Err(TransportError::Aborted(reason));
                }
            }

            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, builder.connect(&endpoint.hostname))
                    .await;
            match outcome {
                Ok(Ok(opened)) => {
                    info!(machine_id, hostname = %endpoint.hostname, "ssh connection established");
                    *session = Some(opened);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        machine_id,
                        hostname = %endpoint.hostname,
                        port = endpoint.port,
                        attempt,
                        error = %e,
                        "ssh connect failed"
                    );
                }
                Err(_) => {
                    warn!(machine_id, hostname = %endpoint.hostname, attempt, "ssh connect timed out");
                }
            }

            if attempt + 1 < retries {
                let pause = jitter(self.policy.attempt_timeout);
                debug!(machine_id, pause_ms = pause.as_millis() as u64, "sleeping before reconnect");
                tokio::time::sleep(pause).await;
            }
        }

        error!(machine_id, hostname = %endpoint.hostname, retries, "ssh retries exhausted");
        Err(TransportError::Connectivity {
            machine_id,
            message: format!("ssh retries exhausted for {}", endpoint.hostname),
        })
    }

    /// Whether `binary` resolves on the target, judged by the exit status of
    /// `command -v`. Answers are cached.
    pub async fn check_binary(&mut self, binary: &str, allow_abort: bool) -> TransportResult<bool> {
        if let Some(&known) = self.installed.get(binary) {
            return Ok(known);
        }
        let output = self
            .run(&format!("command -v {binary}"), self.policy.attempt_timeout, allow_abort, |_| {})
            .await?;
        let found = output.success();
        self.installed.insert(binary.to_string(), found);
        Ok(found)
    }

    /// Fail with [`TransportError::Precondition`] if any sub-command's
    /// binary is missing.
    pub async fn test_cmd_str(&mut self, cmd: &str, allow_abort: bool) -> TransportResult<()> {
        for sub in split_subcommands(cmd) {
            let Some(binary) = binary_of(sub) else {
                continue;
            };
            if !self.check_binary(binary, allow_abort).await? {
                error!(machine_id = self.machine_id, binary, command = cmd, "cannot find binary");
                return Err(TransportError::Precondition {
                    machine_id: self.machine_id,
                    binary: binary.to_string(),
                    command: cmd.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Run `cmd`, logging each output line.
    ///
    /// `timeout` is the idle limit between lines (default: the policy's
    /// command timeout). Hitting it ends the read with exit code 1.
    pub async fn execute(
        &mut self,
        cmd: &str,
        timeout: Option<Duration>,
        allow_abort: bool,
    ) -> TransportResult<CommandOutput> {
        let machine_id = self.machine_id;
        self.execute_with(cmd, timeout, allow_abort, move |line| {
            info!(machine_id, "{line}");
        })
        .await
    }

    /// Run `cmd`, handing every output line to `on_line`.
    pub async fn execute_with<F>(
        &mut self,
        cmd: &str,
        timeout: Option<Duration>,
        allow_abort: bool,
        on_line: F,
    ) -> TransportResult<CommandOutput>
    where
        F: FnMut(&str) + Send,
    {
        self.test_cmd_str(cmd, allow_abort).await?;
        let idle = timeout.unwrap_or(self.policy.command_timeout);
        self.run(cmd, idle, allow_abort, on_line).await
    }

    async fn run<F>(
        &mut self,
        cmd: &str,
        idle: Duration,
        allow_abort: bool,
        mut on_line: F,
    ) -> TransportResult<CommandOutput>
    where
        F: FnMut(&str) + Send,
    {
        let machine_id = self.machine_id;
        let wrapped = format!("exec 2>&1; {cmd}");

        let retries = self.policy.command_retries.max(1);
        for attempt in 0..retries {
            if allow_abort {
                if let Some(reason) = self.abort.check() {
                    warn!(machine_id, command = cmd, %reason, "command aborted");
                    return Err(TransportError::Aborted(reason));
                }
            }

            self.connect(allow_abort).await?;
            match self.attempt(&wrapped, idle, &mut on_line).await {
                Ok(output) => {
                    if output.timed_out {
                        warn!(machine_id, command = cmd, "read ended early");
                    }
                    return Ok(output);
                }
                Err(e) => {
                    warn!(machine_id, command = cmd, attempt, error = %e, "failed to execute command, retrying");
                    if let Backend::Remote { session, .. } = &mut self.backend {
                        *session = None;
                    }
                    if attempt + 1 < retries {
                        tokio::time::sleep(jitter(self.policy.attempt_timeout)).await;
                    }
                }
            }
        }

        error!(machine_id, command = cmd, retries, "command retries exhausted");
        Err(TransportError::Connectivity {
            machine_id,
            message: format!("command retries exhausted: {cmd}"),
        })
    }

    /// One spawn, read, and reap. An idle timeout is a soft EOF with exit
    /// code 1; any I/O error is returned for the caller to retry.
    async fn attempt<F>(&self, wrapped: &str, idle: Duration, on_line: &mut F) -> io::Result<CommandOutput>
    where
        F: FnMut(&str) + Send,
    {
        match &self.backend {
            Backend::Local { shell } => {
                let mut child = tokio::process::Command::new(shell)
                    .arg("-c")
                    .arg(wrapped)
                    .stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| io::Error::other("stdout not captured"))?;
                let read = read_lines(stdout, idle, on_line).await?;
                let exit_code = if read.timed_out {
                    let _ = child.start_kill();
                    1
                } else {
                    child.wait().await?.code().unwrap_or(-1)
                };
                Ok(read.into_output(exit_code))
            }
            Backend::Remote {
                session: Some(session),
                ..
            } => {
                let mut child = session
                    .raw_command(wrapped)
                    .stdin(openssh::Stdio::null())
                    .stdout(openssh::Stdio::piped())
                    .stderr(openssh::Stdio::null())
                    .spawn()
                    .await
                    .map_err(io::Error::other)?;
                let stdout = child
                    .stdout()
                    .take()
                    .ok_or_else(|| io::Error::other("stdout not captured"))?;
                let read = read_lines(stdout, idle, on_line).await?;
                let exit_code = if read.timed_out {
                    1
                } else {
                    child.wait().await.map_err(io::Error::other)?.code().unwrap_or(-1)
                };
                Ok(read.into_output(exit_code))
            }
            Backend::Remote { session: None, .. } => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "no ssh session"))
            }
        }
    }
}

struct ReadBack {
    lines: Vec<String>,
    timed_out: bool,
}

impl ReadBack {
    fn into_output(self, exit_code: i32) -> CommandOutput {
        let tail_from = self.lines.len().saturating_sub(STDERR_TAIL_LINES);
        let stderr = self.lines[tail_from..]
            .iter()
            .map(|l| format!("{l}\n"))
            .collect();
        let stdout = self.lines.iter().map(|l| format!("{l}\n")).collect();
        CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out: self.timed_out,
        }
    }
}

/// Read until EOF or until `idle` passes without a new line. Bytes that are
/// not UTF-8 are replaced, not treated as a stream failure.
async fn read_lines<R, F>(reader: R, idle: Duration, on_line: &mut F) -> io::Result<ReadBack>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut read = ReadBack {
        lines: Vec::new(),
        timed_out: false,
    };
    loop {
        buf.clear();
        match tokio::time::timeout(idle, reader.read_until(b'\n', &mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                on_line(line.trim_end());
                read.lines.push(line.to_string());
            }
            Ok(Err(e)) => {
                warn!(error = %e, "output stream error");
                return Err(e);
            }
            Err(_) => {
                warn!(idle_ms = idle.as_millis() as u64, "timed out waiting for output");
                read.timed_out = true;
                break;
            }
        }
    }
    Ok(read)
}
