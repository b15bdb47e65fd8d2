//! OS process adapter.
//!
//! Agents run in their own process group so a terminate signal reaches any
//! children they start. Both stdout and stderr are redirected straight into
//! the task's output log file, so an agent keeps writing normally when the
//! supervisor dies. The supervisor follows that file and forwards each line to
//! the lifecycle callbacks.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{
    KillSignal, OutputCallback, ProcessHandle, ProcessProbe, ProcessSpawner, SpawnCallbacks,
    SpawnRequest,
};
use crate::infrastructure::log_tail::LogTail;

/// How often a running agent's output file is polled for new lines.
pub const DEFAULT_TAIL_INTERVAL: Duration = Duration::from_millis(200);

fn nix_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// `kill(pid, 0)`: the process exists, even if owned by someone else.
pub fn pid_alive(pid: u32) -> bool {
    let Some(pid) = nix_pid(pid) else {
        return false;
    };
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

/// Handle over an OS process identified by pid.
#[derive(Debug, Clone)]
pub struct PidHandle {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl PidHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with_exit_flag(pid: u32, exited: Arc<AtomicBool>) -> Self {
        Self { pid, exited }
    }
}

impl ProcessHandle for PidHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::Acquire) && pid_alive(self.pid)
    }

    fn signal(&self, signal: KillSignal) -> DomainResult<()> {
        let Some(pid) = nix_pid(self.pid) else {
            return Err(DomainError::Process {
                pid: self.pid,
                reason: "invalid pid".to_string(),
            });
        };
        let sig = match signal {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        };

        // Group first; a reattached process may not lead its own group.
        let group = killpg(pid, sig);
        let direct = kill(pid, sig);
        match (group, direct) {
            (Ok(()), _) | (_, Ok(()) | Err(Errno::ESRCH)) => {
                debug!(pid = self.pid, ?signal, "Signal sent");
                Ok(())
            }
            (_, Err(e)) => Err(DomainError::Process {
                pid: self.pid,
                reason: format!("failed to send {sig}: {e}"),
            }),
        }
    }
}

/// Spawns agent CLIs as OS processes.
#[derive(Debug, Clone)]
pub struct OsProcessSpawner {
    tail_interval: Duration,
}

impl Default for OsProcessSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl OsProcessSpawner {
    pub fn new() -> Self {
        Self {
            tail_interval: DEFAULT_TAIL_INTERVAL,
        }
    }

    pub fn with_tail_interval(mut self, interval: Duration) -> Self {
        self.tail_interval = interval.max(Duration::from_millis(10));
        self
    }

    fn command(request: &SpawnRequest, log: &std::fs::File) -> DomainResult<Command> {
        let config = &request.agent_config;
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        if !config.model.is_empty() {
            cmd.arg("--model").arg(&config.model);
        }
        cmd.arg(&request.prompt_path)
            .current_dir(&request.working_dir)
            .env("SHEPHERD_PROJECT_ID", &request.project_id)
            .env("SHEPHERD_TASK_ID", &request.task_id)
            .env("SHEPHERD_ROLE", request.role.as_str())
            .env("SHEPHERD_PROMPT_FILE", &request.prompt_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .process_group(0)
            // The agent must outlive a supervisor restart.
            .kill_on_drop(false);
        Ok(cmd)
    }
}

fn open_output_log(path: &Path) -> DomainResult<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(file)
}

async fn forward_new_lines(tail: &mut LogTail, path: &Path, on_output: &OutputCallback) {
    match tail.read_lines(path).await {
        Ok(lines) => lines.into_iter().for_each(|line| on_output(line)),
        Err(e) => debug!(path = %path.display(), error = %e, "Output log read failed"),
    }
}

impl ProcessSpawner for OsProcessSpawner {
    fn spawn(
        &self,
        request: SpawnRequest,
        callbacks: SpawnCallbacks,
    ) -> DomainResult<Arc<dyn ProcessHandle>> {
        let log_path = request.output_log_path.clone();
        let log = open_output_log(&log_path)?;
        let mut tail = LogTail::from_end(&log_path);

        let mut child = Self::command(&request, &log)?.spawn().map_err(|e| {
            DomainError::Spawn(format!("{}: {e}", request.agent_config.command))
        })?;
        // The child holds its own descriptors.
        drop(log);
        let pid = child
            .id()
            .ok_or_else(|| DomainError::Spawn("process exited before reporting a pid".to_string()))?;
        info!(pid, task_id = %request.task_id, command = %request.agent_config.command, "Agent process started");

        let exited = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(PidHandle::with_exit_flag(pid, Arc::clone(&exited)));
        let SpawnCallbacks { on_output, on_exit } = callbacks;
        let tail_interval = self.tail_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tail_interval);
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = ticker.tick() => forward_new_lines(&mut tail, &log_path, &on_output).await,
                }
            };
            forward_new_lines(&mut tail, &log_path, &on_output).await;
            if let Some(rest) = tail.take_partial() {
                on_output(rest);
            }
            exited.store(true, Ordering::Release);

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait for agent process");
                    None
                }
            };
            info!(pid, exit_code = ?code, "Agent process exited");
            on_exit(code).await;
        });

        Ok(handle)
    }
}

/// Reattaches to pids recorded before a restart.
#[derive(Debug, Clone, Default)]
pub struct OsProcessProbe;

impl OsProcessProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessProbe for OsProcessProbe {
    fn attach(&self, pid: u32) -> Option<Arc<dyn ProcessHandle>> {
        if pid_alive(pid) {
            Some(Arc::new(PidHandle::new(pid)))
        } else {
            None
        }
    }
}
