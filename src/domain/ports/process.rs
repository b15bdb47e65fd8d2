//! Process capability port.
//!
//! A `ProcessHandle` is the only thing the core knows about an agent
//! process: its pid, whether it is alive, and how to signal it. The OS
//! implementation lives in `adapters::process`; tests use `MockProcess`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::domain::errors::DomainResult;
use crate::domain::models::{AgentConfig, AgentRole};

/// Termination signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KillSignal {
    /// Graceful: SIGTERM.
    Terminate,
    /// Forceful: SIGKILL.
    Kill,
}

/// Capability over a running (or recently running) process.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> u32;

    /// OS-level liveness check.
    fn is_alive(&self) -> bool;

    /// Signal the process group first, then the pid itself.
    fn signal(&self, signal: KillSignal) -> DomainResult<()>;
}

/// Called with each output chunk (one line, newline stripped).
pub type OutputCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Called once the process exits, with its exit code when known.
pub type ExitCallback = Arc<dyn Fn(Option<i32>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callbacks injected into a spawner.
#[derive(Clone)]
pub struct SpawnCallbacks {
    pub on_output: OutputCallback,
    pub on_exit: ExitCallback,
}

impl fmt::Debug for SpawnCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnCallbacks").finish_non_exhaustive()
    }
}

/// Everything a spawner needs to launch one agent attempt.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub project_id: String,
    pub task_id: String,
    pub role: AgentRole,
    pub working_dir: PathBuf,
    pub prompt_path: PathBuf,
    /// File the spawner tees output into, so it can be tailed after a restart.
    pub output_log_path: PathBuf,
    pub agent_config: AgentConfig,
}

/// Launches agent processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        request: SpawnRequest,
        callbacks: SpawnCallbacks,
    ) -> DomainResult<Arc<dyn ProcessHandle>>;
}

/// Re-acquires a handle for a pid recorded before a restart.
pub trait ProcessProbe: Send + Sync {
    /// `None` when no live process has that pid.
    fn attach(&self, pid: u32) -> Option<Arc<dyn ProcessHandle>>;
}
