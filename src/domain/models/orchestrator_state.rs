//! Durable per-project snapshot used for crash recovery.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Running counters carried across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
}

/// Snapshot written on every phase transition.
///
/// Deleted once the active task reaches a terminal state. After a restart
/// this is the only thing recovery trusts besides the heartbeat file and a
/// live OS check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PersistedOrchestratorState {
    pub current_task_id: Option<String>,
    /// Workflow step id of the running phase.
    pub current_phase: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub agent_pid: Option<u32>,
    #[serde(default)]
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
    pub last_output_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queue_depth: usize,
    #[serde(default)]
    pub totals: Totals,
}

impl PersistedOrchestratorState {
    pub fn has_active_task(&self) -> bool {
        self.current_task_id.is_some()
    }
}
