//! On-disk records describing a running step: the assignment and the
//! agent's result file.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the agent CLI is launched for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub model: String,
}

/// Immutable record of one work item's execution context.
///
/// Written as `assignment.json` in the task's active directory when a step
/// starts; read back by the orphan scan after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub task_id: String,
    pub project_id: String,
    /// Workflow step id being executed.
    pub phase: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub prompt_path: PathBuf,
    pub agent_config: AgentConfig,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

/// Result file an agent writes before exiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub success: bool,
    /// Reviewer verdict; ignored for other roles.
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub summary: Option<String>,
}
