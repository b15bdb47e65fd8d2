//! Archival record of a single agent attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Succeeded,
    Failed,
    TimedOut,
    Crashed,
}

/// Pass/fail counts from a scoped test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
    #[serde(default)]
    pub output: String,
}

impl TestResults {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// One immutable record per attempt, created at completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub project_id: String,
    pub task_id: String,
    /// The task's cumulative attempt number, unique across steps and restarts.
    pub attempt: u32,
    pub agent_type: String,
    pub agent_model: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub output_log: String,
    /// Size of the output log before archival truncation.
    #[serde(default)]
    pub output_log_bytes: usize,
    pub git_branch: Option<String>,
    pub git_diff: Option<String>,
    #[serde(default)]
    pub git_diff_bytes: usize,
    pub test_results: Option<TestResults>,
    pub failure_reason: Option<String>,
    pub summary: Option<String>,
}

impl AgentSession {
    /// Stable key used for storage: `<task>-<attempt>`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.task_id, self.attempt)
    }

    /// Larger of the untruncated log and diff sizes.
    ///
    /// Records written before sizes were tracked fall back to what was stored.
    pub fn original_size(&self) -> usize {
        let log = self.output_log_bytes.max(self.output_log.len());
        let diff = self
            .git_diff_bytes
            .max(self.git_diff.as_ref().map_or(0, String::len));
        log.max(diff)
    }
}
