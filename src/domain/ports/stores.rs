//! Durable-state ports: persisted orchestrator state, heartbeats, active
//! task directories and archived sessions.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    AgentResult, AgentSession, HeartbeatRecord, PersistedOrchestratorState, TaskAssignment,
};

/// Per-project orchestrator snapshot storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, project_id: &str) -> DomainResult<Option<PersistedOrchestratorState>>;

    async fn save(&self, project_id: &str, state: &PersistedOrchestratorState) -> DomainResult<()>;

    /// Delete the snapshot; a missing snapshot is not an error.
    async fn clear(&self, project_id: &str) -> DomainResult<()>;
}

/// Heartbeat storage; the core treats the format as opaque.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn write(&self, project_id: &str, task_id: &str, record: &HeartbeatRecord)
        -> DomainResult<()>;

    async fn read(&self, project_id: &str, task_id: &str) -> DomainResult<Option<HeartbeatRecord>>;

    async fn delete(&self, project_id: &str, task_id: &str) -> DomainResult<()>;
}

/// Archive of immutable per-attempt session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &AgentSession) -> DomainResult<()>;

    /// Most recent sessions for a project, newest first.
    async fn recent(&self, project_id: &str, limit: usize) -> DomainResult<Vec<AgentSession>>;

    async fn list_for_task(&self, project_id: &str, task_id: &str)
        -> DomainResult<Vec<AgentSession>>;
}

/// Per-task working files: prompt, output log, result file and assignment record.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    fn prompt_path(&self, project_id: &str, task_id: &str) -> PathBuf;

    fn output_log_path(&self, project_id: &str, task_id: &str) -> PathBuf;

    fn result_path(&self, project_id: &str, task_id: &str) -> PathBuf;

    /// Write the prompt file, creating the task directory as needed.
    async fn write_prompt(&self, project_id: &str, task_id: &str, prompt: &str)
        -> DomainResult<PathBuf>;

    async fn write_assignment(&self, assignment: &TaskAssignment) -> DomainResult<()>;

    async fn read_assignment(&self, project_id: &str, task_id: &str)
        -> DomainResult<Option<TaskAssignment>>;

    /// The result file the agent left behind, if any.
    async fn read_result(&self, project_id: &str, task_id: &str) -> DomainResult<Option<AgentResult>>;

    /// Remove a stale result file before a new attempt starts.
    async fn clear_result(&self, project_id: &str, task_id: &str) -> DomainResult<()>;
}
