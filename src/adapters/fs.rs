//! JSON-file implementations of the durable-state ports.
//!
//! Every write goes to a temporary sibling and is renamed into place, so a
//! crash never leaves a half-written record behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    AgentResult, AgentSession, HeartbeatRecord, PersistedOrchestratorState, TaskAssignment,
};
use crate::domain::ports::{AssignmentStore, HeartbeatStore, SessionStore, StateStore};
use crate::infrastructure::layout::{
    StateLayout, ASSIGNMENT_FILE, HEARTBEAT_FILE, OUTPUT_LOG_FILE, PROMPT_FILE, RESULT_FILE,
};

/// Write `value` as pretty JSON via temp file + rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> DomainResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json).await
}

async fn write_atomic(path: &Path, contents: &[u8]) -> DomainResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a JSON record; a missing file is `None`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> DomainResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &Path) -> DomainResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `orchestrator-state.json` per project.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    layout: StateLayout,
}

impl JsonStateStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self, project_id: &str) -> DomainResult<Option<PersistedOrchestratorState>> {
        read_json(&self.layout.state_file(project_id)).await
    }

    async fn save(&self, project_id: &str, state: &PersistedOrchestratorState) -> DomainResult<()> {
        write_json_atomic(&self.layout.state_file(project_id), state).await
    }

    async fn clear(&self, project_id: &str) -> DomainResult<()> {
        remove_if_exists(&self.layout.state_file(project_id)).await
    }
}

/// `heartbeat.json` inside the task's active directory.
#[derive(Debug, Clone)]
pub struct JsonHeartbeatStore {
    layout: StateLayout,
}

impl JsonHeartbeatStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    fn path(&self, project_id: &str, task_id: &str) -> PathBuf {
        self.layout.task_dir(project_id, task_id).join(HEARTBEAT_FILE)
    }
}

#[async_trait]
impl HeartbeatStore for JsonHeartbeatStore {
    async fn write(&self, project_id: &str, task_id: &str, record: &HeartbeatRecord)
        -> DomainResult<()> {
        write_json_atomic(&self.path(project_id, task_id), record).await
    }

    async fn read(&self, project_id: &str, task_id: &str) -> DomainResult<Option<HeartbeatRecord>> {
        read_json(&self.path(project_id, task_id)).await
    }

    async fn delete(&self, project_id: &str, task_id: &str) -> DomainResult<()> {
        remove_if_exists(&self.path(project_id, task_id)).await
    }
}

/// Prompt, output log, result and assignment files in the active task directory.
#[derive(Debug, Clone)]
pub struct FsAssignmentStore {
    layout: StateLayout,
}

impl FsAssignmentStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl AssignmentStore for FsAssignmentStore {
    fn prompt_path(&self, project_id: &str, task_id: &str) -> PathBuf {
        self.layout.task_dir(project_id, task_id).join(PROMPT_FILE)
    }

    fn output_log_path(&self, project_id: &str, task_id: &str) -> PathBuf {
        self.layout.task_dir(project_id, task_id).join(OUTPUT_LOG_FILE)
    }

    fn result_path(&self, project_id: &str, task_id: &str) -> PathBuf {
        self.layout.task_dir(project_id, task_id).join(RESULT_FILE)
    }

    async fn write_prompt(&self, project_id: &str, task_id: &str, prompt: &str)
        -> DomainResult<PathBuf> {
        let path = self.prompt_path(project_id, task_id);
        write_atomic(&path, prompt.as_bytes()).await?;
        Ok(path)
    }

    async fn write_assignment(&self, assignment: &TaskAssignment) -> DomainResult<()> {
        let path = self
            .layout
            .task_dir(&assignment.project_id, &assignment.task_id)
            .join(ASSIGNMENT_FILE);
        write_json_atomic(&path, assignment).await
    }

    async fn read_assignment(&self, project_id: &str, task_id: &str)
        -> DomainResult<Option<TaskAssignment>> {
        read_json(&self.layout.task_dir(project_id, task_id).join(ASSIGNMENT_FILE)).await
    }

    async fn read_result(&self, project_id: &str, task_id: &str) -> DomainResult<Option<AgentResult>> {
        read_json(&self.result_path(project_id, task_id)).await
    }

    async fn clear_result(&self, project_id: &str, task_id: &str) -> DomainResult<()> {
        remove_if_exists(&self.result_path(project_id, task_id)).await
    }
}

/// One `<task>-<attempt>.json` per archived session.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    layout: StateLayout,
}

impl JsonSessionStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    async fn load_all(&self, project_id: &str) -> DomainResult<Vec<AgentSession>> {
        let dir = self.layout.sessions_dir(project_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<AgentSession>(&path).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session record"),
            }
        }
        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn save(&self, session: &AgentSession) -> DomainResult<()> {
        let path = self
            .layout
            .sessions_dir(&session.project_id)
            .join(format!("{}.json", session.key()));
        write_json_atomic(&path, session).await?;
        debug!(path = %path.display(), "Session saved");
        Ok(())
    }

    async fn recent(&self, project_id: &str, limit: usize) -> DomainResult<Vec<AgentSession>> {
        let mut sessions = self.load_all(project_id).await?;
        sessions.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn list_for_task(&self, project_id: &str, task_id: &str)
        -> DomainResult<Vec<AgentSession>> {
        let mut sessions: Vec<_> = self
            .load_all(project_id)
            .await?
            .into_iter()
            .filter(|s| s.task_id == task_id)
            .collect();
        sessions.sort_by_key(|s| s.attempt);
        Ok(sessions)
    }
}
