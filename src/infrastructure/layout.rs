//! On-disk layout of the state directory.
//!
//! ```text
//! <state_dir>/<project>/
//!   orchestrator-state.json
//!   workflow.json                 optional override
//!   active/<task>/                prompt.md, output.log, result.json,
//!                                 assignment.json, heartbeat.json
//!   worktrees/<task>/             git worktree
//!   archive/<task>/attempt-<n>/   relocated prompt, output log, result
//!   sessions/<task>-<n>.json      archived session records
//! ```
//!
//! Directory names starting with [`RESERVED_PREFIX`] under `active/` and
//! `worktrees/` hold non-task slots and are never treated as tasks.

use std::path::{Path, PathBuf};

pub const RESERVED_PREFIX: char = '_';

pub const STATE_FILE: &str = "orchestrator-state.json";
pub const WORKFLOW_FILE: &str = "workflow.json";
pub const PROMPT_FILE: &str = "prompt.md";
pub const OUTPUT_LOG_FILE: &str = "output.log";
pub const RESULT_FILE: &str = "result.json";
pub const ASSIGNMENT_FILE: &str = "assignment.json";
pub const HEARTBEAT_FILE: &str = "heartbeat.json";

/// Whether a directory name is reserved for a non-task slot.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// Path helper rooted at the configured state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    pub fn state_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(STATE_FILE)
    }

    pub fn workflow_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(WORKFLOW_FILE)
    }

    pub fn active_root(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("active")
    }

    pub fn task_dir(&self, project_id: &str, task_id: &str) -> PathBuf {
        self.active_root(project_id).join(task_id)
    }

    pub fn worktrees_root(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("worktrees")
    }

    pub fn worktree_path(&self, project_id: &str, task_id: &str) -> PathBuf {
        self.worktrees_root(project_id).join(task_id)
    }

    pub fn archive_dir(&self, project_id: &str, task_id: &str, attempt: u32) -> PathBuf {
        self.project_dir(project_id)
            .join("archive")
            .join(task_id)
            .join(format!("attempt-{attempt}"))
    }

    pub fn sessions_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("sessions")
    }
}
