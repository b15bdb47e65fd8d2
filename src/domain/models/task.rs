//! Work items as seen through the issue tracker.

use serde::{Deserialize, Serialize};

/// Tracker-side status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue, unassigned.
    Open,
    /// Occupying a project's pipeline slot.
    InProgress,
    /// Merged and closed.
    Done,
    /// Gave up after exhausting retries.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work item read from the issue tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    /// Ids of tasks that must be closed before this one may start.
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Open,
            assignee: None,
            blocked_by: Vec::new(),
        }
    }

    /// Conventional branch name for a task.
    pub fn branch_name(&self) -> String {
        branch_for_task(&self.id)
    }
}

pub fn branch_for_task(task_id: &str) -> String {
    format!("shepherd/{task_id}")
}

/// Partial update applied through the issue tracker.
///
/// `assignee: Some(None)` clears the assignee; `None` leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub assignee: Option<Option<String>>,
}

impl TaskUpdate {
    /// Put the task back in the queue: open and unassigned.
    pub fn requeue() -> Self {
        Self {
            status: Some(TaskStatus::Open),
            assignee: Some(None),
        }
    }

    pub fn claim(agent: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::InProgress),
            assignee: Some(Some(agent.into())),
        }
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            assignee: None,
        }
    }
}
