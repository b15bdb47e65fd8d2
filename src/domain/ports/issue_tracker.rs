//! Issue tracker port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskUpdate};

/// Interface to the external task store.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Get a task by id.
    async fn get_task(&self, task_id: &str) -> DomainResult<Option<Task>>;

    /// Open tasks for a project, in queue order.
    async fn list_open_tasks(&self, project_id: &str) -> DomainResult<Vec<Task>>;

    /// Apply a partial update (status and/or assignee).
    async fn update_task(&self, task_id: &str, update: TaskUpdate) -> DomainResult<()>;

    /// Close a task as done.
    async fn close_task(&self, task_id: &str, reason: &str) -> DomainResult<()>;

    /// Post a comment on a task.
    async fn add_comment(&self, task_id: &str, body: &str) -> DomainResult<()>;

    /// Whether every task blocking this one is closed.
    async fn blockers_closed(&self, task_id: &str) -> DomainResult<bool>;

    /// Bump and return the cumulative attempt counter.
    async fn increment_attempts(&self, task_id: &str) -> DomainResult<u32>;

    /// Current cumulative attempt counter.
    async fn cumulative_attempts(&self, task_id: &str) -> DomainResult<u32>;
}
