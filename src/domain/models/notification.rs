//! Outbound notifications consumed by the presentation layer.
//!
//! Plain data only; nothing here renders or formats for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    TaskStarted {
        project_id: String,
        task_id: String,
        phase: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    OutputChunk {
        project_id: String,
        task_id: String,
        chunk: String,
    },
    TaskCompleted {
        project_id: String,
        task_id: String,
        phase: String,
        exit_code: Option<i32>,
        at: DateTime<Utc>,
    },
    TaskStatusChanged {
        project_id: String,
        task_id: String,
        status: TaskStatus,
        reason: Option<String>,
    },
}

impl Notification {
    pub fn task_id(&self) -> &str {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::OutputChunk { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskStatusChanged { task_id, .. } => task_id,
        }
    }
}
