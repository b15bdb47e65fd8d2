//! Domain errors for the shepherd supervisor.

use std::fmt;

use thiserror::Error;

/// Format a cycle path as a human-readable string: `a -> b -> c -> a`.
fn format_cycle_path(path: &[String]) -> String {
    path.join(" -> ")
}

/// A single structural problem found while validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowIssue {
    /// The definition has no steps at all.
    NoSteps,
    /// Two or more steps share the same id.
    DuplicateStep(String),
    /// A step depends on an id that no step declares.
    UnknownDependency { step: String, dependency: String },
    /// The dependency graph contains a cycle; the path starts and ends on the same step.
    Cycle(Vec<String>),
}

impl fmt::Display for WorkflowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSteps => write!(f, "workflow has no steps"),
            Self::DuplicateStep(id) => write!(f, "duplicate step id '{id}'"),
            Self::UnknownDependency { step, dependency } => {
                write!(f, "step '{step}' depends on unknown step '{dependency}'")
            }
            Self::Cycle(path) => write!(f, "dependency cycle: {}", format_cycle_path(path)),
        }
    }
}

/// Structural validation failure carrying every detected issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowValidationError {
    pub workflow_id: String,
    pub issues: Vec<WorkflowIssue>,
}

impl fmt::Display for WorkflowValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let issues = self
            .issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "invalid workflow '{}': {}", self.workflow_id, issues)
    }
}

impl std::error::Error for WorkflowValidationError {}

impl WorkflowValidationError {
    /// Whether any of the issues is a dependency cycle.
    pub fn has_cycle(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| matches!(issue, WorkflowIssue::Cycle(_)))
    }
}

/// Domain-level errors that can occur in the supervisor.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    InvalidWorkflow(#[from] WorkflowValidationError),

    #[error("Invalid project id: '{0}'")]
    InvalidProject(String),

    #[error("Unknown workflow step: {0}")]
    UnknownStep(String),

    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    #[error("Process error for pid {pid}: {reason}")]
    Process { pid: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Issue tracker error: {0}")]
    Tracker(String),

    #[error("Recovery failed for project {project_id}: {reason}")]
    Recovery { project_id: String, reason: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_issue() {
        let err = WorkflowValidationError {
            workflow_id: "wf".to_string(),
            issues: vec![
                WorkflowIssue::DuplicateStep("code".to_string()),
                WorkflowIssue::UnknownDependency {
                    step: "review".to_string(),
                    dependency: "missing".to_string(),
                },
                WorkflowIssue::Cycle(vec!["a".into(), "b".into(), "a".into()]),
            ],
        };

        let message = err.to_string();
        assert!(message.contains("duplicate step id 'code'"));
        assert!(message.contains("unknown step 'missing'"));
        assert!(message.contains("a -> b -> a"));
        assert!(err.has_cycle());
    }

    #[test]
    fn test_invalid_workflow_is_transparent() {
        let err: DomainError = WorkflowValidationError {
            workflow_id: "wf".to_string(),
            issues: vec![WorkflowIssue::NoSteps],
        }
        .into();
        assert_eq!(err.to_string(), "invalid workflow 'wf': workflow has no steps");
    }
}
