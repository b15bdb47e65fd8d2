//! Workflow definitions and per-task execution state.
//!
//! A `WorkflowDefinition` is a DAG of steps. Each step names the agent role
//! that executes it and the steps it depends on. The shipped default is the
//! linear `code -> review -> merge` pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which kind of agent (or in-process action) executes a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Writes code in the task worktree.
    Coder,
    /// Reviews the branch and writes a verdict to the result file.
    Reviewer,
    /// Merges the branch; runs in-process, no agent is spawned.
    Merger,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Merger => "merger",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What must hold for a finished step to count as successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCondition {
    /// The agent process exited with code 0.
    #[default]
    ExitZero,
    /// Exit code 0 and the scoped test suite passes.
    TestsPass,
    /// Exit code 0 and the result file records an approval.
    Approved,
}

/// Retry policy for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Switch to the escalation model on retries.
    #[serde(default)]
    pub escalate_model: bool,
}

const fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            escalate_model: false,
        }
    }
}

/// A single node of the workflow DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub agent_role: AgentRole,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub success_condition: SuccessCondition,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_role: role,
            depends_on: Vec::new(),
            success_condition: SuccessCondition::default(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_success(mut self, condition: SuccessCondition) -> Self {
        self.success_condition = condition;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// A declarative workflow: id, name, version and the step DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub steps: Vec<WorkflowStep>,
}

const fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// The built-in linear pipeline: code -> review -> merge.
    pub fn default_pipeline() -> Self {
        Self {
            id: "default".to_string(),
            name: "Code, review, merge".to_string(),
            version: 1,
            steps: vec![
                WorkflowStep::new("code", AgentRole::Coder)
                    .with_success(SuccessCondition::TestsPass)
                    .with_retry(RetryPolicy {
                        max_attempts: 3,
                        escalate_model: true,
                    }),
                WorkflowStep::new("review", AgentRole::Reviewer)
                    .depends_on(["code"])
                    .with_success(SuccessCondition::Approved),
                WorkflowStep::new("merge", AgentRole::Merger)
                    .depends_on(["review"])
                    .with_retry(RetryPolicy {
                        max_attempts: 1,
                        escalate_model: false,
                    }),
            ],
        }
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// First step executed by the given role, if any.
    pub fn step_for_role(&self, role: AgentRole) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.agent_role == role)
    }
}

/// Status of one step within a task's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Completed or skipped: the step no longer blocks completion.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Mutable execution state of one task walking a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionState {
    pub workflow_id: String,
    pub task_id: String,
    pub step_states: BTreeMap<String, StepStatus>,
    pub current_step_id: Option<String>,
}

impl WorkflowExecutionState {
    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_states.get(step_id).copied()
    }

    pub fn set_status(&mut self, step_id: &str, status: StepStatus) {
        self.step_states.insert(step_id.to_string(), status);
    }

    /// Mark a step in progress and make it the current step.
    pub fn start(&mut self, step_id: &str) {
        self.set_status(step_id, StepStatus::InProgress);
        self.current_step_id = Some(step_id.to_string());
    }
}
