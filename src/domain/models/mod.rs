//! Domain models for the supervisor.

pub mod agent_session;
pub mod assignment;
pub mod config;
pub mod heartbeat;
pub mod notification;
pub mod orchestrator_state;
pub mod task;
pub mod workflow;

pub use agent_session::{AgentSession, SessionStatus, TestResults};
pub use assignment::{AgentConfig, AgentResult, TaskAssignment};
pub use config::{
    AgentProcessConfig, ArchiveConfig, Config, LoggingConfig, PipelineConfig, RecoveryConfig,
    WatchdogConfig,
};
pub use heartbeat::HeartbeatRecord;
pub use notification::Notification;
pub use orchestrator_state::{PersistedOrchestratorState, Totals};
pub use task::{branch_for_task, Task, TaskStatus, TaskUpdate};
pub use workflow::{
    AgentRole, RetryPolicy, StepStatus, SuccessCondition, WorkflowDefinition,
    WorkflowExecutionState, WorkflowStep,
};
