//! Shepherd - supervisor for coding-agent processes
//!
//! Shepherd drives one task at a time per project through a workflow of
//! agent steps, watches each agent process for exit or silence, and picks
//! up where it left off after its own process dies.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and port traits
//! - **Service Layer** (`services`): timers, workflow engine, agent
//!   lifecycle, crash recovery, watchdog, archival and the project pipeline
//! - **Adapters** (`adapters`): filesystem stores, git, OS processes
//! - **Infrastructure Layer** (`infrastructure`): configuration, logging
//!   and the state directory layout
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use shepherd::services::Supervisor;
//!
//! let supervisor = Supervisor::from_config(&config, tracker);
//! let pipeline = supervisor.add_project("web", &repo).await?;
//! supervisor.start().await;
//! pipeline.nudge().await?;
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    Config, PersistedOrchestratorState, Task, TaskStatus, WorkflowDefinition, WorkflowStep,
};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    AgentLifecycleManager, CrashRecovery, PipelineDeps, ProjectPipeline, SessionArchiver,
    Supervisor, TimerRegistry, Watchdog, WorkflowEngine,
};
