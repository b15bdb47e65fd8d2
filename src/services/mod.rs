//! Core services: workflow resolution, agent supervision, recovery and
//! archival, plus the per-project driving loop that ties them together.

pub mod agent_lifecycle;
pub mod crash_recovery;
pub mod event_bus;
pub mod orphan_scan;
pub mod output_log;
pub mod pipeline;
pub mod session_archive;
pub mod supervisor;
pub mod timer_registry;
pub mod watchdog;
pub mod workflow_engine;

pub use agent_lifecycle::{AgentLifecycleManager, AgentRunState, CompletionLatch, RunParams};
pub use crash_recovery::{
    CrashRecovery, CrashRecoveryDeps, ReattachedAgent, RecoveryHost, RecoveryOutcome,
    RecoveryReport,
};
pub use event_bus::{BusEvent, EventBus, ProjectEvents};
pub use orphan_scan::{scan_orphans, OrphanRecord, OrphanSource};
pub use output_log::OutputLog;
pub use pipeline::{PipelineDeps, ProjectPipeline};
pub use session_archive::SessionArchiver;
pub use supervisor::Supervisor;
pub use timer_registry::TimerRegistry;
pub use watchdog::{ProjectRecovery, WatchTarget, Watchdog, WatchdogPass};
pub use workflow_engine::{load_workflow, WorkflowEngine};
