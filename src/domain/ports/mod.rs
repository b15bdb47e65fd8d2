//! Port trait definitions (Hexagonal Architecture)
//!
//! Every collaborator the core talks to is one of these traits, injected
//! explicitly. There is no global state behind them:
//! - IssueTracker: the external task store
//! - BranchManager: git worktrees, commits, merges
//! - TestRunner / SettingsProvider: scoped tests and per-project settings
//! - ProcessSpawner / ProcessProbe / ProcessHandle: agent processes
//! - StateStore / HeartbeatStore / AssignmentStore / SessionStore: durable state
//! - Notifier: outbound notifications

pub mod branch_manager;
pub mod issue_tracker;
pub mod notifier;
pub mod process;
pub mod settings;
pub mod stores;
pub mod test_runner;

pub use branch_manager::BranchManager;
pub use issue_tracker::IssueTracker;
pub use notifier::Notifier;
pub use process::{
    ExitCallback, KillSignal, OutputCallback, ProcessHandle, ProcessProbe, ProcessSpawner,
    SpawnCallbacks, SpawnRequest,
};
pub use settings::{PipelineSettings, SettingsProvider};
pub use stores::{AssignmentStore, HeartbeatStore, SessionStore, StateStore};
pub use test_runner::TestRunner;
