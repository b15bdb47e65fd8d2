//! Adapters implementing the domain ports against the local machine.

pub mod fs;
pub mod git;
pub mod process;
pub mod settings;
pub mod test_runner;

pub use fs::{FsAssignmentStore, JsonHeartbeatStore, JsonSessionStore, JsonStateStore};
pub use git::GitCliBranchManager;
pub use process::{OsProcessProbe, OsProcessSpawner, PidHandle};
pub use settings::ConfigSettingsProvider;
pub use test_runner::CommandTestRunner;
