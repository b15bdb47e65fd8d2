//! CLI command implementations.

pub mod orphans;
pub mod state;
pub mod workflow;
