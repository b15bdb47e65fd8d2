use std::path::Path;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::TestResults;

/// Runs the test suite limited to a set of changed files.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_scoped(&self, worktree: &Path, files: &[String]) -> DomainResult<TestResults>;
}
