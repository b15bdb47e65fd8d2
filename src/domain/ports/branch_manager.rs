//! Branch / worktree manager port.

use std::path::Path;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Git operations the core relies on.
#[async_trait]
pub trait BranchManager: Send + Sync {
    /// Create a worktree at `path` on `branch`, cutting it from `base` when new.
    async fn create_worktree(
        &self,
        repo: &Path,
        branch: &str,
        base: &str,
        path: &Path,
    ) -> DomainResult<()>;

    /// Remove a worktree directory.
    async fn remove_worktree(&self, repo: &Path, path: &Path) -> DomainResult<()>;

    /// Commit every outstanding change in the worktree.
    ///
    /// Returns `false` when there was nothing to commit.
    async fn commit_all(&self, worktree: &Path, message: &str) -> DomainResult<bool>;

    /// Number of commits on `branch` not reachable from `base`.
    async fn commits_ahead(&self, repo: &Path, branch: &str, base: &str) -> DomainResult<u32>;

    /// Diff of `branch` against `base`.
    async fn diff(&self, repo: &Path, branch: &str, base: &str) -> DomainResult<String>;

    /// Merge `branch` into `base`.
    async fn merge(&self, repo: &Path, branch: &str, base: &str) -> DomainResult<()>;

    /// Push a branch to its remote.
    async fn push(&self, repo: &Path, branch: &str) -> DomainResult<()>;

    /// Delete a local branch.
    async fn delete_branch(&self, repo: &Path, branch: &str) -> DomainResult<()>;

    /// Files changed on `branch` relative to `base`.
    async fn changed_files(&self, repo: &Path, branch: &str, base: &str)
        -> DomainResult<Vec<String>>;
}
