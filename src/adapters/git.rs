//! `BranchManager` over the git CLI.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::BranchManager;

#[derive(Debug, Clone, Default)]
pub struct GitCliBranchManager;

impl GitCliBranchManager {
    pub fn new() -> Self {
        Self
    }

    /// Run git in `dir`, returning stdout on success.
    async fn git(dir: &Path, args: &[&str]) -> DomainResult<String> {
        let output = Command::new("git")
            .current_dir(dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::Git(format!("failed to run git {}: {e}", args.join(" "))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(dir = %dir.display(), args = ?args, stderr = %stderr.trim(), "git command failed");
            return Err(DomainError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn branch_exists(repo: &Path, branch: &str) -> bool {
        Command::new("git")
            .current_dir(repo)
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

fn path_arg(path: &Path) -> DomainResult<&str> {
    path.to_str()
        .ok_or_else(|| DomainError::Git(format!("non-UTF-8 path: {}", path.display())))
}

#[async_trait]
impl BranchManager for GitCliBranchManager {
    async fn create_worktree(
        &self,
        repo: &Path,
        branch: &str,
        base: &str,
        path: &Path,
    ) -> DomainResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let target = path_arg(path)?;

        if Self::branch_exists(repo, branch).await {
            info!(branch, "Branch already exists, creating worktree from existing branch");
            Self::git(repo, &["worktree", "add", target, branch]).await?;
        } else {
            Self::git(repo, &["worktree", "add", "-b", branch, target, base]).await?;
        }
        info!(branch, path = %path.display(), "Worktree created");
        Ok(())
    }

    async fn remove_worktree(&self, repo: &Path, path: &Path) -> DomainResult<()> {
        if !path.exists() {
            let _ = Self::git(repo, &["worktree", "prune"]).await;
            return Ok(());
        }
        Self::git(repo, &["worktree", "remove", "--force", path_arg(path)?]).await?;
        debug!(path = %path.display(), "Worktree removed");
        Ok(())
    }

    async fn commit_all(&self, worktree: &Path, message: &str) -> DomainResult<bool> {
        Self::git(worktree, &["add", "-A"]).await?;
        let status = Self::git(worktree, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        Self::git(worktree, &["commit", "-m", message]).await?;
        info!(worktree = %worktree.display(), "Committed outstanding changes");
        Ok(true)
    }

    async fn commits_ahead(&self, repo: &Path, branch: &str, base: &str) -> DomainResult<u32> {
        let range = format!("{base}..{branch}");
        let out = Self::git(repo, &["rev-list", "--count", &range]).await?;
        out.trim()
            .parse()
            .map_err(|e| DomainError::Git(format!("unexpected rev-list output {out:?}: {e}")))
    }

    async fn diff(&self, repo: &Path, branch: &str, base: &str) -> DomainResult<String> {
        let range = format!("{base}...{branch}");
        Self::git(repo, &["diff", &range]).await
    }

    async fn merge(&self, repo: &Path, branch: &str, base: &str) -> DomainResult<()> {
        Self::git(repo, &["checkout", base]).await?;
        if let Err(e) = Self::git(repo, &["merge", "--no-ff", "--no-edit", branch]).await {
            warn!(branch, base, error = %e, "Merge failed, aborting");
            let _ = Self::git(repo, &["merge", "--abort"]).await;
            return Err(e);
        }
        info!(branch, base, "Branch merged");
        Ok(())
    }

    async fn push(&self, repo: &Path, branch: &str) -> DomainResult<()> {
        Self::git(repo, &["push", "origin", branch]).await?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> DomainResult<()> {
        Self::git(repo, &["branch", "-D", branch]).await?;
        Ok(())
    }

    async fn changed_files(&self, repo: &Path, branch: &str, base: &str)
        -> DomainResult<Vec<String>> {
        let range = format!("{base}...{branch}");
        let out = Self::git(repo, &["diff", "--name-only", &range]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
