//! Runs the configured test command with the changed files appended.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::TestResults;
use crate::domain::ports::TestRunner;

#[derive(Debug, Clone, Default)]
pub struct CommandTestRunner {
    command: Option<String>,
}

impl CommandTestRunner {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }
}

/// Sum every `<n> passed` / `<n> failed` pair in a test runner's output.
///
/// Handles the cargo, pytest and jest summary styles.
pub fn parse_counts(output: &str) -> Option<(u32, u32)> {
    let mut passed = 0;
    let mut failed = 0;
    let mut found = false;
    let mut previous: Option<u32> = None;

    for word in output.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        if word.is_empty() {
            continue;
        }
        if let Ok(n) = word.parse::<u32>() {
            previous = Some(n);
            continue;
        }
        match (previous.take(), word) {
            (Some(n), "passed") => {
                passed += n;
                found = true;
            }
            (Some(n), "failed") => {
                failed += n;
                found = true;
            }
            _ => {}
        }
    }
    found.then_some((passed, failed))
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run_scoped(&self, worktree: &Path, files: &[String]) -> DomainResult<TestResults> {
        let Some(command) = &self.command else {
            debug!("No test command configured");
            return Ok(TestResults {
                output: "no test command configured".to_string(),
                ..TestResults::default()
            });
        };
        if files.is_empty() {
            return Ok(TestResults {
                output: "no changed files".to_string(),
                ..TestResults::default()
            });
        }

        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| DomainError::ExecutionFailed("empty test command".to_string()))?;
        let output = Command::new(program)
            .args(parts)
            .args(files)
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("failed to run {program}: {e}")))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let (passed, mut failed) = match parse_counts(&text) {
            Some(counts) => counts,
            None if output.status.success() => (1, 0),
            None => (0, 1),
        };
        if !output.status.success() && failed == 0 {
            failed = 1;
        }
        info!(
            worktree = %worktree.display(),
            files = files.len(),
            passed,
            failed,
            "Scoped tests finished"
        );
        Ok(TestResults {
            passed,
            failed,
            total: passed + failed,
            output: text,
        })
    }
}
