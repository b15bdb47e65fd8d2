//! Session archival.
//!
//! Every finished attempt becomes one immutable `AgentSession` record. Output
//! logs and diffs are truncated independently to a threshold derived from
//! recent record sizes, and the attempt's working files are moved out of the
//! active task directory into the archive before that directory is removed.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{AgentSession, ArchiveConfig};
use crate::domain::ports::{HeartbeatStore, SessionStore};
use crate::infrastructure::layout::{StateLayout, OUTPUT_LOG_FILE, PROMPT_FILE, RESULT_FILE};
use crate::services::output_log::{head_within, tail_within};

/// Nearest-rank percentile of `sizes`, clamped to `[min, max]`.
///
/// With no history the threshold is `max`.
pub fn percentile_threshold(sizes: &[usize], percentile: f64, min: usize, max: usize) -> usize {
    if sizes.is_empty() {
        return max;
    }
    let mut sorted = sizes.to_vec();
    sorted.sort_unstable();
    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index].clamp(min, max)
}

fn truncation_marker(dropped: usize) -> String {
    format!("[... truncated {dropped} bytes ...]")
}

/// Keep the end of an output log; the latest output explains the outcome.
pub fn truncate_log(log: &str, limit: usize) -> String {
    if log.len() <= limit {
        return log.to_string();
    }
    let kept = tail_within(log, limit);
    format!("{}\n{}", truncation_marker(log.len() - kept.len()), kept)
}

/// Keep the start of a diff so file headers survive.
pub fn truncate_diff(diff: &str, limit: usize) -> String {
    if diff.len() <= limit {
        return diff.to_string();
    }
    let kept = head_within(diff, limit);
    format!("{}\n{}", kept, truncation_marker(diff.len() - kept.len()))
}

pub struct SessionArchiver {
    sessions: Arc<dyn SessionStore>,
    heartbeats: Arc<dyn HeartbeatStore>,
    layout: StateLayout,
    config: ArchiveConfig,
}

impl SessionArchiver {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        heartbeats: Arc<dyn HeartbeatStore>,
        layout: StateLayout,
        config: ArchiveConfig,
    ) -> Self {
        Self {
            sessions,
            heartbeats,
            layout,
            config,
        }
    }

    /// Current truncation threshold for a project.
    pub async fn threshold(&self, project_id: &str) -> usize {
        let recent = match self
            .sessions
            .recent(project_id, self.config.recent_sample)
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                warn!(project_id, error = %e, "Could not read recent sessions");
                Vec::new()
            }
        };
        // Untruncated sizes, so a run of small sessions cannot pin the
        // threshold at the floor.
        let sizes: Vec<usize> = recent.iter().map(AgentSession::original_size).collect();
        percentile_threshold(
            &sizes,
            self.config.percentile,
            self.config.min_bytes,
            self.config.max_bytes,
        )
    }

    /// Persist one attempt and relocate its working files.
    ///
    /// Only the record save can fail; artifact relocation and cleanup are
    /// best-effort.
    #[instrument(skip_all, fields(project_id = %session.project_id, task_id = %session.task_id, attempt = session.attempt))]
    pub async fn archive(&self, mut session: AgentSession) -> DomainResult<AgentSession> {
        let limit = self.threshold(&session.project_id).await;
        session.output_log_bytes = session.output_log.len();
        session.git_diff_bytes = session.git_diff.as_ref().map_or(0, String::len);
        session.output_log = truncate_log(&session.output_log, limit);
        session.git_diff = session.git_diff.map(|diff| truncate_diff(&diff, limit));

        self.sessions.save(&session).await?;
        debug!(limit, "Session record saved");

        self.relocate_artifacts(&session.project_id, &session.task_id, session.attempt)
            .await;
        Ok(session)
    }

    /// Move prompt, output log and result file into the archive, then drop
    /// the active task directory with its heartbeat and assignment files.
    pub async fn relocate_artifacts(&self, project_id: &str, task_id: &str, attempt: u32) {
        let task_dir = self.layout.task_dir(project_id, task_id);
        let archive_dir = self.layout.archive_dir(project_id, task_id, attempt);

        if let Err(e) = tokio::fs::create_dir_all(&archive_dir).await {
            warn!(dir = %archive_dir.display(), error = %e, "Could not create archive directory");
        } else {
            for name in [PROMPT_FILE, OUTPUT_LOG_FILE, RESULT_FILE] {
                move_file(&task_dir.join(name), &archive_dir.join(name)).await;
            }
        }

        if let Err(e) = self.heartbeats.delete(project_id, task_id).await {
            debug!(task_id, error = %e, "Heartbeat cleanup failed");
        }

        match tokio::fs::remove_dir_all(&task_dir).await {
            Ok(()) => info!(task_id, archive = %archive_dir.display(), "Attempt archived"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %task_dir.display(), error = %e, "Could not remove task directory"),
        }
    }
}

async fn move_file(from: &Path, to: &Path) {
    match tokio::fs::rename(from, to).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) => {
            // Cross-device rename; fall back to copy.
            if let Err(e) = tokio::fs::copy(from, to).await {
                warn!(from = %from.display(), error = %e, "Failed to archive file");
                return;
            }
            let _ = tokio::fs::remove_file(from).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fs::{JsonHeartbeatStore, JsonSessionStore};
    use crate::domain::models::SessionStatus;
    use chrono::{Duration, Utc};

    fn archiver(root: &Path, recent_sample: usize) -> SessionArchiver {
        let layout = StateLayout::new(root);
        SessionArchiver::new(
            Arc::new(JsonSessionStore::new(layout.clone())),
            Arc::new(JsonHeartbeatStore::new(layout.clone())),
            layout,
            ArchiveConfig {
                recent_sample,
                percentile: 0.95,
                min_bytes: 10,
                max_bytes: 10_000,
            },
        )
    }

    fn session(attempt: u32, log_bytes: usize) -> AgentSession {
        let at = Utc::now() - Duration::minutes(60) + Duration::minutes(i64::from(attempt));
        AgentSession {
            project_id: "p".to_string(),
            task_id: "T-1".to_string(),
            attempt,
            agent_type: "coder".to_string(),
            agent_model: "sonnet".to_string(),
            started_at: at,
            completed_at: at,
            status: SessionStatus::Succeeded,
            output_log: "x".repeat(log_bytes),
            output_log_bytes: 0,
            git_branch: None,
            git_diff: None,
            git_diff_bytes: 0,
            test_results: None,
            failure_reason: None,
            summary: None,
        }
    }

    #[tokio::test]
    async fn test_large_session_raises_threshold_after_small_ones() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = archiver(dir.path(), 4);

        for attempt in 1..=4 {
            archiver.archive(session(attempt, 20)).await.unwrap();
        }
        assert_eq!(archiver.threshold("p").await, 20);

        let stored = archiver.archive(session(5, 1_000)).await.unwrap();
        assert!(stored.output_log.len() < 1_000);
        assert_eq!(stored.output_log_bytes, 1_000);

        // The stored record is truncated but its original size still counts.
        assert_eq!(archiver.threshold("p").await, 1_000);
        let next = archiver.archive(session(6, 1_000)).await.unwrap();
        assert_eq!(next.output_log.len(), 1_000);
    }

    #[tokio::test]
    async fn test_archive_relocates_artifacts_and_drops_task_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = archiver(dir.path(), 4);
        let layout = StateLayout::new(dir.path());
        let task_dir = layout.task_dir("p", "T-1");
        tokio::fs::create_dir_all(&task_dir).await.unwrap();
        tokio::fs::write(task_dir.join(OUTPUT_LOG_FILE), "line\n").await.unwrap();

        archiver.relocate_artifacts("p", "T-1", 3).await;

        assert!(!task_dir.exists());
        let archived = layout.archive_dir("p", "T-1", 3).join(OUTPUT_LOG_FILE);
        assert_eq!(tokio::fs::read_to_string(archived).await.unwrap(), "line\n");
    }

    #[test]
    fn test_threshold_without_history_is_max() {
        assert_eq!(percentile_threshold(&[], 0.95, 10, 1000), 1000);
    }

    #[test]
    fn test_threshold_p95_clamped() {
        let sizes: Vec<usize> = (1..=100).map(|i| i * 10).collect();
        assert_eq!(percentile_threshold(&sizes, 0.95, 0, usize::MAX), 950);
        assert_eq!(percentile_threshold(&sizes, 0.95, 0, 500), 500);
        assert_eq!(percentile_threshold(&[5, 6], 0.95, 64, 1000), 64);
        assert_eq!(percentile_threshold(&[700], 0.95, 64, 1000), 700);
    }

    #[test]
    fn test_truncate_log_keeps_tail() {
        let out = truncate_log("0123456789", 4);
        assert!(out.starts_with("[... truncated 6 bytes ...]"));
        assert!(out.ends_with("\n6789"));
        assert_eq!(truncate_log("short", 100), "short");
    }

    #[test]
    fn test_truncate_diff_keeps_head() {
        let out = truncate_diff("diff --git a/x b/x\n+line", 10);
        assert!(out.starts_with("diff --git"));
        assert!(out.ends_with("[... truncated 14 bytes ...]"));
    }
}
