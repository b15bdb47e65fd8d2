//! Integration tests for wiring the supervisor from configuration.

mod common;

use std::sync::Arc;

use chrono::Utc;

use common::{InMemoryTracker, PROJECT};
use shepherd::adapters::JsonStateStore;
use shepherd::domain::errors::DomainError;
use shepherd::domain::models::{Config, PersistedOrchestratorState, Task, TaskStatus};
use shepherd::domain::ports::StateStore;
use shepherd::services::supervisor::Supervisor;
use shepherd::services::RecoveryOutcome;

fn config_in(dir: &std::path::Path) -> Config {
    Config {
        state_dir: dir.join("state"),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_builds_from_default_config_and_registers_projects() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(InMemoryTracker::new());
    let supervisor = Supervisor::from_config(&config_in(dir.path()), tracker);

    assert_eq!(supervisor.layout().root(), dir.path().join("state"));
    assert!(supervisor.project_ids().is_empty());

    let first = supervisor.add_project(PROJECT, dir.path()).await.unwrap();
    let again = supervisor.add_project(PROJECT, dir.path()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.repo(), dir.path());

    supervisor.add_project("other", dir.path()).await.unwrap();
    assert_eq!(supervisor.project_ids(), vec!["other", PROJECT]);

    for bad in ["", "../escape", ".hidden"] {
        let err = supervisor.add_project(bad, dir.path()).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidProject(_)));
    }
}

#[tokio::test]
async fn test_reconcile_covers_every_registered_project() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(InMemoryTracker::new());
    let supervisor = Supervisor::from_config(&config_in(dir.path()), tracker);
    supervisor.add_project("alpha", dir.path()).await.unwrap();
    supervisor.add_project("beta", dir.path()).await.unwrap();

    let pass = supervisor.reconcile().await;

    assert!(pass.failures.is_empty());
    let ids: Vec<&str> = pass.reports.iter().map(|r| r.project_id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
    assert!(pass.reports.iter().all(|r| r.outcome == RecoveryOutcome::Fresh));
}

#[tokio::test]
async fn test_start_recovers_persisted_state_then_runs_watchdog() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let tracker = Arc::new(InMemoryTracker::new());
    let mut task = Task::new("T-1", PROJECT, "Finished elsewhere");
    task.status = TaskStatus::Done;
    tracker.add_task(task);

    let supervisor = Supervisor::from_config(&config, tracker.clone());
    JsonStateStore::new(supervisor.layout().clone())
        .save(
            PROJECT,
            &PersistedOrchestratorState {
                current_task_id: Some("T-1".to_string()),
                current_phase: Some("code".to_string()),
                branch_name: Some("shepherd/T-1".to_string()),
                worktree_path: None,
                agent_pid: None,
                attempt: 1,
                started_at: Some(Utc::now()),
                last_transition: Some(Utc::now()),
                last_output_timestamp: Some(Utc::now()),
                queue_depth: 0,
                totals: Default::default(),
            },
        )
        .await
        .unwrap();
    supervisor.add_project(PROJECT, dir.path()).await.unwrap();

    let reports = supervisor.start().await;

    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].as_ref().unwrap().outcome,
        RecoveryOutcome::Settled {
            task_id: "T-1".to_string(),
            status: TaskStatus::Done,
        }
    );
    assert_eq!(tracker.status("T-1"), Some(TaskStatus::Done));
    assert!(supervisor.watchdog().is_running());
    assert!(supervisor.stop());
    assert!(!supervisor.watchdog().is_running());
}
