//! Integration tests for the watchdog reconciler.

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use common::{wait_for, Harness, RecordingHost, PROJECT};
use shepherd::domain::errors::{DomainError, DomainResult};
use shepherd::services::watchdog::ListTargets;
use shepherd::services::{
    ProjectRecovery, RecoveryHost, RecoveryOutcome, RecoveryReport, TimerRegistry, WatchTarget,
    Watchdog,
};

/// Recovery double that fails for one project id and records every call.
struct FlakyRecovery {
    failing: String,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ProjectRecovery for FlakyRecovery {
    async fn recover_project(
        &self,
        project_id: &str,
        _repo: &Path,
        _host: Arc<dyn RecoveryHost>,
    ) -> DomainResult<RecoveryReport> {
        self.calls.lock().unwrap().push(project_id.to_string());
        if project_id == self.failing {
            return Err(DomainError::Recovery {
                project_id: project_id.to_string(),
                reason: "state file corrupt".to_string(),
            });
        }
        Ok(RecoveryReport {
            project_id: project_id.to_string(),
            outcome: RecoveryOutcome::Fresh,
            orphans_requeued: vec![],
        })
    }
}

fn targets(ids: &[&str]) -> ListTargets {
    let targets: Vec<WatchTarget> = ids
        .iter()
        .map(|id| WatchTarget {
            project_id: (*id).to_string(),
            repo_path: PathBuf::from("/repos").join(id),
            host: RecordingHost::new(),
        })
        .collect();
    Arc::new(move || {
        let targets = targets.clone();
        async move { targets }.boxed()
    })
}

fn flaky(failing: &str) -> Arc<FlakyRecovery> {
    Arc::new(FlakyRecovery {
        failing: failing.to_string(),
        calls: Mutex::new(Vec::new()),
    })
}

#[tokio::test]
async fn test_one_failing_project_does_not_block_others() {
    let recovery = flaky("b");
    let watchdog = Watchdog::new(
        recovery.clone(),
        targets(&["a", "b", "c"]),
        TimerRegistry::new(),
        Duration::from_secs(60),
    );

    let pass = watchdog.run_pass().await;

    assert_eq!(*recovery.calls.lock().unwrap(), vec!["a", "b", "c"]);
    let reconciled: Vec<&str> = pass.reports.iter().map(|r| r.project_id.as_str()).collect();
    assert_eq!(reconciled, vec!["a", "c"]);
    assert_eq!(pass.failures.len(), 1);
    assert_eq!(pass.failures[0].0, "b");
    assert!(pass.failures[0].1.contains("state file corrupt"));
}

#[tokio::test]
async fn test_start_is_idempotent_and_stop_reports_state() {
    let watchdog = Watchdog::new(
        flaky("none"),
        targets(&[]),
        TimerRegistry::new(),
        Duration::from_secs(60),
    );

    assert!(!watchdog.is_running());
    assert!(watchdog.start());
    assert!(!watchdog.start());
    assert!(watchdog.is_running());

    assert!(watchdog.stop());
    assert!(!watchdog.stop());
    assert!(!watchdog.is_running());
}

#[tokio::test]
async fn test_periodic_passes_run_until_stopped() {
    let recovery = flaky("none");
    let watchdog = Watchdog::new(
        recovery.clone(),
        targets(&["a"]),
        TimerRegistry::new(),
        Duration::from_millis(50),
    );

    watchdog.start();
    let ran = wait_for(|| recovery.calls.lock().unwrap().len() >= 2, 2_000).await;
    assert!(ran, "watchdog never ticked twice");
    watchdog.stop();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_stop = recovery.calls.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recovery.calls.lock().unwrap().len(), after_stop);
}

#[tokio::test]
async fn test_real_recovery_through_watchdog() {
    let h = Harness::new();
    let recovery = Arc::new(h.recovery());
    let watchdog = Watchdog::new(
        recovery,
        targets(&[PROJECT]),
        TimerRegistry::new(),
        Duration::from_secs(60),
    );

    let pass = watchdog.run_pass().await;
    assert!(pass.failures.is_empty());
    assert_eq!(pass.reports[0].outcome, RecoveryOutcome::Fresh);
}
