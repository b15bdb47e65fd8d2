//! Periodic reconciler.
//!
//! On every tick the watchdog asks for the live targets and runs a full
//! recovery pass on each. A failing target is logged and skipped; the rest
//! are still checked.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, info};

use crate::domain::errors::DomainResult;
use crate::services::crash_recovery::{CrashRecovery, RecoveryHost, RecoveryReport};
use crate::services::timer_registry::TimerRegistry;

pub const WATCHDOG_TIMER: &str = "watchdog";

/// A project the watchdog should reconcile.
#[derive(Clone)]
pub struct WatchTarget {
    pub project_id: String,
    pub repo_path: PathBuf,
    pub host: Arc<dyn RecoveryHost>,
}

impl std::fmt::Debug for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchTarget")
            .field("project_id", &self.project_id)
            .field("repo_path", &self.repo_path)
            .finish_non_exhaustive()
    }
}

/// Produces the current set of live targets.
pub type ListTargets = Arc<dyn Fn() -> BoxFuture<'static, Vec<WatchTarget>> + Send + Sync>;

/// One project's recovery pass.
#[async_trait]
pub trait ProjectRecovery: Send + Sync {
    async fn recover_project(
        &self,
        project_id: &str,
        repo: &Path,
        host: Arc<dyn RecoveryHost>,
    ) -> DomainResult<RecoveryReport>;
}

#[async_trait]
impl ProjectRecovery for CrashRecovery {
    async fn recover_project(
        &self,
        project_id: &str,
        repo: &Path,
        host: Arc<dyn RecoveryHost>,
    ) -> DomainResult<RecoveryReport> {
        CrashRecovery::recover_project(self, project_id, repo, host).await
    }
}

/// Summary of one watchdog pass.
#[derive(Debug, Default)]
pub struct WatchdogPass {
    pub reports: Vec<RecoveryReport>,
    /// `(project_id, error)` for every target whose recovery failed.
    pub failures: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Watchdog {
    recovery: Arc<dyn ProjectRecovery>,
    list_targets: ListTargets,
    timers: TimerRegistry,
    interval: Duration,
}

impl Watchdog {
    pub fn new(
        recovery: Arc<dyn ProjectRecovery>,
        list_targets: ListTargets,
        timers: TimerRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            recovery,
            list_targets,
            timers,
            interval,
        }
    }

    /// Start the periodic loop. Returns `false` when it was already running.
    pub fn start(&self) -> bool {
        if self.timers.has(WATCHDOG_TIMER) {
            debug!("Watchdog already running");
            return false;
        }
        let watchdog = self.clone();
        self.timers.set_interval(WATCHDOG_TIMER, self.interval, move || {
            let watchdog = watchdog.clone();
            async move {
                watchdog.run_pass().await;
            }
        });
        info!(interval_secs = self.interval.as_secs(), "Watchdog started");
        true
    }

    /// Stop the loop. Returns `false` when it was not running.
    pub fn stop(&self) -> bool {
        let stopped = self.timers.clear(WATCHDOG_TIMER);
        if stopped {
            info!("Watchdog stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.timers.has(WATCHDOG_TIMER)
    }

    /// Reconcile every live target once.
    pub async fn run_pass(&self) -> WatchdogPass {
        let targets = (self.list_targets)().await;
        let mut pass = WatchdogPass::default();

        for target in targets {
            match self
                .recovery
                .recover_project(&target.project_id, &target.repo_path, target.host)
                .await
            {
                Ok(report) => {
                    debug!(project_id = %target.project_id, outcome = ?report.outcome, "Project reconciled");
                    pass.reports.push(report);
                }
                Err(e) => {
                    error!(project_id = %target.project_id, error = %e, "Recovery pass failed");
                    pass.failures.push((target.project_id, e.to_string()));
                }
            }
        }
        pass
    }
}
