//! Crash recovery.
//!
//! After a supervisor restart (or on every watchdog pass) the persisted
//! orchestrator snapshot, the heartbeat file and an OS liveness check are
//! reconciled into exactly one of three outcomes:
//!
//! 1. nothing was running: clear the snapshot and start fresh
//! 2. the recorded agent is still alive: re-register it and poll it
//! 3. the agent is gone: advance past the coding step when its work is
//!    verifiably done, otherwise roll back and requeue the task
//!
//! Assignment records nobody owns any more are rolled back the same way.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    branch_for_task, AgentProcessConfig, AgentRole, AgentSession, Notification,
    PersistedOrchestratorState, RecoveryConfig, SessionStatus, Task, TaskStatus, TaskUpdate,
};
use crate::domain::ports::{
    AssignmentStore, BranchManager, HeartbeatStore, IssueTracker, KillSignal, Notifier,
    PipelineSettings, ProcessHandle, ProcessProbe, SettingsProvider, StateStore, TestRunner,
};
use crate::infrastructure::layout::StateLayout;
use crate::services::orphan_scan::scan_orphans;
use crate::services::session_archive::SessionArchiver;
use crate::services::timer_registry::TimerRegistry;
use crate::services::workflow_engine::load_workflow;

pub const RECOVERY_POLL_TIMER: &str = "recovery-poll";

/// The driving loop as seen by recovery.
///
/// `slotted_task_ids` and `active_agent_ids` let recovery tell a task that
/// is legitimately running from one whose owner was lost. The remaining
/// methods hand control back to the loop once recovery has decided.
#[async_trait]
pub trait RecoveryHost: Send + Sync {
    /// Tasks occupying the project's pipeline slot.
    fn slotted_task_ids(&self) -> HashSet<String>;

    /// Tasks with an agent this supervisor is monitoring.
    fn active_agent_ids(&self) -> HashSet<String>;

    /// Registry for the project's recovery-poll timer.
    fn timers(&self) -> TimerRegistry;

    /// Occupy the slot with a reattached agent and keep its output and
    /// heartbeat flowing while the recovery poll watches it.
    async fn register_active(&self, agent: ReattachedAgent);

    fn unregister_active(&self, task_id: &str);

    /// Resume the loop as if the given phase had just finished.
    async fn phase_done(&self, task: Task, phase: &str, exit_code: Option<i32>);

    /// Start the first step executed by `role`, skipping what came before.
    async fn advance_to(&self, task: Task, role: AgentRole);

    /// Give up on a task with a reason.
    async fn fail_task(&self, task_id: &str, reason: &str);
}

/// An agent that survived a supervisor restart.
#[derive(Debug, Clone)]
pub struct ReattachedAgent {
    pub task_id: String,
    /// Workflow step the agent was running.
    pub phase: String,
    pub attempt: u32,
    pub worktree: PathBuf,
    pub handle: Arc<dyn ProcessHandle>,
    /// Best-known time of its last output.
    pub last_output_at: DateTime<Utc>,
}

/// What a recovery pass decided for the persisted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No task was recorded as active.
    Fresh,
    /// The recorded task is owned by the running loop; nothing to do.
    AlreadyRunning { task_id: String },
    /// The agent survived the restart and is being polled.
    Resumed { task_id: String, pid: u32 },
    /// Finished coding work was verified; the task moved on to `role`.
    Advanced { task_id: String, role: AgentRole },
    /// The task was rolled back and put back in the queue.
    Requeued { task_id: String, commits_ahead: u32 },
    /// The task had already finished or failed; only leftovers were cleared.
    Settled { task_id: String, status: TaskStatus },
}

/// Result of one full recovery pass over a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub project_id: String,
    pub outcome: RecoveryOutcome,
    /// Orphaned assignments rolled back during the pass.
    pub orphans_requeued: Vec<String>,
}

/// Everything a rollback needs to know about the task being rolled back.
#[derive(Debug, Clone)]
struct RollbackTarget {
    task_id: String,
    phase: Option<String>,
    attempt: u32,
    branch: String,
    worktree: PathBuf,
    reason: String,
}

fn plural_commits(n: u32) -> String {
    if n == 1 {
        "1 commit".to_string()
    } else {
        format!("{n} commits")
    }
}

/// Signal the process group then the pid gracefully, wait out the grace
/// window, then kill whatever is left.
pub async fn escalate_kill(handle: &dyn ProcessHandle, grace: Duration) {
    let pid = handle.pid();
    if let Err(e) = handle.signal(KillSignal::Terminate) {
        warn!(pid, error = %e, "Terminate signal failed");
    }
    tokio::time::sleep(grace).await;
    if handle.is_alive() {
        warn!(pid, "Process survived terminate, killing");
        if let Err(e) = handle.signal(KillSignal::Kill) {
            warn!(pid, error = %e, "Kill signal failed");
        }
    }
}

pub struct CrashRecovery {
    state_store: Arc<dyn StateStore>,
    heartbeats: Arc<dyn HeartbeatStore>,
    assignments: Arc<dyn AssignmentStore>,
    tracker: Arc<dyn IssueTracker>,
    branches: Arc<dyn BranchManager>,
    tests: Arc<dyn TestRunner>,
    settings: Arc<dyn SettingsProvider>,
    probe: Arc<dyn ProcessProbe>,
    notifier: Arc<dyn Notifier>,
    archiver: Arc<SessionArchiver>,
    layout: StateLayout,
    agent_config: AgentProcessConfig,
    config: RecoveryConfig,
}

/// Collaborators for [`CrashRecovery`].
pub struct CrashRecoveryDeps {
    pub state_store: Arc<dyn StateStore>,
    pub heartbeats: Arc<dyn HeartbeatStore>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub tracker: Arc<dyn IssueTracker>,
    pub branches: Arc<dyn BranchManager>,
    pub tests: Arc<dyn TestRunner>,
    pub settings: Arc<dyn SettingsProvider>,
    pub probe: Arc<dyn ProcessProbe>,
    pub notifier: Arc<dyn Notifier>,
    pub archiver: Arc<SessionArchiver>,
}

impl CrashRecovery {
    pub fn new(
        deps: CrashRecoveryDeps,
        layout: StateLayout,
        agent_config: AgentProcessConfig,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            state_store: deps.state_store,
            heartbeats: deps.heartbeats,
            assignments: deps.assignments,
            tracker: deps.tracker,
            branches: deps.branches,
            tests: deps.tests,
            settings: deps.settings,
            probe: deps.probe,
            notifier: deps.notifier,
            archiver: deps.archiver,
            layout,
            agent_config,
            config,
        }
    }

    /// Full recovery pass: the persisted task, then any orphaned assignments.
    #[instrument(skip(self, repo, host), fields(repo = %repo.display()))]
    pub async fn recover_project(
        &self,
        project_id: &str,
        repo: &Path,
        host: Arc<dyn RecoveryHost>,
    ) -> DomainResult<RecoveryReport> {
        let persisted = self.state_store.load(project_id).await?;
        let slotted = host.slotted_task_ids();
        let active = host.active_agent_ids();

        let recorded_task = persisted
            .as_ref()
            .and_then(|p| p.current_task_id.clone());

        let outcome = match &recorded_task {
            Some(task_id) if slotted.contains(task_id) || active.contains(task_id) => {
                debug!(task_id = %task_id, "Recorded task is owned by the running loop");
                RecoveryOutcome::AlreadyRunning {
                    task_id: task_id.clone(),
                }
            }
            _ => {
                self.recover_from_persisted_state(project_id, repo, persisted, Arc::clone(&host))
                    .await?
            }
        };

        // Re-read: recovery above may have re-registered the recorded task.
        let mut tracked: HashSet<String> = host.slotted_task_ids();
        tracked.extend(host.active_agent_ids());
        if let Some(task_id) = recorded_task {
            tracked.insert(task_id);
        }

        let mut orphans_requeued = Vec::new();
        for orphan in scan_orphans(&self.layout, project_id, &tracked).await? {
            let assignment = orphan.assignment;
            info!(task_id = %assignment.task_id, phase = %assignment.phase, "Rolling back orphaned assignment");
            let target = RollbackTarget {
                task_id: assignment.task_id.clone(),
                phase: Some(assignment.phase.clone()),
                attempt: assignment.attempt,
                branch: assignment.branch_name.clone(),
                worktree: assignment.worktree_path.clone(),
                reason: "Found an orphaned assignment with no running agent".to_string(),
            };
            match self.rollback(project_id, repo, &target).await {
                Ok(Some(_)) => orphans_requeued.push(assignment.task_id),
                Ok(None) => {}
                Err(e) => {
                    error!(task_id = %assignment.task_id, error = %e, "Failed to roll back orphan")
                }
            }
        }

        Ok(RecoveryReport {
            project_id: project_id.to_string(),
            outcome,
            orphans_requeued,
        })
    }

    /// Reconcile one persisted snapshot.
    #[instrument(skip(self, repo, persisted, host), fields(repo = %repo.display()))]
    pub async fn recover_from_persisted_state(
        &self,
        project_id: &str,
        repo: &Path,
        persisted: Option<PersistedOrchestratorState>,
        host: Arc<dyn RecoveryHost>,
    ) -> DomainResult<RecoveryOutcome> {
        let Some(persisted) = persisted.filter(PersistedOrchestratorState::has_active_task) else {
            self.state_store.clear(project_id).await?;
            info!("No active task recorded, starting fresh");
            return Ok(RecoveryOutcome::Fresh);
        };

        if let Some(handle) = persisted.agent_pid.and_then(|pid| self.probe.attach(pid)) {
            if let Some(outcome) = self
                .handle_alive_pid(project_id, &persisted, handle, Arc::clone(&host))
                .await?
            {
                return Ok(outcome);
            }
        }

        self.perform_crash_recovery(project_id, repo, &persisted, host.as_ref())
            .await
    }

    /// Path 2: the recorded agent is still alive.
    ///
    /// Returns `None` when the agent had already been silent too long and
    /// was killed, so the caller falls through to crash recovery.
    #[instrument(skip_all, fields(pid = handle.pid()))]
    pub async fn handle_alive_pid(
        &self,
        project_id: &str,
        persisted: &PersistedOrchestratorState,
        handle: Arc<dyn ProcessHandle>,
        host: Arc<dyn RecoveryHost>,
    ) -> DomainResult<Option<RecoveryOutcome>> {
        let Some(task_id) = persisted.current_task_id.clone() else {
            return Ok(None);
        };
        let timeout = self.agent_config.inactivity_timeout();

        let heartbeat = self.heartbeats.read(project_id, &task_id).await.unwrap_or_else(|e| {
            debug!(error = %e, "Heartbeat unreadable");
            None
        });
        let last_output = heartbeat
            .map(|hb| hb.last_output_timestamp)
            .or(persisted.last_output_timestamp)
            .unwrap_or_else(Utc::now);
        let idle = (Utc::now() - last_output).to_std().unwrap_or(Duration::ZERO);

        if idle > timeout {
            warn!(task_id = %task_id, idle_secs = idle.as_secs(), "Surviving agent is inactive, killing");
            let worktree = self.worktree_for(project_id, &task_id, persisted);
            self.commit_safety_net(&worktree, "agent inactive after restart")
                .await;
            escalate_kill(handle.as_ref(), self.config.kill_grace()).await;
            return Ok(None);
        }

        let pid = handle.pid();
        let phase = persisted.current_phase.clone().unwrap_or_default();
        let worktree = self.worktree_for(project_id, &task_id, persisted);
        info!(task_id = %task_id, "Agent survived restart, resuming");
        host.register_active(ReattachedAgent {
            task_id: task_id.clone(),
            phase: phase.clone(),
            attempt: persisted.attempt,
            worktree: worktree.clone(),
            handle: Arc::clone(&handle),
            last_output_at: last_output,
        })
        .await;

        let poll = RecoveryPoll {
            project_id: project_id.to_string(),
            task_id: task_id.clone(),
            phase,
            worktree,
            last_output,
            handle,
            heartbeats: Arc::clone(&self.heartbeats),
            tracker: Arc::clone(&self.tracker),
            branches: Arc::clone(&self.branches),
            timers: host.timers(),
            timeout,
            grace: self.config.kill_grace(),
        };
        let poll = Arc::new(tokio::sync::Mutex::new(poll));
        let timers = host.timers();
        timers.set_interval(RECOVERY_POLL_TIMER, self.config.poll_interval(), move || {
            let poll = Arc::clone(&poll);
            let host = Arc::clone(&host);
            async move { poll.lock().await.tick(host.as_ref()).await }
        });

        Ok(Some(RecoveryOutcome::Resumed { task_id, pid }))
    }

    /// Path 3: the agent is gone.
    #[instrument(skip_all, fields(task_id = ?persisted.current_task_id))]
    pub async fn perform_crash_recovery(
        &self,
        project_id: &str,
        repo: &Path,
        persisted: &PersistedOrchestratorState,
        host: &dyn RecoveryHost,
    ) -> DomainResult<RecoveryOutcome> {
        let Some(task_id) = persisted.current_task_id.clone() else {
            self.state_store.clear(project_id).await?;
            return Ok(RecoveryOutcome::Fresh);
        };

        if let Some(status) = self.settled_status(&task_id).await {
            info!(task_id = %task_id, %status, "Recorded task already settled, clearing leftovers");
            self.state_store.clear(project_id).await?;
            self.archiver
                .relocate_artifacts(project_id, &task_id, persisted.attempt.max(1))
                .await;
            return Ok(RecoveryOutcome::Settled { task_id, status });
        }

        match self.try_advance_to_review(project_id, repo, persisted, host).await {
            Ok(Some(role)) => return Ok(RecoveryOutcome::Advanced { task_id, role }),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not check for finished work, rolling back"),
        }

        self.state_store.clear(project_id).await?;

        let target = RollbackTarget {
            task_id: task_id.clone(),
            phase: persisted.current_phase.clone(),
            attempt: persisted.attempt,
            branch: persisted
                .branch_name
                .clone()
                .unwrap_or_else(|| branch_for_task(&task_id)),
            worktree: self.worktree_for(project_id, &task_id, persisted),
            reason: "Supervisor restarted and the agent process was gone".to_string(),
        };
        match self.rollback(project_id, repo, &target).await? {
            Some(commits_ahead) => Ok(RecoveryOutcome::Requeued {
                task_id,
                commits_ahead,
            }),
            None => {
                let status = self
                    .settled_status(&task_id)
                    .await
                    .unwrap_or(TaskStatus::Failed);
                Ok(RecoveryOutcome::Settled { task_id, status })
            }
        }
    }

    /// Skip re-running a coding step whose work is already done.
    ///
    /// Applies when the interrupted step was a coder step, the agent left a
    /// successful result record, the branch carries commits and the scoped
    /// tests pass. Returns the role the task moved on to.
    pub async fn try_advance_to_review(
        &self,
        project_id: &str,
        repo: &Path,
        persisted: &PersistedOrchestratorState,
        host: &dyn RecoveryHost,
    ) -> DomainResult<Option<AgentRole>> {
        let (Some(task_id), Some(phase)) = (&persisted.current_task_id, &persisted.current_phase)
        else {
            return Ok(None);
        };

        let workflow = load_workflow(&self.layout.workflow_file(project_id)).await?;
        if workflow.step(phase).map(|s| s.agent_role) != Some(AgentRole::Coder) {
            return Ok(None);
        }

        match self.assignments.read_result(project_id, task_id).await? {
            Some(result) if result.success => {}
            _ => return Ok(None),
        }

        let settings = self.settings.pipeline_settings(project_id).await?;
        let branch = persisted
            .branch_name
            .clone()
            .unwrap_or_else(|| branch_for_task(task_id));
        let commits = self
            .branches
            .commits_ahead(repo, &branch, &settings.base_branch)
            .await?;
        if commits == 0 {
            return Ok(None);
        }

        let worktree = self.worktree_for(project_id, task_id, persisted);
        if !tokio::fs::try_exists(&worktree).await.unwrap_or(false) {
            return Ok(None);
        }
        let files = self
            .branches
            .changed_files(repo, &branch, &settings.base_branch)
            .await?;
        let results = self.tests.run_scoped(&worktree, &files).await?;
        if !results.success() {
            info!(task_id = %task_id, failed = results.failed, "Finished work fails its tests");
            return Ok(None);
        }

        let Some(task) = self.tracker.get_task(task_id).await? else {
            return Ok(None);
        };
        let role = if settings.review_required {
            AgentRole::Reviewer
        } else {
            AgentRole::Merger
        };
        info!(task_id = %task_id, commits, next = %role, "Coding work verified, skipping re-run");
        host.advance_to(task, role).await;
        Ok(Some(role))
    }

    fn worktree_for(
        &self,
        project_id: &str,
        task_id: &str,
        persisted: &PersistedOrchestratorState,
    ) -> PathBuf {
        persisted
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.layout.worktree_path(project_id, task_id))
    }

    /// Tracker status of a task that is done or failed, `None` otherwise.
    async fn settled_status(&self, task_id: &str) -> Option<TaskStatus> {
        match self.tracker.get_task(task_id).await {
            Ok(Some(task)) if task.status.is_terminal() => Some(task.status),
            Ok(_) => None,
            Err(e) => {
                warn!(task_id, error = %e, "Could not read task status");
                None
            }
        }
    }

    async fn commit_safety_net(&self, worktree: &Path, reason: &str) {
        let message = format!("shepherd: save uncommitted work ({reason})");
        if let Err(e) = self.branches.commit_all(worktree, &message).await {
            warn!(worktree = %worktree.display(), error = %e, "Safety-net commit failed");
        }
    }

    /// Roll a task back into the queue, keeping its branch when it has work.
    ///
    /// Only the tracker status reset is allowed to fail the rollback; every
    /// other step is best-effort. Returns the number of commits found, or
    /// `None` when the task is already done or failed and must stay that way.
    async fn rollback(
        &self,
        project_id: &str,
        repo: &Path,
        target: &RollbackTarget,
    ) -> DomainResult<Option<u32>> {
        let task_id = target.task_id.as_str();
        if let Some(status) = self.settled_status(task_id).await {
            info!(task_id, %status, "Task already settled, not requeueing");
            self.archiver
                .relocate_artifacts(project_id, task_id, target.attempt.max(1))
                .await;
            return Ok(None);
        }
        let base = match self.settings.pipeline_settings(project_id).await {
            Ok(settings) => settings.base_branch,
            Err(e) => {
                warn!(error = %e, "Settings unavailable, assuming default base branch");
                PipelineSettings::default().base_branch
            }
        };

        let commits_ahead = self
            .branches
            .commits_ahead(repo, &target.branch, &base)
            .await
            .unwrap_or_else(|e| {
                warn!(task_id, error = %e, "Could not count commits, assuming none");
                0
            });
        let diff = match self.branches.diff(repo, &target.branch, &base).await {
            Ok(diff) => Some(diff),
            Err(e) => {
                debug!(task_id, error = %e, "Could not capture diff");
                None
            }
        };

        self.archive_crashed_attempt(project_id, target, diff).await;

        if let Err(e) = self.branches.remove_worktree(repo, &target.worktree).await {
            warn!(task_id, error = %e, "Could not remove worktree");
        }

        let comment = if commits_ahead > 0 {
            format!(
                "{}. Preserved {} on branch `{}`; task requeued.",
                target.reason,
                plural_commits(commits_ahead),
                target.branch
            )
        } else {
            if let Err(e) = self.branches.delete_branch(repo, &target.branch).await {
                debug!(task_id, error = %e, "Branch delete failed");
            }
            format!("{}. No work was found on the branch; task requeued.", target.reason)
        };
        if let Err(e) = self.tracker.add_comment(task_id, &comment).await {
            warn!(task_id, error = %e, "Could not post recovery comment");
        }

        self.tracker.update_task(task_id, TaskUpdate::requeue()).await?;
        self.notifier.emit(Notification::TaskStatusChanged {
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            status: TaskStatus::Open,
            reason: Some(target.reason.clone()),
        });
        info!(task_id, commits_ahead, "Task rolled back and requeued");
        Ok(Some(commits_ahead))
    }

    async fn archive_crashed_attempt(
        &self,
        project_id: &str,
        target: &RollbackTarget,
        diff: Option<String>,
    ) {
        let output_log = tokio::fs::read_to_string(
            self.assignments
                .output_log_path(project_id, &target.task_id),
        )
        .await
        .unwrap_or_default();
        let assignment = self
            .assignments
            .read_assignment(project_id, &target.task_id)
            .await
            .ok()
            .flatten();

        // Sessions are numbered by the cumulative counter, bumped when the
        // interrupted step started.
        let attempt = match self.tracker.cumulative_attempts(&target.task_id).await {
            Ok(n) if n > 0 => n,
            _ => target.attempt,
        };
        let now = Utc::now();
        let session = AgentSession {
            project_id: project_id.to_string(),
            task_id: target.task_id.clone(),
            attempt,
            agent_type: target.phase.clone().unwrap_or_else(|| "unknown".to_string()),
            agent_model: assignment
                .as_ref()
                .map(|a| a.agent_config.model.clone())
                .unwrap_or_default(),
            started_at: assignment.as_ref().map_or(now, |a| a.created_at),
            completed_at: now,
            status: SessionStatus::Crashed,
            output_log,
            output_log_bytes: 0,
            git_branch: Some(target.branch.clone()),
            git_diff: diff,
            git_diff_bytes: 0,
            test_results: None,
            failure_reason: Some(target.reason.clone()),
            summary: None,
        };
        if let Err(e) = self.archiver.archive(session).await {
            warn!(task_id = %target.task_id, error = %e, "Could not archive crashed attempt");
        }
    }
}

/// State carried by the recovery-poll timer between ticks.
struct RecoveryPoll {
    project_id: String,
    task_id: String,
    phase: String,
    worktree: PathBuf,
    last_output: DateTime<Utc>,
    handle: Arc<dyn ProcessHandle>,
    heartbeats: Arc<dyn HeartbeatStore>,
    tracker: Arc<dyn IssueTracker>,
    branches: Arc<dyn BranchManager>,
    timers: TimerRegistry,
    timeout: Duration,
    grace: Duration,
}

impl RecoveryPoll {
    async fn tick(&mut self, host: &dyn RecoveryHost) {
        let task_id = self.task_id.clone();

        if !self.handle.is_alive() {
            self.timers.clear(RECOVERY_POLL_TIMER);
            info!(task_id = %task_id, pid = self.handle.pid(), "Reattached agent exited");
            host.unregister_active(&task_id);
            match self.tracker.get_task(&task_id).await {
                Ok(Some(task)) => host.phase_done(task, &self.phase, None).await,
                Ok(None) => warn!(task_id = %task_id, "Task vanished from the tracker"),
                Err(e) => error!(task_id = %task_id, error = %e, "Could not fetch task"),
            }
            return;
        }

        match self.heartbeats.read(&self.project_id, &task_id).await {
            Ok(Some(hb)) if hb.last_output_timestamp > self.last_output => {
                self.last_output = hb.last_output_timestamp;
            }
            Ok(_) => {}
            Err(e) => debug!(task_id = %task_id, error = %e, "Heartbeat unreadable"),
        }

        let idle = (Utc::now() - self.last_output)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if idle <= self.timeout {
            return;
        }

        self.timers.clear(RECOVERY_POLL_TIMER);
        warn!(task_id = %task_id, idle_secs = idle.as_secs(), "Reattached agent inactive, killing");
        let message = "shepherd: save uncommitted work (agent timed out)";
        if let Err(e) = self.branches.commit_all(&self.worktree, message).await {
            warn!(task_id = %task_id, error = %e, "Safety-net commit failed");
        }
        escalate_kill(self.handle.as_ref(), self.grace).await;
        host.unregister_active(&task_id);
        let reason = format!(
            "Agent produced no output for {}s after a supervisor restart and was killed",
            idle.as_secs()
        );
        host.fail_task(&task_id, &reason).await;
    }
}
