//! Per-project driving loop.
//!
//! A `ProjectPipeline` owns the project's single task slot. `nudge` claims
//! the next unblocked open task, cuts its worktree and walks it through the
//! workflow: agent steps go to the lifecycle manager, merge steps run
//! in-process. When a step finishes the attempt is archived, the step's
//! success condition is evaluated and the loop retries, advances, finishes
//! or gives up.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    AgentConfig, AgentProcessConfig, AgentRole, AgentSession, Notification,
    PersistedOrchestratorState, SessionStatus, StepStatus, SuccessCondition, Task, TaskAssignment,
    TaskStatus, TaskUpdate, TestResults, Totals, WorkflowDefinition, WorkflowExecutionState,
    WorkflowStep,
};
use crate::domain::ports::{
    AssignmentStore, BranchManager, IssueTracker, Notifier, PipelineSettings, ProcessHandle,
    SettingsProvider, SpawnRequest, StateStore, TestRunner,
};
use crate::infrastructure::layout::StateLayout;
use crate::services::agent_lifecycle::{
    AgentLifecycleManager, AgentRunState, CompletionCallback, MonitorStop, RunParams,
};
use crate::services::crash_recovery::{
    CrashRecovery, ReattachedAgent, RecoveryHost, RecoveryReport,
};
use crate::services::session_archive::SessionArchiver;
use crate::services::timer_registry::TimerRegistry;
use crate::services::workflow_engine::WorkflowEngine;

/// Assignee recorded on claimed tasks.
pub const AGENT_NAME: &str = "shepherd";

/// Collaborators for [`ProjectPipeline`].
pub struct PipelineDeps {
    pub tracker: Arc<dyn IssueTracker>,
    pub branches: Arc<dyn BranchManager>,
    pub tests: Arc<dyn TestRunner>,
    pub settings: Arc<dyn SettingsProvider>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub state_store: Arc<dyn StateStore>,
    pub notifier: Arc<dyn Notifier>,
    pub lifecycle: Arc<AgentLifecycleManager>,
    pub archiver: Arc<SessionArchiver>,
}

#[derive(Debug, Clone)]
struct ActiveTask {
    task: Task,
    exec: WorkflowExecutionState,
    branch: String,
    worktree: PathBuf,
    step_attempts: HashMap<String, u32>,
    process: Option<Arc<dyn ProcessHandle>>,
    step_started_at: DateTime<Utc>,
    /// Cumulative attempt number of the running step; keys its session record.
    session_attempt: u32,
}

impl ActiveTask {
    fn attempt(&self, step_id: &str) -> u32 {
        self.step_attempts.get(step_id).copied().unwrap_or(0)
    }
}

/// An agent adopted after a restart, watched by the recovery poll.
#[derive(Debug)]
struct Reattached {
    handle: Arc<dyn ProcessHandle>,
    monitor: MonitorStop,
}

enum Decision {
    Run(WorkflowStep),
    Finish,
    Stuck,
    Wait,
}

/// How a finished step turned out.
struct StepOutcome {
    success: bool,
    reason: Option<String>,
}

impl StepOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct ProjectPipeline {
    project_id: String,
    repo: PathBuf,
    workflow: WorkflowDefinition,
    engine: WorkflowEngine,
    deps: PipelineDeps,
    layout: StateLayout,
    agent_config: AgentProcessConfig,
    timers: TimerRegistry,
    run_state: Arc<AgentRunState>,
    slot: Mutex<Option<ActiveTask>>,
    reattached: Mutex<HashMap<String, Reattached>>,
    loop_active: AtomicBool,
    totals: Mutex<Totals>,
    queue_depth: AtomicUsize,
    me: Weak<ProjectPipeline>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProjectPipeline {
    pub fn new(
        project_id: impl Into<String>,
        repo: impl Into<PathBuf>,
        workflow: WorkflowDefinition,
        deps: PipelineDeps,
        layout: StateLayout,
    ) -> Arc<Self> {
        let agent_config = deps.lifecycle.config().clone();
        let output_cap = agent_config.output_log_cap_bytes;
        Arc::new_cyclic(|me| Self {
            project_id: project_id.into(),
            repo: repo.into(),
            workflow,
            engine: WorkflowEngine::new(),
            deps,
            layout,
            agent_config,
            timers: TimerRegistry::new(),
            run_state: Arc::new(AgentRunState::new(output_cap)),
            slot: Mutex::new(None),
            reattached: Mutex::new(HashMap::new()),
            loop_active: AtomicBool::new(false),
            totals: Mutex::new(Totals::default()),
            queue_depth: AtomicUsize::new(0),
            me: me.clone(),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn run_state(&self) -> &Arc<AgentRunState> {
        &self.run_state
    }

    /// Whether a task occupies the slot (or the loop is picking one).
    pub fn is_busy(&self) -> bool {
        self.loop_active.load(Ordering::Acquire)
    }

    pub fn current_task_id(&self) -> Option<String> {
        lock(&self.slot).as_ref().map(|a| a.task.id.clone())
    }

    /// Execution state of the task in the slot.
    pub fn execution_state(&self) -> Option<WorkflowExecutionState> {
        lock(&self.slot).as_ref().map(|a| a.exec.clone())
    }

    pub fn totals(&self) -> Totals {
        *lock(&self.totals)
    }

    /// This pipeline as the host of a recovery pass.
    pub fn as_host(self: &Arc<Self>) -> Arc<dyn RecoveryHost> {
        Arc::clone(self) as Arc<dyn RecoveryHost>
    }

    /// Reconcile persisted state left by a previous run.
    pub async fn recover(self: &Arc<Self>, recovery: &CrashRecovery) -> DomainResult<RecoveryReport> {
        recovery
            .recover_project(&self.project_id, &self.repo, self.as_host())
            .await
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut ActiveTask) -> R) -> Option<R> {
        lock(&self.slot).as_mut().map(f)
    }

    fn take_slot(&self) -> Option<ActiveTask> {
        lock(&self.slot).take()
    }

    fn release(&self) {
        self.loop_active.store(false, Ordering::Release);
    }

    /// Claim and start the next task. A no-op while a task occupies the slot.
    ///
    /// Returns `true` when a task was started.
    #[instrument(skip(self), fields(project_id = %self.project_id))]
    pub async fn nudge(&self) -> DomainResult<bool> {
        if self
            .loop_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Pipeline busy, ignoring nudge");
            return Ok(false);
        }

        match self.start_next_task().await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.release();
                Ok(false)
            }
            Err(e) => {
                self.take_slot();
                self.release();
                Err(e)
            }
        }
    }

    async fn start_next_task(&self) -> DomainResult<bool> {
        let open = self.deps.tracker.list_open_tasks(&self.project_id).await?;
        self.queue_depth.store(open.len(), Ordering::Release);

        let mut picked = None;
        for task in open {
            if task.status != TaskStatus::Open {
                continue;
            }
            if self.deps.tracker.blockers_closed(&task.id).await? {
                picked = Some(task);
                break;
            }
            debug!(task_id = %task.id, "Task still blocked");
        }
        let Some(mut task) = picked else {
            debug!("No runnable task");
            return Ok(false);
        };

        let settings = self.deps.settings.pipeline_settings(&self.project_id).await?;
        self.deps
            .tracker
            .update_task(&task.id, TaskUpdate::claim(AGENT_NAME))
            .await?;
        task.status = TaskStatus::InProgress;
        task.assignee = Some(AGENT_NAME.to_string());

        let branch = task.branch_name();
        let worktree = self.layout.worktree_path(&self.project_id, &task.id);
        if let Err(e) = self
            .deps
            .branches
            .create_worktree(&self.repo, &branch, &settings.base_branch, &worktree)
            .await
        {
            error!(task_id = %task.id, error = %e, "Could not create worktree");
            self.comment(&task.id, &format!("Could not create a worktree: {e}. Task requeued."))
                .await;
            self.deps
                .tracker
                .update_task(&task.id, TaskUpdate::requeue())
                .await?;
            return Err(e);
        }

        info!(task_id = %task.id, branch = %branch, "Task claimed");
        self.deps.notifier.emit(Notification::TaskStatusChanged {
            project_id: self.project_id.clone(),
            task_id: task.id.clone(),
            status: TaskStatus::InProgress,
            reason: None,
        });

        let exec = self.engine.init_execution_state(&self.workflow, &task.id);
        *lock(&self.slot) = Some(ActiveTask {
            task,
            exec,
            branch,
            worktree,
            step_attempts: HashMap::new(),
            process: None,
            step_started_at: Utc::now(),
            session_attempt: 0,
        });

        self.drive().await;
        Ok(true)
    }

    /// Advance the slot's task, requeueing it if the loop itself fails.
    async fn drive(&self) {
        if let Err(e) = self.advance().await {
            error!(project_id = %self.project_id, error = %e, "Pipeline step failed");
            self.requeue_active(&format!("Pipeline error: {e}")).await;
        }
    }

    fn advance(&self) -> BoxFuture<'_, DomainResult<()>> {
        async move {
            let settings = self.deps.settings.pipeline_settings(&self.project_id).await?;
            let decision = loop {
                let mut guard = lock(&self.slot);
                let Some(active) = guard.as_mut() else {
                    break Decision::Wait;
                };
                if self.engine.is_complete(&active.exec) {
                    break Decision::Finish;
                }
                if let Some(step) = self.engine.get_next_step(&self.workflow, &active.exec) {
                    if step.agent_role == AgentRole::Reviewer && !settings.review_required {
                        info!(task_id = %active.task.id, step = %step.id, "Review disabled, skipping");
                        active.exec.set_status(&step.id, StepStatus::Skipped);
                        continue;
                    }
                    break Decision::Run(step.clone());
                }
                if self.engine.is_stuck(&self.workflow, &active.exec) {
                    break Decision::Stuck;
                }
                break Decision::Wait;
            };

            match decision {
                Decision::Run(step) => self.run_step(step, &settings).await,
                Decision::Finish => {
                    self.finalize().await;
                    Ok(())
                }
                Decision::Stuck => {
                    self.give_up_or_requeue().await;
                    Ok(())
                }
                Decision::Wait => Ok(()),
            }
        }
        .boxed()
    }

    async fn run_step(&self, step: WorkflowStep, settings: &PipelineSettings) -> DomainResult<()> {
        let Some((task, branch, worktree, attempt)) = self.with_slot(|a| {
            a.exec.start(&step.id);
            let n = a.step_attempts.entry(step.id.clone()).or_insert(0);
            *n += 1;
            a.step_started_at = Utc::now();
            (a.task.clone(), a.branch.clone(), a.worktree.clone(), *n)
        }) else {
            return Ok(());
        };

        let session_attempt = match self.deps.tracker.increment_attempts(&task.id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Could not bump attempt counter");
                attempt
            }
        };
        self.with_slot(|a| a.session_attempt = session_attempt);
        self.persist(&task.id, &step.id, &branch, &worktree, attempt, None)
            .await?;
        info!(task_id = %task.id, step = %step.id, attempt, "Starting step");

        if step.agent_role == AgentRole::Merger {
            let outcome = self.run_merge(&branch, settings).await;
            return self.step_finished(&step, outcome).await;
        }

        let model = if step.retry_policy.escalate_model && attempt > 1 {
            self.agent_config.escalation_model.clone()
        } else {
            self.agent_config.model.clone()
        };
        let command = match step.agent_role {
            AgentRole::Reviewer => self.agent_config.reviewer_command.clone(),
            _ => self.agent_config.coder_command.clone(),
        };
        let agent_config = AgentConfig {
            command,
            args: self.agent_config.args.clone(),
            model,
        };

        let assignments = &self.deps.assignments;
        if let Err(e) = assignments.clear_result(&self.project_id, &task.id).await {
            debug!(task_id = %task.id, error = %e, "Could not clear stale result");
        }
        let prompt_path = assignments
            .write_prompt(&self.project_id, &task.id, &self.build_prompt(&task, &step))
            .await?;
        assignments
            .write_assignment(&TaskAssignment {
                task_id: task.id.clone(),
                project_id: self.project_id.clone(),
                phase: step.id.clone(),
                branch_name: branch.clone(),
                worktree_path: worktree.clone(),
                prompt_path: prompt_path.clone(),
                agent_config: agent_config.clone(),
                attempt,
                created_at: Utc::now(),
            })
            .await?;

        let params = RunParams {
            spawn: SpawnRequest {
                project_id: self.project_id.clone(),
                task_id: task.id.clone(),
                role: step.agent_role,
                working_dir: worktree.clone(),
                prompt_path,
                output_log_path: assignments.output_log_path(&self.project_id, &task.id),
                agent_config,
            },
            phase: step.id.clone(),
            attempt,
        };

        let on_complete = self.completion_callback(step.id.clone());
        match self.deps.lifecycle.run(
            params,
            Arc::clone(&self.run_state),
            &self.timers,
            on_complete,
        ) {
            Ok(handle) => {
                let pid = handle.pid();
                let still_running = self
                    .with_slot(|a| {
                        let running = a.exec.current_step_id.as_deref() == Some(step.id.as_str())
                            && a.exec.status(&step.id) == Some(StepStatus::InProgress);
                        if running {
                            a.process = Some(handle);
                        }
                        running
                    })
                    .unwrap_or(false);
                if still_running {
                    self.persist(&task.id, &step.id, &branch, &worktree, attempt, Some(pid))
                        .await?;
                }
                Ok(())
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Agent failed to start");
                self.step_finished(&step, StepOutcome::failed(format!("agent failed to start: {e}")))
                    .await
            }
        }
    }

    async fn run_merge(&self, branch: &str, settings: &PipelineSettings) -> StepOutcome {
        let branches = &self.deps.branches;
        if let Err(e) = branches.merge(&self.repo, branch, &settings.base_branch).await {
            return StepOutcome::failed(format!("merge failed: {e}"));
        }
        if settings.push_after_merge {
            if let Err(e) = branches.push(&self.repo, &settings.base_branch).await {
                return StepOutcome::failed(format!("push failed: {e}"));
            }
        }
        StepOutcome::ok()
    }

    fn build_prompt(&self, task: &Task, step: &WorkflowStep) -> String {
        let result_path = self
            .deps
            .assignments
            .result_path(&self.project_id, &task.id);
        let instructions = match step.agent_role {
            AgentRole::Reviewer => {
                "Review the changes on this branch. Record your verdict in the result file \
                 with `approved` set to true or false."
            }
            _ => "Implement the task in this worktree and commit your changes.",
        };
        format!(
            "# {title}\n\n{description}\n\n## Step: {step}\n\n{instructions}\n\n\
             When done, write JSON to `{result}`: \
             {{\"success\": bool, \"approved\": bool|null, \"summary\": string}}\n",
            title = task.title,
            description = task.description,
            step = step.name,
            result = result_path.display(),
        )
    }

    fn completion_callback(&self, step_id: String) -> CompletionCallback {
        let me = self.me.clone();
        Arc::new(move |exit_code: Option<i32>| {
            let me = me.clone();
            let step_id = step_id.clone();
            async move {
                if let Some(pipeline) = me.upgrade() {
                    pipeline.on_phase_done(&step_id, exit_code).await;
                }
            }
            .boxed()
        })
    }

    /// An agent step finished: archive it, judge it, move on.
    async fn on_phase_done(&self, step_id: &str, exit_code: Option<i32>) {
        let Some((task, branch, worktree, attempt, started_at)) = self
            .with_slot(|a| {
                if a.exec.current_step_id.as_deref() != Some(step_id)
                    || a.exec.status(step_id) != Some(StepStatus::InProgress)
                {
                    return None;
                }
                a.process = None;
                Some((
                    a.task.clone(),
                    a.branch.clone(),
                    a.worktree.clone(),
                    a.session_attempt.max(1),
                    a.step_started_at,
                ))
            })
            .flatten()
        else {
            warn!(step = %step_id, "Completion for a step that is not running, ignoring");
            return;
        };
        let Some(step) = self.workflow.step(step_id).cloned() else {
            return;
        };

        let base = match self.deps.settings.pipeline_settings(&self.project_id).await {
            Ok(settings) => settings.base_branch,
            Err(_) => PipelineSettings::default().base_branch,
        };
        let killed = self.run_state.killed_due_to_timeout();
        let (outcome, test_results, summary) = self
            .judge(&step, &task.id, exit_code, killed, &branch, &worktree, &base)
            .await;

        let status = if outcome.success {
            SessionStatus::Succeeded
        } else if killed {
            SessionStatus::TimedOut
        } else if exit_code.is_none() {
            SessionStatus::Crashed
        } else {
            SessionStatus::Failed
        };

        let mut output_log = self.run_state.output();
        if output_log.is_empty() {
            let path = self.deps.assignments.output_log_path(&self.project_id, &task.id);
            output_log = tokio::fs::read_to_string(path).await.unwrap_or_default();
        }
        let git_diff = self.deps.branches.diff(&self.repo, &branch, &base).await.ok();
        let agent_model = self
            .deps
            .assignments
            .read_assignment(&self.project_id, &task.id)
            .await
            .ok()
            .flatten()
            .map(|a| a.agent_config.model)
            .unwrap_or_default();

        let session = AgentSession {
            project_id: self.project_id.clone(),
            task_id: task.id.clone(),
            attempt,
            agent_type: step.agent_role.to_string(),
            agent_model,
            started_at,
            completed_at: Utc::now(),
            status,
            output_log,
            output_log_bytes: 0,
            git_branch: Some(branch),
            git_diff,
            git_diff_bytes: 0,
            test_results,
            failure_reason: outcome.reason.clone(),
            summary,
        };
        if let Err(e) = self.deps.archiver.archive(session).await {
            warn!(task_id = %task.id, error = %e, "Could not archive session");
        }

        if let Err(e) = self.step_finished(&step, outcome).await {
            error!(task_id = %task.id, error = %e, "Could not advance after step");
            self.requeue_active(&format!("Pipeline error: {e}")).await;
        }
    }

    /// Evaluate a finished step against its success condition.
    #[allow(clippy::too_many_arguments)]
    async fn judge(
        &self,
        step: &WorkflowStep,
        task_id: &str,
        exit_code: Option<i32>,
        killed: bool,
        branch: &str,
        worktree: &std::path::Path,
        base: &str,
    ) -> (StepOutcome, Option<TestResults>, Option<String>) {
        let result = self
            .deps
            .assignments
            .read_result(&self.project_id, task_id)
            .await
            .unwrap_or_else(|e| {
                warn!(task_id, error = %e, "Unreadable result file");
                None
            });
        let summary = result.as_ref().and_then(|r| r.summary.clone());

        if killed {
            let secs = self.agent_config.inactivity_timeout().as_secs();
            return (
                StepOutcome::failed(format!("agent produced no output for {secs}s and was killed")),
                None,
                summary,
            );
        }
        match exit_code {
            Some(0) => {}
            Some(code) => {
                return (
                    StepOutcome::failed(format!("agent exited with code {code}")),
                    None,
                    summary,
                )
            }
            None => {
                return (
                    StepOutcome::failed("agent process died unexpectedly"),
                    None,
                    summary,
                )
            }
        }

        match step.success_condition {
            SuccessCondition::ExitZero => (StepOutcome::ok(), None, summary),
            SuccessCondition::TestsPass => {
                let files = match self.deps.branches.changed_files(&self.repo, branch, base).await {
                    Ok(files) => files,
                    Err(e) => {
                        return (
                            StepOutcome::failed(format!("could not list changed files: {e}")),
                            None,
                            summary,
                        )
                    }
                };
                match self.deps.tests.run_scoped(worktree, &files).await {
                    Ok(results) if results.success() => (StepOutcome::ok(), Some(results), summary),
                    Ok(results) => (
                        StepOutcome::failed(format!(
                            "{} of {} tests failed",
                            results.failed, results.total
                        )),
                        Some(results),
                        summary,
                    ),
                    Err(e) => (
                        StepOutcome::failed(format!("test run failed: {e}")),
                        None,
                        summary,
                    ),
                }
            }
            SuccessCondition::Approved => {
                if result.as_ref().and_then(|r| r.approved) == Some(true) {
                    (StepOutcome::ok(), None, summary)
                } else {
                    let detail = summary.clone().unwrap_or_else(|| "no verdict".to_string());
                    (
                        StepOutcome::failed(format!("review not approved: {detail}")),
                        None,
                        summary,
                    )
                }
            }
        }
    }

    async fn step_finished(&self, step: &WorkflowStep, outcome: StepOutcome) -> DomainResult<()> {
        let Some((task_id, attempt)) =
            self.with_slot(|a| (a.task.id.clone(), a.attempt(&step.id)))
        else {
            return Ok(());
        };

        if outcome.success {
            info!(task_id = %task_id, step = %step.id, "Step completed");
            self.with_slot(|a| a.exec.set_status(&step.id, StepStatus::Completed));
            return self.advance().await;
        }

        let reason = outcome.reason.unwrap_or_else(|| "unknown failure".to_string());
        if attempt < step.retry_policy.max_attempts {
            warn!(task_id = %task_id, step = %step.id, attempt, reason = %reason, "Step failed, retrying");
            self.comment(
                &task_id,
                &format!(
                    "Step `{}` attempt {attempt} of {} failed: {reason}. Retrying.",
                    step.id, step.retry_policy.max_attempts
                ),
            )
            .await;
            self.with_slot(|a| a.exec.set_status(&step.id, StepStatus::Pending));
        } else {
            warn!(task_id = %task_id, step = %step.id, attempt, reason = %reason, "Step failed, no attempts left");
            self.comment(
                &task_id,
                &format!("Step `{}` failed after {attempt} attempt(s): {reason}.", step.id),
            )
            .await;
            self.with_slot(|a| a.exec.set_status(&step.id, StepStatus::Failed));
        }
        self.advance().await
    }

    async fn persist(
        &self,
        task_id: &str,
        step_id: &str,
        branch: &str,
        worktree: &std::path::Path,
        attempt: u32,
        pid: Option<u32>,
    ) -> DomainResult<()> {
        let started_at = self.with_slot(|a| a.step_started_at);
        let state = PersistedOrchestratorState {
            current_task_id: Some(task_id.to_string()),
            current_phase: Some(step_id.to_string()),
            branch_name: Some(branch.to_string()),
            worktree_path: Some(worktree.to_path_buf()),
            agent_pid: pid,
            attempt,
            started_at,
            last_transition: Some(Utc::now()),
            last_output_timestamp: pid.map(|_| self.run_state.last_output_at()),
            queue_depth: self.queue_depth.load(Ordering::Acquire),
            totals: self.totals(),
        };
        self.deps.state_store.save(&self.project_id, &state).await
    }

    async fn comment(&self, task_id: &str, body: &str) {
        if let Err(e) = self.deps.tracker.add_comment(task_id, body).await {
            warn!(task_id, error = %e, "Could not post comment");
        }
    }

    async fn clear_state(&self) {
        if let Err(e) = self.deps.state_store.clear(&self.project_id).await {
            warn!(project_id = %self.project_id, error = %e, "Could not clear persisted state");
        }
    }

    async fn remove_worktree(&self, worktree: &std::path::Path) {
        if let Err(e) = self.deps.branches.remove_worktree(&self.repo, worktree).await {
            warn!(worktree = %worktree.display(), error = %e, "Could not remove worktree");
        }
    }

    /// Archive whatever the last attempt left in the task's active directory.
    ///
    /// Agent steps archive on completion; this covers attempts that never
    /// got there (spawn failures, agents killed after a restart), so no
    /// assignment record outlives the task's slot.
    async fn discard_active_dir(&self, task_id: &str) {
        let dir = self.layout.task_dir(&self.project_id, task_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return;
        }
        let attempt = self
            .deps
            .tracker
            .cumulative_attempts(task_id)
            .await
            .unwrap_or(1)
            .max(1);
        self.deps
            .archiver
            .relocate_artifacts(&self.project_id, task_id, attempt)
            .await;
    }

    fn stop_observing(&self, task_id: &str) {
        if let Some(reattached) = lock(&self.reattached).remove(task_id) {
            reattached.monitor.stop();
        }
    }

    /// Record the attempt of a reattached agent that recovery had to kill.
    async fn archive_killed_attempt(&self, task_id: &str, reason: &str) {
        let assignment = match self
            .deps
            .assignments
            .read_assignment(&self.project_id, task_id)
            .await
        {
            Ok(Some(assignment)) => assignment,
            Ok(None) => return,
            Err(e) => {
                warn!(task_id, error = %e, "Unreadable assignment, not archiving");
                return;
            }
        };
        let base = match self.deps.settings.pipeline_settings(&self.project_id).await {
            Ok(settings) => settings.base_branch,
            Err(_) => PipelineSettings::default().base_branch,
        };
        let mut output_log = self.run_state.output();
        if output_log.is_empty() {
            let path = self.deps.assignments.output_log_path(&self.project_id, task_id);
            output_log = tokio::fs::read_to_string(path).await.unwrap_or_default();
        }
        let attempt = self
            .deps
            .tracker
            .cumulative_attempts(task_id)
            .await
            .unwrap_or(assignment.attempt)
            .max(1);
        let agent_type = self
            .workflow
            .step(&assignment.phase)
            .map_or_else(|| assignment.phase.clone(), |s| s.agent_role.to_string());
        let git_diff = self
            .deps
            .branches
            .diff(&self.repo, &assignment.branch_name, &base)
            .await
            .ok();

        let session = AgentSession {
            project_id: self.project_id.clone(),
            task_id: task_id.to_string(),
            attempt,
            agent_type,
            agent_model: assignment.agent_config.model,
            started_at: assignment.created_at,
            completed_at: Utc::now(),
            status: SessionStatus::TimedOut,
            output_log,
            output_log_bytes: 0,
            git_branch: Some(assignment.branch_name),
            git_diff,
            git_diff_bytes: 0,
            test_results: None,
            failure_reason: Some(reason.to_string()),
            summary: None,
        };
        if let Err(e) = self.deps.archiver.archive(session).await {
            warn!(task_id, error = %e, "Could not archive killed attempt");
        }
    }

    fn emit_status(&self, task_id: &str, status: TaskStatus, reason: Option<String>) {
        self.deps.notifier.emit(Notification::TaskStatusChanged {
            project_id: self.project_id.clone(),
            task_id: task_id.to_string(),
            status,
            reason,
        });
    }

    fn schedule_nudge(&self) {
        let me = self.me.clone();
        tokio::spawn(async move {
            if let Some(pipeline) = me.upgrade() {
                if let Err(e) = pipeline.nudge().await {
                    warn!(project_id = %pipeline.project_id, error = %e, "Follow-up nudge failed");
                }
            }
        });
    }

    /// Every step done: close the task and free the slot.
    async fn finalize(&self) {
        let Some(active) = self.take_slot() else {
            return;
        };
        let task_id = active.task.id.clone();

        if let Err(e) = self
            .deps
            .tracker
            .close_task(&task_id, "Merged by shepherd")
            .await
        {
            error!(task_id = %task_id, error = %e, "Could not close task");
        }
        self.clear_state().await;
        self.remove_worktree(&active.worktree).await;
        if let Err(e) = self.deps.branches.delete_branch(&self.repo, &active.branch).await {
            debug!(task_id = %task_id, error = %e, "Branch delete failed");
        }

        lock(&self.totals).completed += 1;
        info!(task_id = %task_id, "Task completed");
        self.emit_status(&task_id, TaskStatus::Done, None);
        self.release();
        self.schedule_nudge();
    }

    /// No step can run. Requeue the task unless its attempt budget is spent.
    ///
    /// The budget is the sum of every step's `max_attempts`, counted across
    /// requeues and restarts by the tracker's cumulative attempt counter.
    async fn give_up_or_requeue(&self) {
        let Some(task_id) = self.current_task_id() else {
            return;
        };
        let budget: u32 = self
            .workflow
            .steps
            .iter()
            .map(|s| s.retry_policy.max_attempts)
            .sum();
        let used = self
            .deps
            .tracker
            .cumulative_attempts(&task_id)
            .await
            .unwrap_or_else(|e| {
                warn!(task_id = %task_id, error = %e, "Could not read attempt counter");
                0
            });

        if used >= budget {
            let reason = format!("Gave up after {used} attempts");
            self.fail_active(&task_id, &reason).await;
        } else {
            self.requeue_active("A workflow step failed; work is kept on the branch")
                .await;
        }
    }

    /// Put the slot's task back in the queue.
    async fn requeue_active(&self, reason: &str) {
        let Some(active) = self.take_slot() else {
            self.release();
            return;
        };
        let task_id = active.task.id.clone();

        self.comment(&task_id, &format!("{reason}. Task requeued.")).await;
        if let Err(e) = self
            .deps
            .tracker
            .update_task(&task_id, TaskUpdate::requeue())
            .await
        {
            error!(task_id = %task_id, error = %e, "Could not requeue task");
        }
        self.clear_state().await;
        self.discard_active_dir(&task_id).await;
        self.remove_worktree(&active.worktree).await;

        lock(&self.totals).requeued += 1;
        info!(task_id = %task_id, reason, "Task requeued");
        self.emit_status(&task_id, TaskStatus::Open, Some(reason.to_string()));
        self.release();
    }

    async fn fail_active(&self, task_id: &str, reason: &str) {
        let worktree = match self.take_slot() {
            Some(active) if active.task.id == task_id => active.worktree,
            Some(other) => {
                // Not ours; put it back.
                *lock(&self.slot) = Some(other);
                self.layout.worktree_path(&self.project_id, task_id)
            }
            None => self.layout.worktree_path(&self.project_id, task_id),
        };
        self.stop_observing(task_id);

        self.comment(task_id, &format!("{reason}. Task failed.")).await;
        if let Err(e) = self
            .deps
            .tracker
            .update_task(task_id, TaskUpdate::status(TaskStatus::Failed))
            .await
        {
            error!(task_id, error = %e, "Could not mark task failed");
        }
        self.clear_state().await;
        self.discard_active_dir(task_id).await;
        self.remove_worktree(&worktree).await;

        lock(&self.totals).failed += 1;
        warn!(task_id, reason, "Task failed");
        self.emit_status(task_id, TaskStatus::Failed, Some(reason.to_string()));
        if lock(&self.slot).is_none() {
            self.release();
            self.schedule_nudge();
        }
    }

    /// Occupy the slot with a task recovered from disk, treating every step
    /// before `step_id` as completed.
    async fn adopt(&self, task: Task, step_id: &str, running: bool) {
        let mut exec = self.engine.init_execution_state(&self.workflow, &task.id);
        let order: Vec<String> = match self.engine.topological_sort(&self.workflow) {
            Ok(order) => order.into_iter().map(|s| s.id.clone()).collect(),
            Err(_) => self.workflow.steps.iter().map(|s| s.id.clone()).collect(),
        };
        for id in order {
            if id == step_id {
                break;
            }
            exec.set_status(&id, StepStatus::Completed);
        }
        if running {
            exec.start(step_id);
        }

        let persisted = self
            .deps
            .state_store
            .load(&self.project_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let mut step_attempts = HashMap::new();
        if running {
            step_attempts.insert(step_id.to_string(), persisted.attempt.max(1));
        }
        let session_attempt = self
            .deps
            .tracker
            .cumulative_attempts(&task.id)
            .await
            .unwrap_or(persisted.attempt);

        self.loop_active.store(true, Ordering::Release);
        *lock(&self.slot) = Some(ActiveTask {
            branch: persisted.branch_name.unwrap_or_else(|| task.branch_name()),
            worktree: persisted
                .worktree_path
                .unwrap_or_else(|| self.layout.worktree_path(&self.project_id, &task.id)),
            task,
            exec,
            step_attempts,
            process: None,
            step_started_at: persisted.started_at.unwrap_or_else(Utc::now),
            session_attempt,
        });
    }
}

#[async_trait]
impl RecoveryHost for ProjectPipeline {
    fn slotted_task_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = lock(&self.reattached).keys().cloned().collect();
        ids.extend(self.current_task_id());
        ids
    }

    fn active_agent_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = lock(&self.reattached).keys().cloned().collect();
        if let Some(active) = lock(&self.slot).as_ref() {
            if active.process.is_some() {
                ids.insert(active.task.id.clone());
            }
        }
        ids
    }

    fn timers(&self) -> TimerRegistry {
        self.timers.clone()
    }

    async fn register_active(&self, agent: ReattachedAgent) {
        self.loop_active.store(true, Ordering::Release);
        let task_id = agent.task_id.clone();
        let assignments = &self.deps.assignments;
        let agent_config = match assignments.read_assignment(&self.project_id, &task_id).await {
            Ok(Some(assignment)) => assignment.agent_config,
            _ => AgentConfig {
                command: self.agent_config.coder_command.clone(),
                args: self.agent_config.args.clone(),
                model: self.agent_config.model.clone(),
            },
        };
        let params = RunParams {
            spawn: SpawnRequest {
                project_id: self.project_id.clone(),
                task_id: task_id.clone(),
                role: self
                    .workflow
                    .step(&agent.phase)
                    .map_or(AgentRole::Coder, |s| s.agent_role),
                working_dir: agent.worktree,
                prompt_path: assignments.prompt_path(&self.project_id, &task_id),
                output_log_path: assignments.output_log_path(&self.project_id, &task_id),
                agent_config,
            },
            phase: agent.phase,
            attempt: agent.attempt,
        };

        let monitor = self.deps.lifecycle.observe(
            Arc::clone(&agent.handle),
            params,
            Arc::clone(&self.run_state),
            &self.timers,
            Some(agent.last_output_at),
        );
        let previous = lock(&self.reattached).insert(
            task_id,
            Reattached {
                handle: agent.handle,
                monitor,
            },
        );
        if let Some(previous) = previous {
            debug!(pid = previous.handle.pid(), "Replaced an earlier reattachment");
        }
    }

    fn unregister_active(&self, task_id: &str) {
        self.stop_observing(task_id);
    }

    async fn phase_done(&self, task: Task, phase: &str, exit_code: Option<i32>) {
        if self.workflow.step(phase).is_none() {
            error!(task_id = %task.id, phase, "Recovered phase is not in the workflow");
            self.fail_active(&task.id, &format!("Unknown workflow step `{phase}`"))
                .await;
            return;
        }
        self.adopt(task, phase, true).await;
        self.on_phase_done(phase, exit_code).await;
    }

    async fn advance_to(&self, task: Task, role: AgentRole) {
        let Some(step_id) = self.workflow.step_for_role(role).map(|s| s.id.clone()) else {
            let reason = format!("Workflow has no {role} step");
            self.fail_active(&task.id, &reason).await;
            return;
        };
        info!(task_id = %task.id, step = %step_id, "Resuming task at recovered step");
        self.adopt(task, &step_id, false).await;
        self.drive().await;
    }

    async fn fail_task(&self, task_id: &str, reason: &str) {
        self.stop_observing(task_id);
        self.archive_killed_attempt(task_id, reason).await;
        self.fail_active(task_id, reason).await;
    }
}

impl std::fmt::Debug for ProjectPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectPipeline")
            .field("project_id", &self.project_id)
            .field("repo", &self.repo)
            .field("workflow", &self.workflow.id)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}
