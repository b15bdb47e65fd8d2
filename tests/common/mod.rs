//! Shared fixtures for the integration tests.
//!
//! In-memory and recording doubles for every port the supervisor talks to,
//! plus a harness that wires them to real filesystem stores in a temp dir.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use shepherd::adapters::fs::{FsAssignmentStore, JsonHeartbeatStore, JsonSessionStore, JsonStateStore};
use shepherd::domain::errors::{DomainError, DomainResult};
use shepherd::domain::models::{
    AgentConfig, AgentProcessConfig, AgentRole, ArchiveConfig, Notification, RecoveryConfig, Task,
    TaskAssignment, TaskStatus, TaskUpdate, TestResults, WorkflowDefinition,
};
use shepherd::domain::ports::{
    AssignmentStore, BranchManager, IssueTracker, KillSignal, Notifier, PipelineSettings,
    ProcessHandle, ProcessProbe, ProcessSpawner, SettingsProvider, SpawnCallbacks, SpawnRequest,
    TestRunner,
};
use shepherd::infrastructure::layout::StateLayout;
use shepherd::services::{
    AgentLifecycleManager, CrashRecovery, CrashRecoveryDeps, PipelineDeps, ProjectPipeline,
    ReattachedAgent, RecoveryHost, SessionArchiver, TimerRegistry,
};

pub const PROJECT: &str = "proj";

/// Poll `check` until it holds or `within_ms` elapses.
pub async fn wait_for(mut check: impl FnMut() -> bool, within_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(within_ms);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Issue tracker
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryTracker {
    tasks: Mutex<Vec<Task>>,
    comments: Mutex<Vec<(String, String)>>,
    updates: Mutex<Vec<(String, TaskUpdate)>>,
    closed: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.task(task_id).map(|t| t.status)
    }

    pub fn comments_for(&self, task_id: &str) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn updates_for(&self, task_id: &str) -> Vec<TaskUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, update)| update.clone())
            .collect()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn attempts(&self, task_id: &str) -> u32 {
        self.attempts.lock().unwrap().get(task_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    async fn get_task(&self, task_id: &str) -> DomainResult<Option<Task>> {
        Ok(self.task(task_id))
    }

    async fn list_open_tasks(&self, project_id: &str) -> DomainResult<Vec<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.project_id == project_id && t.status == TaskStatus::Open)
            .cloned()
            .collect())
    }

    async fn update_task(&self, task_id: &str, update: TaskUpdate) -> DomainResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()))?;
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(assignee) = update.assignee.clone() {
            task.assignee = assignee;
        }
        self.updates
            .lock()
            .unwrap()
            .push((task_id.to_string(), update));
        Ok(())
    }

    async fn close_task(&self, task_id: &str, _reason: &str) -> DomainResult<()> {
        if let Some(task) = self.tasks.lock().unwrap().iter_mut().find(|t| t.id == task_id) {
            task.status = TaskStatus::Done;
        }
        self.closed.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn add_comment(&self, task_id: &str, body: &str) -> DomainResult<()> {
        self.comments
            .lock()
            .unwrap()
            .push((task_id.to_string(), body.to_string()));
        Ok(())
    }

    async fn blockers_closed(&self, task_id: &str) -> DomainResult<bool> {
        let tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.iter().find(|t| t.id == task_id) else {
            return Ok(true);
        };
        Ok(task.blocked_by.iter().all(|blocker| {
            tasks
                .iter()
                .find(|t| &t.id == blocker)
                .is_none_or(|t| t.status == TaskStatus::Done)
        }))
    }

    async fn increment_attempts(&self, task_id: &str) -> DomainResult<u32> {
        let mut attempts = self.attempts.lock().unwrap();
        let n = attempts.entry(task_id.to_string()).or_insert(0);
        *n += 1;
        Ok(*n)
    }

    async fn cumulative_attempts(&self, task_id: &str) -> DomainResult<u32> {
        Ok(self.attempts(task_id))
    }
}

// ============================================================================
// Branch manager
// ============================================================================

/// Records every call; worktrees are plain directories.
#[derive(Debug, Default)]
pub struct CountingBranchManager {
    calls: Mutex<HashMap<&'static str, usize>>,
    commits: Mutex<HashMap<String, u32>>,
    changed: Mutex<Vec<String>>,
    fail_merge: AtomicBool,
}

impl CountingBranchManager {
    pub fn new() -> Self {
        Self {
            changed: Mutex::new(vec!["src/lib.rs".to_string()]),
            ..Self::default()
        }
    }

    pub fn set_commits(&self, branch: &str, n: u32) {
        self.commits.lock().unwrap().insert(branch.to_string(), n);
    }

    pub fn fail_merges(&self) {
        self.fail_merge.store(true, Ordering::SeqCst);
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    fn record(&self, op: &'static str) {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
    }
}

#[async_trait]
impl BranchManager for CountingBranchManager {
    async fn create_worktree(
        &self,
        _repo: &Path,
        _branch: &str,
        _base: &str,
        path: &Path,
    ) -> DomainResult<()> {
        self.record("create_worktree");
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn remove_worktree(&self, _repo: &Path, path: &Path) -> DomainResult<()> {
        self.record("remove_worktree");
        let _ = tokio::fs::remove_dir_all(path).await;
        Ok(())
    }

    async fn commit_all(&self, _worktree: &Path, _message: &str) -> DomainResult<bool> {
        self.record("commit_all");
        Ok(false)
    }

    async fn commits_ahead(&self, _repo: &Path, branch: &str, _base: &str) -> DomainResult<u32> {
        self.record("commits_ahead");
        Ok(self.commits.lock().unwrap().get(branch).copied().unwrap_or(0))
    }

    async fn diff(&self, _repo: &Path, branch: &str, _base: &str) -> DomainResult<String> {
        self.record("diff");
        Ok(format!("diff --git a/src/lib.rs b/src/lib.rs ({branch})\n"))
    }

    async fn merge(&self, _repo: &Path, _branch: &str, _base: &str) -> DomainResult<()> {
        self.record("merge");
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(DomainError::Git("merge conflict".to_string()));
        }
        Ok(())
    }

    async fn push(&self, _repo: &Path, _branch: &str) -> DomainResult<()> {
        self.record("push");
        Ok(())
    }

    async fn delete_branch(&self, _repo: &Path, _branch: &str) -> DomainResult<()> {
        self.record("delete_branch");
        Ok(())
    }

    async fn changed_files(
        &self,
        _repo: &Path,
        _branch: &str,
        _base: &str,
    ) -> DomainResult<Vec<String>> {
        self.record("changed_files");
        Ok(self.changed.lock().unwrap().clone())
    }
}

// ============================================================================
// Tests, settings, notifier
// ============================================================================

#[derive(Debug)]
pub struct StaticTestRunner {
    results: Mutex<TestResults>,
    runs: AtomicU32,
}

impl StaticTestRunner {
    pub fn passing() -> Self {
        Self {
            results: Mutex::new(TestResults {
                passed: 3,
                failed: 0,
                total: 3,
                output: "3 passed".to_string(),
            }),
            runs: AtomicU32::new(0),
        }
    }

    pub fn set_failing(&self, failed: u32) {
        *self.results.lock().unwrap() = TestResults {
            passed: 0,
            failed,
            total: failed,
            output: format!("{failed} failed"),
        };
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for StaticTestRunner {
    async fn run_scoped(&self, _worktree: &Path, _files: &[String]) -> DomainResult<TestResults> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.lock().unwrap().clone())
    }
}

#[derive(Debug)]
pub struct StaticSettings(pub Mutex<PipelineSettings>);

impl StaticSettings {
    pub fn new(review_required: bool) -> Self {
        Self(Mutex::new(PipelineSettings {
            review_required,
            ..PipelineSettings::default()
        }))
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn pipeline_settings(&self, _project_id: &str) -> DomainResult<PipelineSettings> {
        Ok(self.0.lock().unwrap().clone())
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    pub fn completed_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|n| matches!(n, Notification::TaskCompleted { .. }))
            .count()
    }

    pub fn statuses(&self, task_id: &str) -> Vec<TaskStatus> {
        self.events()
            .into_iter()
            .filter_map(|n| match n {
                Notification::TaskStatusChanged {
                    task_id: id, status, ..
                } if id == task_id => Some(status),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&self, notification: Notification) {
        self.events.lock().unwrap().push(notification);
    }
}

// ============================================================================
// Processes
// ============================================================================

#[derive(Debug)]
pub struct MockProcess {
    pid: u32,
    alive: AtomicBool,
    dies_on_terminate: AtomicBool,
    signals: Mutex<Vec<KillSignal>>,
}

impl MockProcess {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            alive: AtomicBool::new(true),
            dies_on_terminate: AtomicBool::new(true),
            signals: Mutex::new(Vec::new()),
        })
    }

    /// A process that ignores SIGTERM.
    pub fn stubborn(pid: u32) -> Arc<Self> {
        let process = Self::new(pid);
        process.dies_on_terminate.store(false, Ordering::SeqCst);
        process
    }

    pub fn die(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn signals(&self) -> Vec<KillSignal> {
        self.signals.lock().unwrap().clone()
    }
}

impl ProcessHandle for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn signal(&self, signal: KillSignal) -> DomainResult<()> {
        self.signals.lock().unwrap().push(signal);
        if signal == KillSignal::Kill || self.dies_on_terminate.load(Ordering::SeqCst) {
            self.die();
        }
        Ok(())
    }
}

/// One spawn recorded by [`MockSpawner`].
#[derive(Clone)]
pub struct Spawned {
    pub request: SpawnRequest,
    pub callbacks: SpawnCallbacks,
    pub process: Arc<MockProcess>,
}

#[derive(Default)]
pub struct MockSpawner {
    spawned: Mutex<Vec<Spawned>>,
    next_pid: AtomicU32,
    fail: AtomicBool,
}

impl MockSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        })
    }

    pub fn fail_spawns(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn last(&self) -> Spawned {
        self.spawned
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("nothing was spawned")
    }

    pub fn all(&self) -> Vec<Spawned> {
        self.spawned.lock().unwrap().clone()
    }

    /// Feed one output line to the most recent process.
    pub fn output(&self, line: &str) {
        let spawned = self.last();
        (spawned.callbacks.on_output)(line.to_string());
    }

    /// Exit the most recent process and run the exit callback to completion.
    pub async fn exit_last(&self, code: Option<i32>) {
        let spawned = self.last();
        spawned.process.die();
        (spawned.callbacks.on_exit)(code).await;
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(
        &self,
        request: SpawnRequest,
        callbacks: SpawnCallbacks,
    ) -> DomainResult<Arc<dyn ProcessHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DomainError::Spawn("binary not found".to_string()));
        }
        let process = MockProcess::new(self.next_pid.fetch_add(1, Ordering::SeqCst));
        self.spawned.lock().unwrap().push(Spawned {
            request,
            callbacks,
            process: Arc::clone(&process),
        });
        Ok(process)
    }
}

#[derive(Debug, Default)]
pub struct MockProbe {
    processes: Mutex<HashMap<u32, Arc<MockProcess>>>,
}

impl MockProbe {
    pub fn add(&self, process: Arc<MockProcess>) {
        self.processes.lock().unwrap().insert(process.pid(), process);
    }
}

impl ProcessProbe for MockProbe {
    fn attach(&self, pid: u32) -> Option<Arc<dyn ProcessHandle>> {
        let processes = self.processes.lock().unwrap();
        let process = processes.get(&pid)?;
        if process.is_alive() {
            Some(Arc::clone(process) as Arc<dyn ProcessHandle>)
        } else {
            None
        }
    }
}

// ============================================================================
// Recovery host
// ============================================================================

#[derive(Debug, Default)]
pub struct RecordingHost {
    pub slotted: Mutex<HashSet<String>>,
    pub timers: TimerRegistry,
    pub registered: Mutex<Vec<String>>,
    pub reattached: Mutex<Vec<ReattachedAgent>>,
    pub unregistered: Mutex<Vec<String>>,
    pub phases_done: Mutex<Vec<(String, String, Option<i32>)>>,
    pub advanced: Mutex<Vec<(String, AgentRole)>>,
    pub failed: Mutex<Vec<(String, String)>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_slotted(task_id: &str) -> Arc<Self> {
        let host = Self::default();
        host.slotted.lock().unwrap().insert(task_id.to_string());
        Arc::new(host)
    }
}

#[async_trait]
impl RecoveryHost for RecordingHost {
    fn slotted_task_ids(&self) -> HashSet<String> {
        self.slotted.lock().unwrap().clone()
    }

    fn active_agent_ids(&self) -> HashSet<String> {
        self.registered.lock().unwrap().iter().cloned().collect()
    }

    fn timers(&self) -> TimerRegistry {
        self.timers.clone()
    }

    async fn register_active(&self, agent: ReattachedAgent) {
        self.registered.lock().unwrap().push(agent.task_id.clone());
        self.reattached.lock().unwrap().push(agent);
    }

    fn unregister_active(&self, task_id: &str) {
        self.registered.lock().unwrap().retain(|id| id != task_id);
        self.unregistered.lock().unwrap().push(task_id.to_string());
    }

    async fn phase_done(&self, task: Task, phase: &str, exit_code: Option<i32>) {
        self.phases_done
            .lock()
            .unwrap()
            .push((task.id, phase.to_string(), exit_code));
    }

    async fn advance_to(&self, task: Task, role: AgentRole) {
        self.advanced.lock().unwrap().push((task.id, role));
    }

    async fn fail_task(&self, task_id: &str, reason: &str) {
        self.failed
            .lock()
            .unwrap()
            .push((task_id.to_string(), reason.to_string()));
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Doubles for the external world, real filesystem stores in a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub repo: PathBuf,
    pub layout: StateLayout,
    pub tracker: Arc<InMemoryTracker>,
    pub branches: Arc<CountingBranchManager>,
    pub tests: Arc<StaticTestRunner>,
    pub settings: Arc<StaticSettings>,
    pub notifier: Arc<RecordingNotifier>,
    pub spawner: Arc<MockSpawner>,
    pub probe: Arc<MockProbe>,
    pub state_store: Arc<JsonStateStore>,
    pub heartbeats: Arc<JsonHeartbeatStore>,
    pub assignments: Arc<FsAssignmentStore>,
    pub sessions: Arc<JsonSessionStore>,
    pub agent_config: AgentProcessConfig,
    pub recovery_config: RecoveryConfig,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo = dir.path().join("repo");
        let layout = StateLayout::new(dir.path().join("state"));
        Self {
            repo,
            tracker: Arc::new(InMemoryTracker::new()),
            branches: Arc::new(CountingBranchManager::new()),
            tests: Arc::new(StaticTestRunner::passing()),
            settings: Arc::new(StaticSettings::new(true)),
            notifier: Arc::new(RecordingNotifier::default()),
            spawner: MockSpawner::new(),
            probe: Arc::new(MockProbe::default()),
            state_store: Arc::new(JsonStateStore::new(layout.clone())),
            heartbeats: Arc::new(JsonHeartbeatStore::new(layout.clone())),
            assignments: Arc::new(FsAssignmentStore::new(layout.clone())),
            sessions: Arc::new(JsonSessionStore::new(layout.clone())),
            agent_config: AgentProcessConfig::default(),
            recovery_config: RecoveryConfig {
                poll_interval_secs: 1,
                kill_grace_secs: 0,
            },
            layout,
            dir,
        }
    }

    pub fn add_task(&self, id: &str) -> Task {
        let task = Task::new(id, PROJECT, format!("Task {id}"));
        self.tracker.add_task(task.clone());
        task
    }

    pub fn archiver(&self) -> Arc<SessionArchiver> {
        Arc::new(SessionArchiver::new(
            self.sessions.clone(),
            self.heartbeats.clone(),
            self.layout.clone(),
            ArchiveConfig::default(),
        ))
    }

    pub fn lifecycle(&self) -> Arc<AgentLifecycleManager> {
        Arc::new(AgentLifecycleManager::new(
            self.spawner.clone(),
            self.spawner.clone(),
            self.heartbeats.clone(),
            self.branches.clone(),
            self.notifier.clone(),
            self.agent_config.clone(),
        ))
    }

    pub fn recovery(&self) -> CrashRecovery {
        CrashRecovery::new(
            CrashRecoveryDeps {
                state_store: self.state_store.clone(),
                heartbeats: self.heartbeats.clone(),
                assignments: self.assignments.clone(),
                tracker: self.tracker.clone(),
                branches: self.branches.clone(),
                tests: self.tests.clone(),
                settings: self.settings.clone(),
                probe: self.probe.clone(),
                notifier: self.notifier.clone(),
                archiver: self.archiver(),
            },
            self.layout.clone(),
            self.agent_config.clone(),
            self.recovery_config.clone(),
        )
    }

    pub fn pipeline(&self, workflow: WorkflowDefinition) -> Arc<ProjectPipeline> {
        ProjectPipeline::new(
            PROJECT,
            self.repo.clone(),
            workflow,
            PipelineDeps {
                tracker: self.tracker.clone(),
                branches: self.branches.clone(),
                tests: self.tests.clone(),
                settings: self.settings.clone(),
                assignments: self.assignments.clone(),
                state_store: self.state_store.clone(),
                notifier: self.notifier.clone(),
                lifecycle: self.lifecycle(),
                archiver: self.archiver(),
            },
            self.layout.clone(),
        )
    }

    /// Write the agent's result file for a task.
    pub async fn write_result(&self, task_id: &str, json: &str) {
        let path = self.assignments.result_path(PROJECT, task_id);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, json).await.unwrap();
    }

    /// An assignment record as a running step would have left it.
    pub fn assignment(&self, task_id: &str, phase: &str, attempt: u32) -> TaskAssignment {
        TaskAssignment {
            task_id: task_id.to_string(),
            project_id: PROJECT.to_string(),
            phase: phase.to_string(),
            branch_name: format!("shepherd/{task_id}"),
            worktree_path: self.layout.worktree_path(PROJECT, task_id),
            prompt_path: self.assignments.prompt_path(PROJECT, task_id),
            agent_config: AgentConfig {
                command: "agent".to_string(),
                args: vec![],
                model: "sonnet".to_string(),
            },
            attempt,
            created_at: Utc::now(),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
