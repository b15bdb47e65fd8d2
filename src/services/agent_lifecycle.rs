//! Agent lifecycle manager.
//!
//! Runs one agent process for one workflow step: spawns it through the
//! role's spawner, streams its output into a byte-capped log, writes
//! heartbeats, watches for silence and death, and reports completion to the
//! caller exactly once no matter which of natural exit, dead-pid detection
//! or post-timeout kill gets there first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentProcessConfig, AgentRole, HeartbeatRecord, Notification};
use crate::domain::ports::{
    BranchManager, HeartbeatStore, KillSignal, Notifier, OutputCallback, ProcessHandle,
    ProcessSpawner, SpawnCallbacks, SpawnRequest,
};
use crate::infrastructure::log_tail::LogTail;
use crate::services::output_log::OutputLog;
use crate::services::timer_registry::TimerRegistry;

pub const HEARTBEAT_TIMER: &str = "heartbeat";
pub const INACTIVITY_TIMER: &str = "inactivity";
pub const KILL_GRACE_TIMER: &str = "kill-grace";
pub const TAIL_TIMER: &str = "tail";

/// Invoked once per attempt with the exit code (`None` when unknown).
pub type CompletionCallback = Arc<dyn Fn(Option<i32>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Single-assignment latch guarding completion side effects.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    fired: AtomicBool,
}

impl CompletionLatch {
    /// Set the latch. Returns `true` only for the caller that set it.
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.fired.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct RunStateInner {
    active_process: Option<Arc<dyn ProcessHandle>>,
    last_output_at: DateTime<Utc>,
    last_output_instant: Instant,
    output_log: OutputLog,
    started_at: Option<DateTime<Utc>>,
}

/// Mutable state of the attempt currently running for a project.
///
/// Shared between the driving loop and the lifecycle manager. The exit
/// latch is reset at the start of each attempt and set exactly once when
/// the attempt completes.
#[derive(Debug)]
pub struct AgentRunState {
    inner: Mutex<RunStateInner>,
    exit_handled: CompletionLatch,
    killed_due_to_timeout: AtomicBool,
}

impl AgentRunState {
    pub fn new(output_cap_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(RunStateInner {
                active_process: None,
                last_output_at: Utc::now(),
                last_output_instant: Instant::now(),
                output_log: OutputLog::new(output_cap_bytes),
                started_at: None,
            }),
            exit_handled: CompletionLatch::default(),
            killed_due_to_timeout: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunStateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fresh attempt: clear the latch, the log and the timeout flag.
    pub fn reset(&self) {
        {
            let mut inner = self.lock();
            inner.active_process = None;
            inner.output_log.clear();
            inner.started_at = Some(Utc::now());
            inner.last_output_at = Utc::now();
            inner.last_output_instant = Instant::now();
        }
        self.exit_handled.reset();
        self.killed_due_to_timeout.store(false, Ordering::Release);
    }

    pub fn process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.lock().active_process.clone()
    }

    fn set_process(&self, process: Arc<dyn ProcessHandle>) {
        self.lock().active_process = Some(process);
    }

    /// Record a freshly spawned handle unless the attempt already completed.
    ///
    /// The latch is checked under the same lock `finish` takes to clear the
    /// handle, so a dead handle is never left behind.
    fn attach_process(&self, process: Arc<dyn ProcessHandle>) -> bool {
        let mut inner = self.lock();
        inner.active_process = Some(process);
        if self.exit_handled.is_fired() {
            inner.active_process = None;
            return false;
        }
        true
    }

    fn take_process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.lock().active_process.take()
    }

    fn record_output(&self, chunk: String) {
        let mut inner = self.lock();
        inner.output_log.push(chunk);
        inner.last_output_at = Utc::now();
        inner.last_output_instant = Instant::now();
    }

    /// Append earlier output without counting it as activity.
    fn preload_output(&self, backlog: String) {
        if !backlog.is_empty() {
            self.lock().output_log.push(backlog);
        }
    }

    /// Backdate the last-output marker to a timestamp recovered from disk.
    fn set_last_output(&self, at: DateTime<Utc>) {
        let age = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
        let mut inner = self.lock();
        inner.last_output_at = at;
        inner.last_output_instant = Instant::now()
            .checked_sub(age)
            .unwrap_or_else(Instant::now);
    }

    pub fn last_output_at(&self) -> DateTime<Utc> {
        self.lock().last_output_at
    }

    /// Time since the agent last produced output.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_output_instant.elapsed()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn output(&self) -> String {
        self.lock().output_log.contents()
    }

    pub fn output_bytes(&self) -> usize {
        self.lock().output_log.bytes()
    }

    pub fn exit_handled(&self) -> bool {
        self.exit_handled.is_fired()
    }

    pub fn killed_due_to_timeout(&self) -> bool {
        self.killed_due_to_timeout.load(Ordering::Acquire)
    }
}

/// One attempt to run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub spawn: SpawnRequest,
    /// Workflow step id.
    pub phase: String,
    pub attempt: u32,
}

/// Cancels the timers started for a reattached agent.
#[derive(Debug, Clone)]
pub struct MonitorStop {
    timers: TimerRegistry,
    names: &'static [&'static str],
}

impl MonitorStop {
    /// Clears the tail timer, plus the heartbeat timer of an observed agent.
    pub fn stop(&self) {
        for name in self.names {
            self.timers.clear(name);
        }
    }
}

/// Everything a running attempt's callbacks and timers need.
struct Monitor {
    params: RunParams,
    run_state: Arc<AgentRunState>,
    timers: TimerRegistry,
    heartbeats: Arc<dyn HeartbeatStore>,
    branches: Arc<dyn BranchManager>,
    notifier: Arc<dyn Notifier>,
    config: AgentProcessConfig,
    on_complete: CompletionCallback,
}

impl Monitor {
    fn project_id(&self) -> &str {
        &self.params.spawn.project_id
    }

    fn task_id(&self) -> &str {
        &self.params.spawn.task_id
    }

    fn on_output(self: &Arc<Self>) -> OutputCallback {
        let monitor = Arc::clone(self);
        Arc::new(move |chunk: String| {
            monitor.run_state.record_output(chunk.clone());
            monitor.notifier.emit(Notification::OutputChunk {
                project_id: monitor.project_id().to_string(),
                task_id: monitor.task_id().to_string(),
                chunk,
            });
        })
    }

    /// Completion path shared by every exit signal.
    async fn finish(&self, exit_code: Option<i32>) {
        if !self.run_state.exit_handled.try_fire() {
            debug!(
                task_id = %self.task_id(),
                ?exit_code,
                "Completion already handled, ignoring"
            );
            return;
        }

        self.run_state.take_process();
        self.stop_timers();

        if let Err(e) = self.heartbeats.delete(self.project_id(), self.task_id()).await {
            warn!(task_id = %self.task_id(), error = %e, "Failed to delete heartbeat file");
        }

        info!(
            project_id = %self.project_id(),
            task_id = %self.task_id(),
            phase = %self.params.phase,
            ?exit_code,
            killed_due_to_timeout = self.run_state.killed_due_to_timeout(),
            "Agent attempt completed"
        );
        self.notifier.emit(Notification::TaskCompleted {
            project_id: self.project_id().to_string(),
            task_id: self.task_id().to_string(),
            phase: self.params.phase.clone(),
            exit_code,
            at: Utc::now(),
        });

        (self.on_complete)(exit_code).await;
    }

    fn stop_timers(&self) {
        for name in [HEARTBEAT_TIMER, INACTIVITY_TIMER, KILL_GRACE_TIMER, TAIL_TIMER] {
            self.timers.clear(name);
        }
    }

    async fn write_heartbeat(&self) {
        let Some(process) = self.run_state.process() else {
            return;
        };
        let record = HeartbeatRecord {
            pid: process.pid(),
            last_output_timestamp: self.run_state.last_output_at(),
            heartbeat_timestamp: Utc::now(),
        };
        if let Err(e) = self
            .heartbeats
            .write(self.project_id(), self.task_id(), &record)
            .await
        {
            debug!(task_id = %self.task_id(), error = %e, "Heartbeat write failed");
        }
    }

    /// Best-effort commit so a dying or killed agent never loses work.
    async fn commit_uncommitted_work(&self, reason: &str) {
        let message = format!("shepherd: save uncommitted work ({reason})");
        match self
            .branches
            .commit_all(&self.params.spawn.working_dir, &message)
            .await
        {
            Ok(true) => info!(task_id = %self.task_id(), reason, "Committed uncommitted work"),
            Ok(false) => debug!(task_id = %self.task_id(), "No uncommitted work to save"),
            Err(e) => warn!(task_id = %self.task_id(), error = %e, "Safety-net commit failed"),
        }
    }

    async fn check_inactivity(self: Arc<Self>) {
        if self.run_state.exit_handled() {
            return;
        }
        let Some(process) = self.run_state.process() else {
            return;
        };

        if !process.is_alive() {
            warn!(
                task_id = %self.task_id(),
                pid = process.pid(),
                "Agent process is gone without reporting an exit"
            );
            self.commit_uncommitted_work("agent process died").await;
            self.finish(None).await;
            return;
        }

        let idle = self.run_state.idle_for();
        if idle <= self.config.inactivity_timeout() || self.run_state.killed_due_to_timeout() {
            return;
        }

        warn!(
            task_id = %self.task_id(),
            pid = process.pid(),
            idle_secs = idle.as_secs(),
            "Agent inactive beyond timeout, terminating"
        );
        self.commit_uncommitted_work("agent timed out").await;
        self.run_state
            .killed_due_to_timeout
            .store(true, Ordering::Release);
        if let Err(e) = process.signal(KillSignal::Terminate) {
            warn!(pid = process.pid(), error = %e, "Terminate signal failed");
        }

        let run_state = Arc::clone(&self.run_state);
        self.timers
            .set_timeout(KILL_GRACE_TIMER, self.config.kill_grace(), move || async move {
                if run_state.exit_handled() {
                    return;
                }
                if let Some(process) = run_state.process() {
                    if process.is_alive() {
                        warn!(pid = process.pid(), "Agent ignored terminate, killing");
                        if let Err(e) = process.signal(KillSignal::Kill) {
                            warn!(pid = process.pid(), error = %e, "Kill signal failed");
                        }
                    }
                }
            });
    }

    fn start_timers(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        self.timers
            .set_interval(HEARTBEAT_TIMER, self.config.heartbeat_interval(), move || {
                let monitor = Arc::clone(&monitor);
                async move { monitor.write_heartbeat().await }
            });

        let monitor = Arc::clone(self);
        self.timers.set_interval(
            INACTIVITY_TIMER,
            self.config.inactivity_check_interval(),
            move || Arc::clone(&monitor).check_inactivity(),
        );
    }
}

/// Spawns and supervises agent processes.
pub struct AgentLifecycleManager {
    coder_spawner: Arc<dyn ProcessSpawner>,
    reviewer_spawner: Arc<dyn ProcessSpawner>,
    heartbeats: Arc<dyn HeartbeatStore>,
    branches: Arc<dyn BranchManager>,
    notifier: Arc<dyn Notifier>,
    config: AgentProcessConfig,
}

impl AgentLifecycleManager {
    pub fn new(
        coder_spawner: Arc<dyn ProcessSpawner>,
        reviewer_spawner: Arc<dyn ProcessSpawner>,
        heartbeats: Arc<dyn HeartbeatStore>,
        branches: Arc<dyn BranchManager>,
        notifier: Arc<dyn Notifier>,
        config: AgentProcessConfig,
    ) -> Self {
        Self {
            coder_spawner,
            reviewer_spawner,
            heartbeats,
            branches,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &AgentProcessConfig {
        &self.config
    }

    fn spawner_for(&self, role: AgentRole) -> DomainResult<&Arc<dyn ProcessSpawner>> {
        match role {
            AgentRole::Coder => Ok(&self.coder_spawner),
            AgentRole::Reviewer => Ok(&self.reviewer_spawner),
            AgentRole::Merger => Err(DomainError::Spawn(
                "merge steps run in-process, not as agents".to_string(),
            )),
        }
    }

    fn monitor(
        &self,
        params: RunParams,
        run_state: Arc<AgentRunState>,
        timers: &TimerRegistry,
        on_complete: CompletionCallback,
    ) -> Arc<Monitor> {
        Arc::new(Monitor {
            params,
            run_state,
            timers: timers.clone(),
            heartbeats: Arc::clone(&self.heartbeats),
            branches: Arc::clone(&self.branches),
            notifier: Arc::clone(&self.notifier),
            config: self.config.clone(),
            on_complete,
        })
    }

    /// Spawn an agent for one attempt and supervise it until completion.
    ///
    /// `on_complete` fires exactly once with the exit code. When spawning
    /// fails no timers are left behind and `on_complete` never fires.
    #[instrument(skip_all, fields(project_id = %params.spawn.project_id, task_id = %params.spawn.task_id, phase = %params.phase))]
    pub fn run(
        &self,
        params: RunParams,
        run_state: Arc<AgentRunState>,
        timers: &TimerRegistry,
        on_complete: CompletionCallback,
    ) -> DomainResult<Arc<dyn ProcessHandle>> {
        let spawner = Arc::clone(self.spawner_for(params.spawn.role)?);
        run_state.reset();

        self.notifier.emit(Notification::TaskStarted {
            project_id: params.spawn.project_id.clone(),
            task_id: params.spawn.task_id.clone(),
            phase: params.phase.clone(),
            attempt: params.attempt,
            at: Utc::now(),
        });

        let request = params.spawn.clone();
        let monitor = self.monitor(params, Arc::clone(&run_state), timers, on_complete);

        let exit_monitor = Arc::clone(&monitor);
        let callbacks = SpawnCallbacks {
            on_output: monitor.on_output(),
            on_exit: Arc::new(move |code: Option<i32>| {
                let monitor = Arc::clone(&exit_monitor);
                async move { monitor.finish(code).await }.boxed()
            }),
        };

        let process = spawner.spawn(request, callbacks)?;
        info!(pid = process.pid(), "Agent spawned");

        // The process may already have exited and completed the attempt.
        if run_state.attach_process(Arc::clone(&process)) {
            monitor.start_timers();
            if run_state.exit_handled() {
                monitor.stop_timers();
            }
        }
        Ok(process)
    }

    /// Reattach to an agent that survived a supervisor restart.
    ///
    /// Tails the agent's output file instead of its pipes and restarts the
    /// heartbeat and inactivity timers against the existing handle. Death is
    /// detected by the inactivity timer, since there is no exit callback for
    /// a process this supervisor did not spawn.
    #[instrument(skip_all, fields(project_id = %params.spawn.project_id, task_id = %params.spawn.task_id, pid = handle.pid()))]
    pub fn resume_monitoring(
        &self,
        handle: Arc<dyn ProcessHandle>,
        params: RunParams,
        run_state: Arc<AgentRunState>,
        timers: &TimerRegistry,
        last_output_at: Option<DateTime<Utc>>,
        on_complete: CompletionCallback,
    ) -> MonitorStop {
        let monitor = self.reattach(handle, params, run_state, timers, last_output_at, on_complete);
        monitor.start_timers();
        info!("Resumed monitoring of running agent");
        MonitorStop {
            timers: timers.clone(),
            names: &[TAIL_TIMER],
        }
    }

    /// Follow a reattached agent's output and keep its heartbeat fresh,
    /// leaving exit and inactivity decisions to the caller.
    ///
    /// Used when crash recovery polls the agent itself.
    #[instrument(skip_all, fields(project_id = %params.spawn.project_id, task_id = %params.spawn.task_id, pid = handle.pid()))]
    pub fn observe(
        &self,
        handle: Arc<dyn ProcessHandle>,
        params: RunParams,
        run_state: Arc<AgentRunState>,
        timers: &TimerRegistry,
        last_output_at: Option<DateTime<Utc>>,
    ) -> MonitorStop {
        let on_complete: CompletionCallback = Arc::new(|_| async {}.boxed());
        let monitor = self.reattach(handle, params, run_state, timers, last_output_at, on_complete);
        let heartbeat = Arc::clone(&monitor);
        timers.set_interval(HEARTBEAT_TIMER, self.config.heartbeat_interval(), move || {
            let monitor = Arc::clone(&heartbeat);
            async move { monitor.write_heartbeat().await }
        });
        info!("Observing reattached agent");
        MonitorStop {
            timers: timers.clone(),
            names: &[TAIL_TIMER, HEARTBEAT_TIMER],
        }
    }

    /// Reset the run state around an existing handle and start tailing.
    ///
    /// Output already in the file becomes backlog: it is kept for the
    /// session record but does not count as activity.
    fn reattach(
        &self,
        handle: Arc<dyn ProcessHandle>,
        params: RunParams,
        run_state: Arc<AgentRunState>,
        timers: &TimerRegistry,
        last_output_at: Option<DateTime<Utc>>,
        on_complete: CompletionCallback,
    ) -> Arc<Monitor> {
        run_state.reset();
        if let Some(at) = last_output_at {
            run_state.set_last_output(at);
        }
        run_state.set_process(handle);

        let output_path = params.spawn.output_log_path.clone();
        let tail = Arc::new(tokio::sync::Mutex::new(LogTail::from_end(&output_path)));
        let monitor = self.monitor(params, Arc::clone(&run_state), timers, on_complete);
        let on_output = monitor.on_output();
        let backlog_loaded = Arc::new(AtomicBool::new(false));

        timers.set_interval(TAIL_TIMER, self.config.tail_interval(), move || {
            let tail = Arc::clone(&tail);
            let on_output = Arc::clone(&on_output);
            let run_state = Arc::clone(&run_state);
            let backlog_loaded = Arc::clone(&backlog_loaded);
            let path = output_path.clone();
            async move {
                let mut tail = tail.lock().await;
                if !backlog_loaded.swap(true, Ordering::AcqRel) {
                    match tail.read_backlog(&path).await {
                        Ok(backlog) => run_state.preload_output(backlog),
                        Err(e) => debug!(path = %path.display(), error = %e, "Output backlog unreadable"),
                    }
                }
                let lines = match tail.read_lines(&path).await {
                    Ok(lines) => lines,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Output tail read failed");
                        return;
                    }
                };
                for line in lines {
                    on_output(line);
                }
            }
        });
        monitor
    }
}
