//! Composition root.
//!
//! Builds the production adapters from [`Config`] and owns one
//! [`ProjectPipeline`] per registered project plus the watchdog that
//! reconciles them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tracing::{info, instrument, warn};

use crate::adapters::{
    CommandTestRunner, ConfigSettingsProvider, FsAssignmentStore, GitCliBranchManager,
    JsonHeartbeatStore, JsonSessionStore, JsonStateStore, OsProcessProbe, OsProcessSpawner,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Config;
use crate::domain::ports::{
    AssignmentStore, BranchManager, IssueTracker, Notifier, SettingsProvider, StateStore,
    TestRunner,
};
use crate::infrastructure::layout::StateLayout;
use crate::services::agent_lifecycle::AgentLifecycleManager;
use crate::services::crash_recovery::{CrashRecovery, CrashRecoveryDeps, RecoveryReport};
use crate::services::event_bus::EventBus;
use crate::services::pipeline::{PipelineDeps, ProjectPipeline};
use crate::services::session_archive::SessionArchiver;
use crate::services::timer_registry::TimerRegistry;
use crate::services::watchdog::{ListTargets, WatchTarget, Watchdog, WatchdogPass};
use crate::services::workflow_engine::load_workflow;

type Pipelines = Arc<Mutex<HashMap<String, Arc<ProjectPipeline>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Supervisor {
    layout: StateLayout,
    tracker: Arc<dyn IssueTracker>,
    branches: Arc<dyn BranchManager>,
    tests: Arc<dyn TestRunner>,
    settings: Arc<dyn SettingsProvider>,
    assignments: Arc<dyn AssignmentStore>,
    state_store: Arc<dyn StateStore>,
    events: Arc<EventBus>,
    lifecycle: Arc<AgentLifecycleManager>,
    archiver: Arc<SessionArchiver>,
    recovery: Arc<CrashRecovery>,
    pipelines: Pipelines,
    watchdog: Watchdog,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state_dir", &self.layout.root())
            .field("projects", &self.project_ids())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Wire the filesystem stores, git, OS processes and the event bus.
    ///
    /// The issue tracker is external and always supplied by the caller.
    pub fn from_config(config: &Config, tracker: Arc<dyn IssueTracker>) -> Self {
        let layout = StateLayout::new(config.state_dir.clone());

        let state_store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(layout.clone()));
        let heartbeats = Arc::new(JsonHeartbeatStore::new(layout.clone()));
        let assignments: Arc<dyn AssignmentStore> =
            Arc::new(FsAssignmentStore::new(layout.clone()));
        let sessions = Arc::new(JsonSessionStore::new(layout.clone()));
        let branches: Arc<dyn BranchManager> = Arc::new(GitCliBranchManager::new());
        let tests: Arc<dyn TestRunner> =
            Arc::new(CommandTestRunner::new(config.pipeline.test_command.clone()));
        let settings: Arc<dyn SettingsProvider> =
            Arc::new(ConfigSettingsProvider::new(config.pipeline.clone()));
        let spawner =
            Arc::new(OsProcessSpawner::new().with_tail_interval(config.agent.tail_interval()));
        let events = Arc::new(EventBus::default());
        let notifier: Arc<dyn Notifier> = events.clone();

        let archiver = Arc::new(SessionArchiver::new(
            sessions,
            heartbeats.clone(),
            layout.clone(),
            config.archive.clone(),
        ));
        let lifecycle = Arc::new(AgentLifecycleManager::new(
            spawner.clone(),
            spawner,
            heartbeats.clone(),
            branches.clone(),
            notifier.clone(),
            config.agent.clone(),
        ));
        let recovery = Arc::new(CrashRecovery::new(
            CrashRecoveryDeps {
                state_store: state_store.clone(),
                heartbeats,
                assignments: assignments.clone(),
                tracker: tracker.clone(),
                branches: branches.clone(),
                tests: tests.clone(),
                settings: settings.clone(),
                probe: Arc::new(OsProcessProbe::new()),
                notifier,
                archiver: archiver.clone(),
            },
            layout.clone(),
            config.agent.clone(),
            config.recovery.clone(),
        ));

        let pipelines: Pipelines = Arc::new(Mutex::new(HashMap::new()));
        let watchdog = Watchdog::new(
            recovery.clone(),
            watch_targets(pipelines.clone()),
            TimerRegistry::new(),
            Duration::from_secs(config.watchdog.interval_secs.max(1)),
        );

        Self {
            layout,
            tracker,
            branches,
            tests,
            settings,
            assignments,
            state_store,
            events,
            lifecycle,
            archiver,
            recovery,
            pipelines,
            watchdog,
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Bus every pipeline publishes on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn recovery(&self) -> &Arc<CrashRecovery> {
        &self.recovery
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.pipelines).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pipeline(&self, project_id: &str) -> Option<Arc<ProjectPipeline>> {
        lock(&self.pipelines).get(project_id).cloned()
    }

    /// Register a project, loading its workflow from the state directory.
    ///
    /// Registering an id twice returns the existing pipeline.
    #[instrument(skip(self, repo), fields(repo = %repo.display()))]
    pub async fn add_project(
        &self,
        project_id: &str,
        repo: &Path,
    ) -> DomainResult<Arc<ProjectPipeline>> {
        let unsafe_name = project_id.contains(['/', '\\']) || project_id.starts_with('.');
        if project_id.is_empty() || unsafe_name {
            return Err(DomainError::InvalidProject(project_id.to_string()));
        }
        if let Some(existing) = self.pipeline(project_id) {
            return Ok(existing);
        }

        let workflow = load_workflow(&self.layout.workflow_file(project_id)).await?;
        let pipeline = ProjectPipeline::new(
            project_id,
            repo,
            workflow,
            PipelineDeps {
                tracker: self.tracker.clone(),
                branches: self.branches.clone(),
                tests: self.tests.clone(),
                settings: self.settings.clone(),
                assignments: self.assignments.clone(),
                state_store: self.state_store.clone(),
                notifier: self.events.clone(),
                lifecycle: self.lifecycle.clone(),
                archiver: self.archiver.clone(),
            },
            self.layout.clone(),
        );

        let mut pipelines = lock(&self.pipelines);
        let pipeline = pipelines
            .entry(project_id.to_string())
            .or_insert(pipeline)
            .clone();
        info!(project_id, "Project registered");
        Ok(pipeline)
    }

    /// Run crash recovery for every registered project.
    ///
    /// A failing project is logged and reported; the rest still recover.
    pub async fn recover_all(&self) -> Vec<DomainResult<RecoveryReport>> {
        let pipelines: Vec<Arc<ProjectPipeline>> = {
            let map = lock(&self.pipelines);
            let mut ids: Vec<&String> = map.keys().collect();
            ids.sort();
            ids.into_iter().map(|id| map[id].clone()).collect()
        };

        let mut reports = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let report = pipeline.recover(&self.recovery).await;
            if let Err(e) = &report {
                warn!(project_id = pipeline.project_id(), error = %e, "Startup recovery failed");
            }
            reports.push(report);
        }
        reports
    }

    /// Recover every project, then start the watchdog.
    pub async fn start(&self) -> Vec<DomainResult<RecoveryReport>> {
        let reports = self.recover_all().await;
        self.watchdog.start();
        reports
    }

    pub fn stop(&self) -> bool {
        self.watchdog.stop()
    }

    /// One reconciliation pass over every registered project.
    pub async fn reconcile(&self) -> WatchdogPass {
        self.watchdog.run_pass().await
    }
}

fn watch_targets(pipelines: Pipelines) -> ListTargets {
    Arc::new(move || {
        let mut targets: Vec<WatchTarget> = lock(&pipelines)
            .values()
            .map(|pipeline| WatchTarget {
                project_id: pipeline.project_id().to_string(),
                repo_path: pipeline.repo().to_path_buf(),
                host: pipeline.as_host(),
            })
            .collect();
        targets.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        async move { targets }.boxed()
    })
}
