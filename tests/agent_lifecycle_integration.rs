//! Integration tests for the agent lifecycle manager.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;

use common::{wait_for, Harness, PROJECT};
use shepherd::domain::models::{AgentConfig, AgentRole, Notification};
use shepherd::domain::ports::{KillSignal, ProcessHandle, SpawnRequest};
use shepherd::services::agent_lifecycle::{
    CompletionCallback, HEARTBEAT_TIMER, INACTIVITY_TIMER, TAIL_TIMER,
};
use shepherd::services::{AgentRunState, RunParams, TimerRegistry};

fn params(h: &Harness, task_id: &str, role: AgentRole) -> RunParams {
    RunParams {
        spawn: SpawnRequest {
            project_id: PROJECT.to_string(),
            task_id: task_id.to_string(),
            role,
            working_dir: h.layout.worktree_path(PROJECT, task_id),
            prompt_path: h.layout.task_dir(PROJECT, task_id).join("prompt.md"),
            output_log_path: h.layout.task_dir(PROJECT, task_id).join("output.log"),
            agent_config: AgentConfig {
                command: "agent".to_string(),
                args: vec![],
                model: "sonnet".to_string(),
            },
        },
        phase: "code".to_string(),
        attempt: 1,
    }
}

/// Completion callback that records every exit code it sees.
fn recorder() -> (CompletionCallback, Arc<Mutex<Vec<Option<i32>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: CompletionCallback = Arc::new(move |code| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(code);
        }
        .boxed()
    });
    (callback, seen)
}

#[tokio::test]
async fn test_double_exit_completes_once() {
    let h = Harness::new();
    let lifecycle = h.lifecycle();
    let timers = TimerRegistry::new();
    let run_state = Arc::new(AgentRunState::new(1024));
    let (on_complete, seen) = recorder();

    lifecycle
        .run(params(&h, "T-1", AgentRole::Coder), run_state.clone(), &timers, on_complete)
        .unwrap();

    h.spawner.exit_last(Some(0)).await;
    h.spawner.exit_last(Some(0)).await;

    assert_eq!(*seen.lock().unwrap(), vec![Some(0)]);
    assert_eq!(h.notifier.completed_count(), 1);
    assert!(run_state.exit_handled());
    assert!(run_state.process().is_none());
}

#[tokio::test]
async fn test_run_registers_and_clears_timers() {
    let h = Harness::new();
    let lifecycle = h.lifecycle();
    let timers = TimerRegistry::new();
    let run_state = Arc::new(AgentRunState::new(1024));
    let (on_complete, _seen) = recorder();

    let handle = lifecycle
        .run(params(&h, "T-1", AgentRole::Coder), run_state.clone(), &timers, on_complete)
        .unwrap();

    assert!(timers.has(HEARTBEAT_TIMER));
    assert!(timers.has(INACTIVITY_TIMER));
    assert_eq!(run_state.process().map(|p| p.pid()), Some(handle.pid()));

    h.spawner.exit_last(Some(1)).await;
    assert!(!timers.has(HEARTBEAT_TIMER));
    assert!(!timers.has(INACTIVITY_TIMER));
    assert!(timers.names().is_empty());
}

#[tokio::test]
async fn test_spawn_failure_leaves_nothing_behind() {
    let h = Harness::new();
    h.spawner.fail_spawns();
    let lifecycle = h.lifecycle();
    let timers = TimerRegistry::new();
    let (on_complete, seen) = recorder();

    let result = lifecycle.run(
        params(&h, "T-1", AgentRole::Coder),
        Arc::new(AgentRunState::new(1024)),
        &timers,
        on_complete,
    );

    assert!(result.is_err());
    assert!(timers.names().is_empty());
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_merger_role_is_not_spawned() {
    let h = Harness::new();
    let (on_complete, _seen) = recorder();
    let result = h.lifecycle().run(
        params(&h, "T-1", AgentRole::Merger),
        Arc::new(AgentRunState::new(1024)),
        &TimerRegistry::new(),
        on_complete,
    );
    assert!(result.is_err());
    assert_eq!(h.spawner.count(), 0);
}

#[tokio::test]
async fn test_output_is_logged_and_forwarded() {
    let h = Harness::new();
    let lifecycle = h.lifecycle();
    let run_state = Arc::new(AgentRunState::new(1024));
    let (on_complete, _seen) = recorder();

    lifecycle
        .run(
            params(&h, "T-1", AgentRole::Reviewer),
            run_state.clone(),
            &TimerRegistry::new(),
            on_complete,
        )
        .unwrap();
    h.spawner.output("compiling");
    h.spawner.output("done");

    assert!(run_state.output().contains("compiling"));
    assert!(run_state.output().contains("done"));
    let chunks = h
        .notifier
        .events()
        .into_iter()
        .filter(|n| matches!(n, Notification::OutputChunk { .. }))
        .count();
    assert_eq!(chunks, 2);
    assert_eq!(h.spawner.last().request.role, AgentRole::Reviewer);
}

#[tokio::test]
async fn test_dead_process_is_detected_without_exit_callback() {
    let mut h = Harness::new();
    h.agent_config.inactivity_check_interval_secs = 1;
    let lifecycle = h.lifecycle();
    let timers = TimerRegistry::new();
    let (on_complete, seen) = recorder();

    lifecycle
        .run(
            params(&h, "T-1", AgentRole::Coder),
            Arc::new(AgentRunState::new(1024)),
            &timers,
            on_complete,
        )
        .unwrap();
    h.spawner.last().process.die();

    let done = wait_for(|| !seen.lock().unwrap().is_empty(), 5_000).await;
    assert!(done, "dead process was never detected");
    assert_eq!(*seen.lock().unwrap(), vec![None]);
    assert_eq!(h.branches.count("commit_all"), 1);
    assert!(timers.names().is_empty());
}

#[tokio::test]
async fn test_silent_agent_is_terminated() {
    let mut h = Harness::new();
    h.agent_config.inactivity_check_interval_secs = 1;
    h.agent_config.inactivity_timeout_secs = 1;
    h.agent_config.kill_grace_secs = 1;
    let lifecycle = h.lifecycle();
    let run_state = Arc::new(AgentRunState::new(1024));
    let (on_complete, seen) = recorder();

    lifecycle
        .run(
            params(&h, "T-1", AgentRole::Coder),
            run_state.clone(),
            &TimerRegistry::new(),
            on_complete,
        )
        .unwrap();
    let process = h.spawner.last().process;

    let killed = wait_for(|| run_state.killed_due_to_timeout(), 5_000).await;
    assert!(killed, "silent agent was never terminated");
    assert_eq!(process.signals()[0], KillSignal::Terminate);
    assert!(!process.is_alive());

    // The next inactivity check sees the dead pid and completes the attempt.
    let done = wait_for(|| !seen.lock().unwrap().is_empty(), 5_000).await;
    assert!(done);
    assert_eq!(*seen.lock().unwrap(), vec![None]);
}

#[tokio::test]
async fn test_resume_monitoring_tails_output_file() {
    let mut h = Harness::new();
    h.agent_config.tail_interval_ms = 20;
    let lifecycle = h.lifecycle();
    let timers = TimerRegistry::new();
    let run_state = Arc::new(AgentRunState::new(1024));
    let (on_complete, _seen) = recorder();
    let process = common::MockProcess::new(555);
    let p = params(&h, "T-1", AgentRole::Coder);
    tokio::fs::create_dir_all(p.spawn.output_log_path.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&p.spawn.output_log_path, "before restart\n")
        .await
        .unwrap();

    let stop = lifecycle.resume_monitoring(
        process.clone(),
        p,
        run_state.clone(),
        &timers,
        None,
        on_complete,
    );

    assert!(timers.has(TAIL_TIMER));
    assert!(timers.has(HEARTBEAT_TIMER));
    assert!(timers.has(INACTIVITY_TIMER));
    let tailed = wait_for(|| run_state.output().contains("before restart"), 2_000).await;
    assert!(tailed, "output file was never tailed");

    stop.stop();
    assert!(!timers.has(TAIL_TIMER));
}

#[tokio::test]
async fn test_completion_runs_once_across_concurrent_exits() {
    let h = Harness::new();
    let lifecycle = h.lifecycle();
    let counter = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&counter);
    let on_complete: CompletionCallback = Arc::new(move |_| {
        let sink = Arc::clone(&sink);
        async move {
            sink.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    });

    lifecycle
        .run(
            params(&h, "T-1", AgentRole::Coder),
            Arc::new(AgentRunState::new(1024)),
            &TimerRegistry::new(),
            on_complete,
        )
        .unwrap();
    let spawned = h.spawner.last();

    let exits: Vec<_> = (0..8)
        .map(|i| {
            let on_exit = Arc::clone(&spawned.callbacks.on_exit);
            tokio::spawn(async move { on_exit(Some(i)).await })
        })
        .collect();
    for exit in exits {
        exit.await.unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
