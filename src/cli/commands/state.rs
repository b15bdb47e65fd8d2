//! Persisted orchestrator state inspection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};

use crate::adapters::fs::{JsonHeartbeatStore, JsonStateStore};
use crate::adapters::process::pid_alive;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, HeartbeatRecord, PersistedOrchestratorState};
use crate::domain::ports::{HeartbeatStore, StateStore};
use crate::infrastructure::layout::StateLayout;

#[derive(Args, Debug)]
pub struct StateArgs {
    #[command(subcommand)]
    pub command: StateCommands,
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the persisted snapshot of a project
    Show {
        /// Project id
        #[arg(long)]
        project: String,
    },
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct StateOutput {
    project_id: String,
    state: Option<PersistedOrchestratorState>,
    heartbeat: Option<HeartbeatRecord>,
    agent_alive: Option<bool>,
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
}

impl CommandOutput for StateOutput {
    fn to_human(&self) -> String {
        let Some(state) = &self.state else {
            return format!("Project {}: idle (no persisted state)", self.project_id);
        };

        let pid = match (state.agent_pid, self.agent_alive) {
            (Some(pid), Some(true)) => format!("{pid} (alive)"),
            (Some(pid), _) => format!("{pid} (not running)"),
            (None, _) => "-".to_string(),
        };
        let mut lines = vec![
            format!("Project:         {}", self.project_id),
            format!("Task:            {}", state.current_task_id.as_deref().unwrap_or("-")),
            format!("Phase:           {}", state.current_phase.as_deref().unwrap_or("-")),
            format!("Attempt:         {}", state.attempt),
            format!("Branch:          {}", state.branch_name.as_deref().unwrap_or("-")),
            format!(
                "Worktree:        {}",
                state
                    .worktree_path
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |p| p.display().to_string())
            ),
            format!("Agent pid:       {pid}"),
            format!("Started:         {}", fmt_time(state.started_at)),
            format!("Last transition: {}", fmt_time(state.last_transition)),
            format!("Last output:     {}", fmt_time(state.last_output_timestamp)),
            format!("Queue depth:     {}", state.queue_depth),
            format!(
                "Totals:          {} completed, {} failed, {} requeued",
                state.totals.completed, state.totals.failed, state.totals.requeued
            ),
        ];
        if let Some(heartbeat) = &self.heartbeat {
            lines.push(format!(
                "Heartbeat:       {} (last output {})",
                heartbeat.heartbeat_timestamp.to_rfc3339(),
                heartbeat.last_output_timestamp.to_rfc3339()
            ));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: StateArgs, config: &Config, json_mode: bool) -> Result<()> {
    match args.command {
        StateCommands::Show { project } => show_state(&project, config, json_mode).await,
    }
}

async fn show_state(project_id: &str, config: &Config, json_mode: bool) -> Result<()> {
    let layout = StateLayout::new(&config.state_dir);
    let state = JsonStateStore::new(layout.clone())
        .load(project_id)
        .await
        .with_context(|| format!("Failed to read state of project {project_id}"))?;

    let heartbeat = match state.as_ref().and_then(|s| s.current_task_id.as_deref()) {
        Some(task_id) => JsonHeartbeatStore::new(layout)
            .read(project_id, task_id)
            .await
            .unwrap_or_default(),
        None => None,
    };
    let agent_alive = state.as_ref().and_then(|s| s.agent_pid).map(pid_alive);

    let out = StateOutput {
        project_id: project_id.to_string(),
        state,
        heartbeat,
        agent_alive,
    };
    output(&out, json_mode);
    Ok(())
}
