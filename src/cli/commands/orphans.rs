//! List assignment records left behind by a previous run.

use std::collections::HashSet;

use anyhow::{Context, Result};
use clap::Args;

use crate::adapters::fs::JsonStateStore;
use crate::cli::output::{list_table, output, render_list, truncate, CommandOutput};
use crate::domain::models::Config;
use crate::domain::ports::StateStore;
use crate::infrastructure::layout::StateLayout;
use crate::services::orphan_scan::{scan_orphans, OrphanRecord, OrphanSource};

#[derive(Args, Debug)]
pub struct OrphansArgs {
    /// Project id
    #[arg(long)]
    pub project: String,

    /// Include the task recorded in the persisted state
    #[arg(long)]
    pub all: bool,
}

#[derive(Debug, serde::Serialize)]
struct OrphansOutput {
    project_id: String,
    orphans: Vec<OrphanRecord>,
}

impl CommandOutput for OrphansOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["task", "phase", "attempt", "branch", "found in"]);
        for orphan in &self.orphans {
            let source = match orphan.source {
                OrphanSource::ActiveDir => "active",
                OrphanSource::Worktree => "worktree",
            };
            table.add_row(vec![
                orphan.task_id().to_string(),
                orphan.assignment.phase.clone(),
                orphan.assignment.attempt.to_string(),
                truncate(&orphan.assignment.branch_name, 40),
                source.to_string(),
            ]);
        }
        render_list("orphan", &table, self.orphans.len())
    }
}

pub async fn execute(args: OrphansArgs, config: &Config, json_mode: bool) -> Result<()> {
    let layout = StateLayout::new(&config.state_dir);

    let mut tracked = HashSet::new();
    if !args.all {
        let state = JsonStateStore::new(layout.clone())
            .load(&args.project)
            .await
            .with_context(|| format!("Failed to read state of project {}", args.project))?;
        tracked.extend(state.and_then(|s| s.current_task_id));
    }

    let orphans = scan_orphans(&layout, &args.project, &tracked)
        .await
        .with_context(|| format!("Failed to scan project {}", args.project))?;

    let out = OrphansOutput {
        project_id: args.project,
        orphans,
    };
    output(&out, json_mode);
    Ok(())
}
