//! Workflow CLI commands.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use crate::cli::output::{list_table, output, CommandOutput};
use crate::domain::models::{Config, WorkflowDefinition};
use crate::infrastructure::layout::StateLayout;
use crate::services::workflow_engine::{load_workflow, WorkflowEngine};

#[derive(Args, Debug)]
pub struct WorkflowArgs {
    #[command(subcommand)]
    pub command: WorkflowCommands,
}

#[derive(Subcommand, Debug)]
pub enum WorkflowCommands {
    /// Validate a workflow definition file and report every issue
    Validate {
        /// Path to a workflow JSON file
        file: PathBuf,
    },
    /// Show a workflow's steps in execution order
    Show {
        /// Workflow JSON file; the built-in pipeline when omitted
        file: Option<PathBuf>,
        /// Show the override file of this project instead
        #[arg(long, conflicts_with = "file")]
        project: Option<String>,
    },
}

// ── Output structs ──────────────────────────────────────────────────────

#[derive(Debug, serde::Serialize)]
struct ValidateOutput {
    file: PathBuf,
    valid: bool,
    issues: Vec<String>,
}

impl CommandOutput for ValidateOutput {
    fn to_human(&self) -> String {
        if self.valid {
            return format!("{}: OK", self.file.display());
        }
        let mut lines = vec![format!(
            "{}: {} issue(s)",
            self.file.display(),
            self.issues.len()
        )];
        lines.extend(self.issues.iter().map(|issue| format!("  - {issue}")));
        lines.join("\n")
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct StepDetail {
    id: String,
    name: String,
    role: String,
    depends_on: Vec<String>,
    success_condition: String,
    max_attempts: u32,
    escalate_model: bool,
}

#[derive(Debug, serde::Serialize)]
struct ShowOutput {
    id: String,
    name: String,
    version: u32,
    source: String,
    steps: Vec<StepDetail>,
}

impl CommandOutput for ShowOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["#", "step", "role", "after", "success", "attempts"]);
        for (i, step) in self.steps.iter().enumerate() {
            let attempts = if step.escalate_model {
                format!("{} (escalates)", step.max_attempts)
            } else {
                step.max_attempts.to_string()
            };
            let after = if step.depends_on.is_empty() {
                "-".to_string()
            } else {
                step.depends_on.join(", ")
            };
            table.add_row(vec![
                (i + 1).to_string(),
                step.id.clone(),
                step.role.clone(),
                after,
                step.success_condition.clone(),
                attempts,
            ]);
        }
        format!(
            "Workflow: {} (v{}, {})\nName: {}\n\n{table}",
            self.id, self.version, self.source, self.name
        )
    }
}

// ── Command execution ───────────────────────────────────────────────────

pub async fn execute(args: WorkflowArgs, config: &Config, json_mode: bool) -> Result<()> {
    match args.command {
        WorkflowCommands::Validate { file } => validate_workflow(&file, json_mode).await,
        WorkflowCommands::Show { file, project } => {
            let (path, source) = match (file, project) {
                (Some(file), _) => (Some(file.clone()), file.display().to_string()),
                (None, Some(project)) => {
                    let path = StateLayout::new(&config.state_dir).workflow_file(&project);
                    let source = format!("project {project}");
                    (Some(path), source)
                }
                (None, None) => (None, "built-in".to_string()),
            };
            show_workflow(path.as_deref(), source, json_mode).await
        }
    }
}

async fn validate_workflow(file: &Path, json_mode: bool) -> Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let def: WorkflowDefinition = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a workflow definition", file.display()))?;

    let issues = match WorkflowEngine::new().validate(&def) {
        Ok(()) => Vec::new(),
        Err(e) => e.issues.iter().map(ToString::to_string).collect(),
    };
    let out = ValidateOutput {
        file: file.to_path_buf(),
        valid: issues.is_empty(),
        issues,
    };
    output(&out, json_mode);

    if !out.valid {
        bail!("workflow {} is invalid", file.display());
    }
    Ok(())
}

async fn show_workflow(path: Option<&Path>, source: String, json_mode: bool) -> Result<()> {
    let def = match path {
        Some(path) if path.exists() => load_workflow(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        Some(_) | None => WorkflowDefinition::default_pipeline(),
    };
    let source = if path.is_some_and(|p| !p.exists()) {
        format!("{source}, no override: built-in")
    } else {
        source
    };

    let order = WorkflowEngine::new().topological_sort(&def)?;
    let steps = order
        .into_iter()
        .map(|step| StepDetail {
            id: step.id.clone(),
            name: step.name.clone(),
            role: step.agent_role.to_string(),
            depends_on: step.depends_on.clone(),
            success_condition: serde_json::to_value(step.success_condition)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            max_attempts: step.retry_policy.max_attempts,
            escalate_model: step.retry_policy.escalate_model,
        })
        .collect();

    let out = ShowOutput {
        id: def.id.clone(),
        name: def.name.clone(),
        version: def.version,
        source,
        steps,
    };
    output(&out, json_mode);
    Ok(())
}
