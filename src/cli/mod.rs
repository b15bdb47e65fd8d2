//! Command-line interface.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

#[derive(Parser, Debug)]
#[command(name = "shepherd", version, about = "Supervisor for coding-agent processes")]
pub struct Cli {
    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to .shepherd/config.yaml + local.yaml)
    #[arg(long, global = true, env = "SHEPHERD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the state directory
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate and inspect workflow definitions
    Workflow(commands::workflow::WorkflowArgs),
    /// Inspect persisted orchestrator state
    State(commands::state::StateArgs),
    /// List orphaned task assignments
    Orphans(commands::orphans::OrphansArgs),
}

/// Load configuration for a CLI run, applying command-line overrides.
pub fn load_config(path: Option<&Path>, state_dir: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    if let Some(dir) = state_dir {
        config.state_dir = dir.to_path_buf();
    }
    Ok(config)
}

/// Dispatch a parsed command.
pub async fn run(cli: Cli, config: &Config) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Workflow(args) => commands::workflow::execute(args, config, json).await,
        Commands::State(args) => commands::state::execute(args, config, json).await,
        Commands::Orphans(args) => commands::orphans::execute(args, config, json).await,
    }
}

/// Print an error the way the selected output mode expects and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
        let body = serde_json::json!({ "error": err.to_string(), "causes": chain });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}
