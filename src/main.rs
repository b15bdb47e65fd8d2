//! shepherd CLI entry point.

use clap::Parser;

use shepherd::cli::{handle_error, load_config, run, Cli};
use shepherd::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    let config = match load_config(cli.config.as_deref(), cli.state_dir.as_deref()) {
        Ok(config) => config,
        Err(err) => handle_error(err.context("Failed to load configuration"), json),
    };

    let _logger = match LoggerImpl::init(&LogConfig::from(&config.logging)) {
        Ok(logger) => Some(logger),
        Err(err) => {
            eprintln!("warning: logging disabled: {err:#}");
            None
        }
    };

    if let Err(err) = run(cli, &config).await {
        handle_error(err, json);
    }
}
