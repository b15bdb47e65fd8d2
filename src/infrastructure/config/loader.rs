use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;
use crate::infrastructure::logging::LogFormat;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("State directory cannot be empty")]
    EmptyStateDir,

    #[error("{0} command cannot be empty")]
    EmptyCommand(&'static str),

    #[error("Invalid {0}: must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("Invalid percentile: {0}. Must be in (0, 1]")]
    InvalidPercentile(f64),

    #[error("Invalid archive bounds: min_bytes ({0}) must not exceed max_bytes ({1})")]
    InvalidArchiveBounds(usize, usize),

    #[error("Base branch cannot be empty")]
    EmptyBaseBranch,
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .shepherd/config.yaml (project config)
    /// 3. .shepherd/local.yaml (project local overrides, optional)
    /// 4. Environment variables (SHEPHERD_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("SHEPHERD_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".shepherd/config.yaml"))
            .merge(Yaml::file(".shepherd/local.yaml"))
            .merge(Env::prefixed("SHEPHERD_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyStateDir);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        if config.logging.format.parse::<LogFormat>().is_err() {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let agent = &config.agent;
        if agent.coder_command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand("Coder"));
        }
        if agent.reviewer_command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand("Reviewer"));
        }

        let intervals = [
            ("agent.heartbeat_interval_secs", agent.heartbeat_interval_secs),
            (
                "agent.inactivity_check_interval_secs",
                agent.inactivity_check_interval_secs,
            ),
            ("agent.inactivity_timeout_secs", agent.inactivity_timeout_secs),
            ("agent.tail_interval_ms", agent.tail_interval_ms),
            ("recovery.poll_interval_secs", config.recovery.poll_interval_secs),
            ("watchdog.interval_secs", config.watchdog.interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroInterval(*name));
        }
        if agent.output_log_cap_bytes == 0 {
            return Err(ConfigError::ZeroInterval("agent.output_log_cap_bytes"));
        }

        let archive = &config.archive;
        if !(archive.percentile > 0.0 && archive.percentile <= 1.0) {
            return Err(ConfigError::InvalidPercentile(archive.percentile));
        }
        if archive.min_bytes > archive.max_bytes {
            return Err(ConfigError::InvalidArchiveBounds(
                archive.min_bytes,
                archive.max_bytes,
            ));
        }

        if config.pipeline.base_branch.trim().is_empty() {
            return Err(ConfigError::EmptyBaseBranch);
        }

        Ok(())
    }
}
