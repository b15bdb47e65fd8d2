//! Subscriber settings resolved from the `logging` section of the config.

use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::models::LoggingConfig;

/// Console line format. Files are always written as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationPolicy {
    #[default]
    Daily,
    Hourly,
    Never,
}

/// Everything `LoggerImpl::init` needs.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Rolling file output; console only when unset.
    pub log_dir: Option<PathBuf>,
    pub enable_stderr: bool,
    pub rotation: RotationPolicy,
    /// Rotated files to keep; one per day with daily rotation.
    pub retention_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from(&LoggingConfig::default())
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            level: config.level.clone(),
            // The loader rejects unknown formats; fall back for hand-built configs.
            format: config.format.parse().unwrap_or_default(),
            log_dir: config.log_dir.clone(),
            enable_stderr: true,
            rotation: RotationPolicy::Daily,
            retention_days: config.retention_days,
        }
    }
}
