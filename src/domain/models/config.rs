use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration structure for shepherd
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Root directory for persisted state, task directories and archives
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Agent process configuration
    #[serde(default)]
    pub agent: AgentProcessConfig,

    /// Crash recovery configuration
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Watchdog configuration
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Session archive configuration
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Pipeline defaults
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".shepherd/state")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            logging: LoggingConfig::default(),
            agent: AgentProcessConfig::default(),
            recovery: RecoveryConfig::default(),
            watchdog: WatchdogConfig::default(),
            archive: ArchiveConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            retention_days: default_retention_days(),
        }
    }
}

/// How agent processes are launched and supervised
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentProcessConfig {
    /// Command used for coder steps
    #[serde(default = "default_agent_command")]
    pub coder_command: String,

    /// Command used for reviewer steps
    #[serde(default = "default_agent_command")]
    pub reviewer_command: String,

    /// Extra arguments passed before the prompt path
    #[serde(default)]
    pub args: Vec<String>,

    /// Model used for first attempts
    #[serde(default = "default_model")]
    pub model: String,

    /// Model used for retries of steps with `escalateModel`
    #[serde(default = "default_escalation_model")]
    pub escalation_model: String,

    /// Interval between heartbeat writes
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Interval between inactivity / liveness checks
    #[serde(default = "default_inactivity_check_interval_secs")]
    pub inactivity_check_interval_secs: u64,

    /// Silence after which an agent is considered hung
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// Grace window between the terminate and kill signals
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Cap on the in-memory output log
    #[serde(default = "default_output_log_cap_bytes")]
    pub output_log_cap_bytes: usize,

    /// Poll interval for tailing the output file of a reattached agent
    #[serde(default = "default_tail_interval_ms")]
    pub tail_interval_ms: u64,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_escalation_model() -> String {
    "opus".to_string()
}

const fn default_heartbeat_interval_secs() -> u64 {
    10
}

const fn default_inactivity_check_interval_secs() -> u64 {
    30
}

const fn default_inactivity_timeout_secs() -> u64 {
    600
}

const fn default_kill_grace_secs() -> u64 {
    5
}

const fn default_output_log_cap_bytes() -> usize {
    5 * 1024 * 1024
}

const fn default_tail_interval_ms() -> u64 {
    1000
}

impl Default for AgentProcessConfig {
    fn default() -> Self {
        Self {
            coder_command: default_agent_command(),
            reviewer_command: default_agent_command(),
            args: vec![],
            model: default_model(),
            escalation_model: default_escalation_model(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            inactivity_check_interval_secs: default_inactivity_check_interval_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            output_log_cap_bytes: default_output_log_cap_bytes(),
            tail_interval_ms: default_tail_interval_ms(),
        }
    }
}

impl AgentProcessConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn inactivity_check_interval(&self) -> Duration {
        Duration::from_secs(self.inactivity_check_interval_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn tail_interval(&self) -> Duration {
        Duration::from_millis(self.tail_interval_ms)
    }
}

/// Crash recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Interval of the recovery-poll timer for reattached agents
    #[serde(default = "default_recovery_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Grace window between terminate and kill during recovery
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

const fn default_recovery_poll_interval_secs() -> u64 {
    30
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_recovery_poll_interval_secs(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

impl RecoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// Watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogConfig {
    /// Interval between reconciliation passes
    #[serde(default = "default_watchdog_interval_secs")]
    pub interval_secs: u64,
}

const fn default_watchdog_interval_secs() -> u64 {
    60
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval_secs(),
        }
    }
}

/// Session archive truncation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ArchiveConfig {
    /// How many recent sessions feed the size threshold
    #[serde(default = "default_recent_sample")]
    pub recent_sample: usize,

    /// Percentile of recent sizes used as the threshold (0, 1]
    #[serde(default = "default_percentile")]
    pub percentile: f64,

    /// Threshold never drops below this
    #[serde(default = "default_archive_min_bytes")]
    pub min_bytes: usize,

    /// Threshold never exceeds this; also used when there is no history
    #[serde(default = "default_archive_max_bytes")]
    pub max_bytes: usize,
}

const fn default_recent_sample() -> usize {
    50
}

const fn default_percentile() -> f64 {
    0.95
}

const fn default_archive_min_bytes() -> usize {
    64 * 1024
}

const fn default_archive_max_bytes() -> usize {
    1024 * 1024
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            recent_sample: default_recent_sample(),
            percentile: default_percentile(),
            min_bytes: default_archive_min_bytes(),
            max_bytes: default_archive_max_bytes(),
        }
    }
}

/// Pipeline defaults, served by the settings provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Whether the review step runs
    #[serde(default = "default_true")]
    pub review_required: bool,

    /// Branch task branches are cut from and merged into
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Push the base branch after a merge
    #[serde(default)]
    pub push_after_merge: bool,

    /// Scoped test command; changed files are appended as arguments
    #[serde(default)]
    pub test_command: Option<String>,
}

const fn default_true() -> bool {
    true
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            review_required: true,
            base_branch: default_base_branch(),
            push_after_merge: false,
            test_command: None,
        }
    }
}
