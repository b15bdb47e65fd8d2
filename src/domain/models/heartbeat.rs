use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness record written periodically while an agent runs.
///
/// Recovery reads it after a restart; it is independent of PID reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub pid: u32,
    pub last_output_timestamp: DateTime<Utc>,
    pub heartbeat_timestamp: DateTime<Utc>,
}
