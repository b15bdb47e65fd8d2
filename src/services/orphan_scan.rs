//! Orphaned assignment discovery.
//!
//! After a restart the in-memory record of which tasks are running is gone.
//! Every step that starts leaves an `assignment.json` in its active task
//! directory, so walking the active root (and the worktree root, where
//! older or hand-made records may live) tells us which tasks were
//! mid-flight.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::TaskAssignment;
use crate::infrastructure::layout::{is_reserved, StateLayout, ASSIGNMENT_FILE};

/// Where an orphaned assignment record was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanSource {
    ActiveDir,
    Worktree,
}

/// An assignment record with no owner in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanRecord {
    pub assignment: TaskAssignment,
    /// Directory the record was read from.
    pub dir: PathBuf,
    pub source: OrphanSource,
}

impl OrphanRecord {
    pub fn task_id(&self) -> &str {
        &self.assignment.task_id
    }
}

/// Find assignment records under a project's active and worktree roots.
///
/// Reserved-prefix directories, directories without an assignment record,
/// unreadable records and tasks listed in `tracked` are skipped. A task
/// found in both roots is reported once, preferring the active directory.
/// Results are ordered by task id.
pub async fn scan_orphans(
    layout: &StateLayout,
    project_id: &str,
    tracked: &HashSet<String>,
) -> DomainResult<Vec<OrphanRecord>> {
    let mut found: BTreeMap<String, OrphanRecord> = BTreeMap::new();

    let roots = [
        (layout.active_root(project_id), OrphanSource::ActiveDir),
        (layout.worktrees_root(project_id), OrphanSource::Worktree),
    ];
    for (root, source) in roots {
        for record in scan_root(&root, source).await? {
            if tracked.contains(record.task_id()) {
                debug!(task_id = %record.task_id(), "Assignment belongs to a tracked task");
                continue;
            }
            found.entry(record.task_id().to_string()).or_insert(record);
        }
    }

    Ok(found.into_values().collect())
}

async fn scan_root(root: &Path, source: OrphanSource) -> DomainResult<Vec<OrphanRecord>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_reserved(&name) {
            continue;
        }

        let dir = entry.path();
        let contents = match tokio::fs::read_to_string(dir.join(ASSIGNMENT_FILE)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Unreadable assignment record");
                continue;
            }
        };
        match serde_json::from_str::<TaskAssignment>(&contents) {
            Ok(assignment) => records.push(OrphanRecord {
                assignment,
                dir,
                source,
            }),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Malformed assignment record"),
        }
    }
    Ok(records)
}
