//! Integration tests for the orphaned-assignment scan.

mod common;

use std::collections::HashSet;

use common::{Harness, PROJECT};
use shepherd::domain::ports::AssignmentStore;
use shepherd::infrastructure::layout::ASSIGNMENT_FILE;
use shepherd::services::{scan_orphans, OrphanSource};

#[tokio::test]
async fn test_three_siblings_yield_three_orphans() {
    let h = Harness::new();
    let records = [("T-1", "code", 1), ("T-2", "review", 2), ("T-3", "code", 3)];
    for (id, phase, attempt) in records {
        h.assignments
            .write_assignment(&h.assignment(id, phase, attempt))
            .await
            .unwrap();
    }
    // A directory without a record and a reserved slot directory.
    let active = h.layout.active_root(PROJECT);
    tokio::fs::create_dir_all(active.join("T-4")).await.unwrap();
    let reserved = active.join("_merge");
    tokio::fs::create_dir_all(&reserved).await.unwrap();
    tokio::fs::write(
        reserved.join(ASSIGNMENT_FILE),
        serde_json::to_string(&h.assignment("_merge", "merge", 1)).unwrap(),
    )
    .await
    .unwrap();

    let orphans = scan_orphans(&h.layout, PROJECT, &HashSet::new())
        .await
        .unwrap();

    let found: Vec<(&str, &str, u32)> = orphans
        .iter()
        .map(|o| (o.task_id(), o.assignment.phase.as_str(), o.assignment.attempt))
        .collect();
    assert_eq!(found, records.to_vec());
    assert!(orphans.iter().all(|o| o.source == OrphanSource::ActiveDir));
}

#[tokio::test]
async fn test_worktree_records_are_found() {
    let h = Harness::new();
    let worktree = h.layout.worktree_path(PROJECT, "T-7");
    tokio::fs::create_dir_all(&worktree).await.unwrap();
    tokio::fs::write(
        worktree.join(ASSIGNMENT_FILE),
        serde_json::to_string(&h.assignment("T-7", "code", 1)).unwrap(),
    )
    .await
    .unwrap();
    // A worktree without a record is just a checkout.
    tokio::fs::create_dir_all(h.layout.worktree_path(PROJECT, "T-8"))
        .await
        .unwrap();

    let orphans = scan_orphans(&h.layout, PROJECT, &HashSet::new())
        .await
        .unwrap();

    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].task_id(), "T-7");
    assert_eq!(orphans[0].source, OrphanSource::Worktree);
    assert_eq!(orphans[0].dir, worktree);
}

#[tokio::test]
async fn test_tracked_tasks_are_not_orphans() {
    let h = Harness::new();
    for id in ["T-1", "T-2"] {
        h.assignments
            .write_assignment(&h.assignment(id, "code", 1))
            .await
            .unwrap();
    }
    let tracked: HashSet<String> = ["T-2".to_string()].into_iter().collect();

    let orphans = scan_orphans(&h.layout, PROJECT, &tracked).await.unwrap();

    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].task_id(), "T-1");
}
