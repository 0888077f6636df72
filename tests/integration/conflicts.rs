//! Conflict policy integration tests.
//!
//! These tests verify how `conflicts_with` pairs are scheduled under both
//! conflict policies, within a level and across levels.

use chrono::{Duration, Utc};
use std::sync::Arc;

use goalweave::core::{Node, Priority, RelationshipType};
use goalweave::{ConflictPolicy, Orchestrator};

use crate::fixtures::{add_task_with_priority, add_tasks, enable, id, ids, status_label, test_config, RecordingWork};

fn with_policy(work: Arc<RecordingWork>, policy: ConflictPolicy) -> Orchestrator {
    let mut config = test_config();
    config.conflict_policy = policy;
    Orchestrator::new(config, work).unwrap()
}

async fn conflicting_pair(orch: &Orchestrator) {
    add_task_with_priority(orch, "X", Priority::High).await;
    add_task_with_priority(orch, "Y", Priority::Low).await;
    orch.relate(&id("X"), &id("Y"), RelationshipType::ConflictsWith)
        .await
        .unwrap();
}

/// Test: Block policy never re-admits the loser
/// Given X beats Y and X fails
/// Then Y stays blocked
#[tokio::test]
async fn test_block_policy_keeps_loser_blocked() {
    let work = RecordingWork::failing(&["X"]);
    let orch = with_policy(work.clone(), ConflictPolicy::Block);
    conflicting_pair(&orch).await;

    let report = orch.execute(2).await.unwrap();

    assert_eq!(status_label(&orch, "X").await, "failed");
    assert_eq!(status_label(&orch, "Y").await, "blocked");
    assert_eq!(work.calls(), ids(&["X"]));
    assert!(!report.conflicts[0].deferred);
}

/// Test: Loser runs when the winner fails
/// Given run_if_winner_fails and X beats Y
/// When X fails
/// Then Y is re-admitted in the same level and completes
#[tokio::test]
async fn test_run_if_winner_fails_readmits_loser() {
    let work = RecordingWork::failing(&["X"]);
    let orch = with_policy(work.clone(), ConflictPolicy::RunIfWinnerFails);
    conflicting_pair(&orch).await;

    let report = orch.execute(2).await.unwrap();

    assert_eq!(status_label(&orch, "X").await, "failed");
    assert_eq!(status_label(&orch, "Y").await, "completed");
    assert_eq!(work.calls(), ids(&["X", "Y"]));
    assert_eq!(report.conflicts.len(), 1);
    assert!(report.conflicts[0].deferred);
    assert_eq!(report.levels_run, 1);
}

/// Test: Loser is blocked when the winner succeeds
/// Given run_if_winner_fails and X beats Y
/// When X completes
/// Then Y ends blocked
#[tokio::test]
async fn test_run_if_winner_fails_blocks_after_success() {
    let work = RecordingWork::new();
    let orch = with_policy(work.clone(), ConflictPolicy::RunIfWinnerFails);
    conflicting_pair(&orch).await;

    let report = orch.execute(2).await.unwrap();

    assert_eq!(status_label(&orch, "Y").await, "blocked");
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].0, id("Y"));
    assert_eq!(work.calls(), ids(&["X"]));
}

/// Test: Conflicts are honoured across levels
/// Given X at level 0, Y waiting on Z, and X conflicts with Y
/// When X completes first
/// Then Y is blocked even though it has higher priority
#[tokio::test]
async fn test_conflict_with_completed_node_blocks() {
    let work = RecordingWork::new();
    let orch = with_policy(work.clone(), ConflictPolicy::RunIfWinnerFails);
    add_task_with_priority(&orch, "X", Priority::Low).await;
    add_task_with_priority(&orch, "Y", Priority::Critical).await;
    add_tasks(&orch, &["Z"]).await;
    enable(&orch, "Z", "Y").await;
    orch.relate(&id("X"), &id("Y"), RelationshipType::ConflictsWith)
        .await
        .unwrap();

    let report = orch.execute(2).await.unwrap();

    assert_eq!(status_label(&orch, "X").await, "completed");
    assert_eq!(status_label(&orch, "Y").await, "blocked");
    let decision = &report.conflicts[0];
    assert_eq!(decision.winner, id("X"));
    assert_eq!(decision.level, 1);
    assert!(!decision.deferred);
}

/// Test: Equal priority falls back to creation time
/// Given A and B of equal priority where B was created first
/// Then B wins
#[tokio::test]
async fn test_equal_priority_prefers_earlier_creation() {
    let work = RecordingWork::new();
    let orch = with_policy(work.clone(), ConflictPolicy::Block);
    let now = Utc::now();
    orch.add_task(Node::task("A", "First by id").unwrap().with_created_at(now))
        .await
        .unwrap();
    orch.add_task(
        Node::task("B", "Second by id")
            .unwrap()
            .with_created_at(now - Duration::minutes(5)),
    )
    .await
    .unwrap();
    orch.relate(&id("A"), &id("B"), RelationshipType::ConflictsWith)
        .await
        .unwrap();

    orch.execute(2).await.unwrap();

    assert_eq!(status_label(&orch, "B").await, "completed");
    assert_eq!(status_label(&orch, "A").await, "blocked");
}
