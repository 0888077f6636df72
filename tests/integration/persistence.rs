//! Write-through persistence and configuration tests.
//!
//! These tests verify that state transitions reach the store out of band,
//! that a store outage never affects a run, and that configuration loaded
//! from disk drives the orchestrator.

use std::sync::Arc;
use tempfile::TempDir;

use goalweave::core::{Node, NodeStatus};
use goalweave::orchestration::{InMemoryStore, NodeStore};
use goalweave::{ConflictPolicy, Orchestrator, OrchestratorConfig};

use crate::fixtures::{add_tasks, enable, id, test_config, RecordingWork};

/// Test: Transitions are written through
/// Given a store and a goal over two tasks
/// When the run completes and the writer is flushed
/// Then the store holds the final statuses and goal progress
#[tokio::test]
async fn test_statuses_and_progress_are_written_through() {
    let store = Arc::new(InMemoryStore::new());
    let orch = Orchestrator::new(test_config(), RecordingWork::failing(&["b"]))
        .unwrap()
        .with_store(store.clone());
    orch.add_goal(Node::goal("g", "Goal").unwrap()).await.unwrap();
    add_tasks(&orch, &["a", "b"]).await;
    orch.decompose(&id("g"), &[id("a"), id("b")], &[]).await.unwrap();

    orch.execute(2).await.unwrap();
    orch.flush_store().await;

    assert_eq!(store.len().await, 3);
    assert_eq!(store.get(&id("a")).await.unwrap().status(), &NodeStatus::Completed);
    assert_eq!(store.get(&id("b")).await.unwrap().status().label(), "failed");
    assert_eq!(store.get(&id("g")).await.unwrap().status().label(), "blocked");
    assert_eq!(store.progress_of(&id("g")).await, Some(0.5));

    let failed = store
        .query_by_status(&NodeStatus::Failed {
            error: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id(), &id("b"));
    assert_eq!(orch.get_status().await.unwrap().store_write_failures, 0);
}

/// Test: A store outage does not disturb execution
/// Given an unavailable store
/// When a run executes
/// Then every task completes and the abandoned writes are counted
#[tokio::test]
async fn test_store_outage_never_blocks_execution() {
    let store = Arc::new(InMemoryStore::new());
    store.set_available(false);
    let orch = Orchestrator::new(test_config(), RecordingWork::new())
        .unwrap()
        .with_store(store.clone());
    add_tasks(&orch, &["a", "b"]).await;
    enable(&orch, "a", "b").await;

    let report = orch.execute(2).await.unwrap();
    orch.flush_store().await;

    assert!(report.is_success());
    assert_eq!(report.completed.len(), 2);
    assert!(store.is_empty().await);
    assert!(orch.get_status().await.unwrap().store_write_failures > 0);
}

/// Test: Config on disk drives the orchestrator
/// Given a TOML file selecting run_if_winner_fails and max_parallel 2
/// Then the loaded config is applied
#[tokio::test]
async fn test_config_file_is_applied() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "max_parallel = 2\nconflict_policy = \"run_if_winner_fails\"\n\n[store]\nretry_attempts = 1\n",
    )
    .unwrap();

    let config = OrchestratorConfig::load_from(&path).unwrap();
    let orch = Orchestrator::new(config, RecordingWork::new()).unwrap();

    assert_eq!(orch.config().max_parallel, 2);
    assert_eq!(orch.config().conflict_policy, ConflictPolicy::RunIfWinnerFails);
    assert_eq!(orch.config().store.retry_attempts, 1);

    add_tasks(&orch, &["a", "b", "c"]).await;
    let report = orch.execute_default().await.unwrap();
    assert_eq!(report.completed.len(), 3);
}

/// Test: Invalid config is rejected up front
#[test]
fn test_invalid_config_is_rejected() {
    let mut config = OrchestratorConfig::default();
    config.max_parallel = 0;
    assert!(Orchestrator::new(config, RecordingWork::new()).is_err());
}
