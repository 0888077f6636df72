//! Reference scenarios.
//!
//! Each test mirrors one documented behaviour of the orchestrator: goal
//! progress, precedence ordering, cycle rejection, lexical detection and
//! conflict resolution.

use goalweave::core::{progress, DependencyGraph, Node, Priority, RelationshipType};
use goalweave::Error;

use crate::fixtures::{add_task_with_priority, add_tasks, enable, id, ids, orchestrator, status_label, RecordingWork};

/// Test: Half-finished goal
/// Given goal G with contributors T1 (completed) and T2 (pending)
/// Then G reports progress 0.5
#[test]
fn test_goal_progress_is_mean_of_contributors() {
    let mut graph = DependencyGraph::new();
    graph.add_node(Node::goal("G", "Ship release").unwrap()).unwrap();
    graph.add_node(Node::task("T1", "Cut branch").unwrap()).unwrap();
    graph.add_node(Node::task("T2", "Publish notes").unwrap()).unwrap();
    for t in ["T1", "T2"] {
        graph
            .add_edge(
                goalweave::core::DependencyEdge::builder(t, "G")
                    .subgoal_of()
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }
    graph.node_mut(&id("T1")).unwrap().complete(None);

    assert_eq!(progress(&graph, &id("G")).unwrap(), 0.5);
}

/// Test: Linear chain
/// Given A enables B and B enables C
/// Then the execution order is A, B, C
#[tokio::test]
async fn test_execution_order_follows_chain() {
    let orch = orchestrator(RecordingWork::new());
    add_tasks(&orch, &["C", "B", "A"]).await;
    enable(&orch, "A", "B").await;
    enable(&orch, "B", "C").await;

    let status = orch.get_status().await.unwrap();
    assert_eq!(status.execution_order, ids(&["A", "B", "C"]));
    assert_eq!(status.ready, ids(&["A"]));
}

/// Test: Cycle rejection
/// Given the chain A -> B -> C
/// When C enables A is added
/// Then a cycle error is returned and only the two original edges remain
#[tokio::test]
async fn test_cycle_is_rejected_without_mutation() {
    let orch = orchestrator(RecordingWork::new());
    add_tasks(&orch, &["A", "B", "C"]).await;
    enable(&orch, "A", "B").await;
    enable(&orch, "B", "C").await;
    let before = orch.visualize().await;

    let result = orch.relate(&id("C"), &id("A"), RelationshipType::Enables).await;

    assert!(matches!(result, Err(Error::Cycle { .. })));
    let graph = orch.snapshot().await;
    assert_eq!(graph.edge_count(), 2);
    assert!(graph.validate().is_empty());
    assert_eq!(orch.visualize().await, before);
}

/// Test: Unrelated titles
/// Given tasks "Fix login bug" and "Write API docs"
/// When auto_relate runs with the lexical tier only
/// Then the pair is independent with confidence of at least 0.5
#[tokio::test]
async fn test_unrelated_titles_are_independent() {
    let orch = orchestrator(RecordingWork::new());
    orch.add_task(Node::task("login", "Fix login bug").unwrap()).await.unwrap();
    orch.add_task(Node::task("docs", "Write API docs").unwrap()).await.unwrap();

    let detection = orch.auto_relate(&id("login"), &id("docs")).await.unwrap();

    assert_eq!(detection.relationship, RelationshipType::Independent);
    assert!(detection.confidence >= 0.5);
}

/// Test: Conflicting pair in one level
/// Given X (high) and Y (low) related by conflicts_with, both ready
/// When the level executes
/// Then X completes, Y is blocked and the decision is recorded
#[tokio::test]
async fn test_conflict_blocks_lower_priority() {
    let work = RecordingWork::new();
    let orch = orchestrator(work.clone());
    add_task_with_priority(&orch, "X", Priority::High).await;
    add_task_with_priority(&orch, "Y", Priority::Low).await;
    orch.relate(&id("X"), &id("Y"), RelationshipType::ConflictsWith)
        .await
        .unwrap();

    let report = orch.execute(4).await.unwrap();

    assert_eq!(status_label(&orch, "X").await, "completed");
    assert_eq!(status_label(&orch, "Y").await, "blocked");
    assert_eq!(work.calls(), ids(&["X"]));
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].winner, id("X"));
    assert_eq!(report.conflicts[0].loser, id("Y"));

    let status = orch.get_status().await.unwrap();
    assert_eq!(status.conflicts, report.conflicts);
    assert_eq!(status.blocked.len(), 1);
    assert_eq!(status.counts.completed, 1);
    assert_eq!(status.counts.blocked, 1);
}

/// Given synergistic edges added in both directions
/// Then exactly one edge is stored
#[tokio::test]
async fn test_symmetric_relate_is_idempotent() {
    let orch = orchestrator(RecordingWork::new());
    add_tasks(&orch, &["a", "b"]).await;

    let first = orch
        .relate(&id("a"), &id("b"), RelationshipType::Synergistic)
        .await
        .unwrap();
    let second = orch
        .relate(&id("b"), &id("a"), RelationshipType::Synergistic)
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(orch.snapshot().await.edge_count(), 1);
}

/// Given an unchanged graph
/// Then visualize output is identical across calls and lists every node
#[tokio::test]
async fn test_visualize_is_deterministic() {
    let orch = orchestrator(RecordingWork::new());
    orch.add_goal(Node::goal("g", "Launch").unwrap()).await.unwrap();
    add_tasks(&orch, &["b", "a"]).await;
    orch.decompose(&id("g"), &ids(&["a", "b"]), &[]).await.unwrap();
    orch.relate(&id("b"), &id("a"), RelationshipType::Reinforces)
        .await
        .unwrap();

    let first = orch.visualize().await;
    let second = orch.visualize().await;

    assert_eq!(first, second);
    assert!(first.starts_with("digraph goals {\n"));
    assert!(first.contains("\"g\" [label=\"Launch\\n(pending)\", shape=ellipse"));
    assert!(first.contains("\"a\" -> \"g\" [label=\"subgoal_of\""));
    assert!(first.contains("\"a\" -> \"b\" [label=\"reinforces\", weight=1, dir=none];"));
}
