//! Relationship detection integration tests.
//!
//! These tests run the tiered detector through `auto_relate` and check the
//! stored edge as well as the returned detection.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use goalweave::core::{Node, RelationshipType};
use goalweave::orchestration::{
    RelationshipDetector, SemanticClassifier, SimilarityProvider, CONFIDENCE_KEY, DETECTED_KEY,
    TIER_KEY,
};
use goalweave::{Error, Orchestrator, Result};

use crate::fixtures::{enable, id, test_config, RecordingWork};

struct FixedSimilarity(f64);

#[async_trait]
impl SimilarityProvider for FixedSimilarity {
    async fn similarity(&self, _a: &str, _b: &str) -> Result<f64> {
        Ok(self.0)
    }
}

struct SlowClassifier {
    answer: RelationshipType,
    delay: Duration,
}

#[async_trait]
impl SemanticClassifier for SlowClassifier {
    async fn classify(&self, _a: &Node, _b: &Node, cancel: CancellationToken) -> Result<RelationshipType> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(self.answer),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

async fn pair(orch: &Orchestrator, a: (&str, &str), b: (&str, &str)) {
    orch.add_task(Node::task(a.0, a.1).unwrap()).await.unwrap();
    orch.add_task(Node::task(b.0, b.1).unwrap()).await.unwrap();
}

/// Test: Lexical match is stored with its provenance
/// Given "Use Postgres instead of MySQL" and "MySQL vs SQLite evaluation"
/// When auto_relate runs
/// Then a conflicts_with edge is stored with confidence and tier metadata
#[tokio::test]
async fn test_lexical_detection_is_stored() {
    let orch = Orchestrator::new(test_config(), RecordingWork::new()).unwrap();
    pair(
        &orch,
        ("pg", "Use Postgres instead of MySQL"),
        ("eval", "MySQL vs SQLite evaluation"),
    )
    .await;

    let detection = orch.auto_relate(&id("pg"), &id("eval")).await.unwrap();

    assert_eq!(detection.relationship, RelationshipType::ConflictsWith);
    assert_eq!(detection.tier, "lexical");
    assert!(detection.confidence > 0.8);

    let graph = orch.snapshot().await;
    let edges = graph.edges_between(&id("pg"), &id("eval"));
    assert_eq!(edges.len(), 1);
    let edge = edges[0];
    assert_eq!(edge.relationship, RelationshipType::ConflictsWith);
    assert_eq!(edge.source_id, id("eval"));
    assert_eq!(edge.metadata[TIER_KEY], serde_json::json!("lexical"));
    assert!(edge.metadata.contains_key(CONFIDENCE_KEY));
}

/// Test: A sub-goal detection between two tasks is kept as independent
/// Given two tasks whose text reads like part/subtask wording
/// When auto_relate runs
/// Then it succeeds and stores an independent edge noting the detected type
#[tokio::test]
async fn test_subgoal_between_tasks_is_stored_as_independent() {
    let orch = Orchestrator::new(test_config(), RecordingWork::new()).unwrap();
    pair(
        &orch,
        ("a", "Login form is part of auth"),
        ("b", "Session subtask milestone"),
    )
    .await;

    let detection = assert_ok!(orch.auto_relate(&id("a"), &id("b")).await);

    assert_eq!(detection.relationship, RelationshipType::SubgoalOf);
    let graph = orch.snapshot().await;
    let edges = graph.edges_between(&id("a"), &id("b"));
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].relationship, RelationshipType::Independent);
    assert_eq!(edges[0].metadata[DETECTED_KEY], serde_json::json!("subgoal_of"));
    assert_eq!(edges[0].metadata[TIER_KEY], serde_json::json!("lexical"));
}

/// Test: A detected precedence edge that would close a cycle is not stored
/// Given release enables docs
/// When auto_relate(docs, release) detects enables
/// Then the precedence subgraph is untouched and an independent edge is kept
#[tokio::test]
async fn test_cyclic_detection_is_stored_as_independent() {
    let orch = Orchestrator::new(test_config(), RecordingWork::new()).unwrap();
    pair(
        &orch,
        ("release", "Cut release"),
        ("docs", "Docs update after review, requires sign-off"),
    )
    .await;
    enable(&orch, "release", "docs").await;

    let detection = assert_ok!(orch.auto_relate(&id("docs"), &id("release")).await);

    assert_eq!(detection.relationship, RelationshipType::Enables);
    let graph = orch.snapshot().await;
    assert!(graph.validate().is_empty());
    assert!(!graph.has_edge(&id("docs"), &id("release"), RelationshipType::Enables));
    assert!(graph.has_edge(&id("docs"), &id("release"), RelationshipType::Independent));
    assert_eq!(
        orch.get_status().await.unwrap().execution_order,
        vec![id("release"), id("docs")]
    );
}

/// Test: Similarity tier decides when keywords are silent
#[tokio::test]
async fn test_similarity_tier_marks_synergy() {
    let config = test_config();
    let detector = RelationshipDetector::from_config(
        &config.detection,
        Some(Arc::new(FixedSimilarity(0.9))),
        None,
    );
    let orch = Orchestrator::new(config, RecordingWork::new())
        .unwrap()
        .with_detector(detector);
    pair(&orch, ("cache", "Add response cache"), ("cdn", "Configure CDN edge")).await;

    let detection = orch.auto_relate(&id("cache"), &id("cdn")).await.unwrap();

    assert_eq!(detection.relationship, RelationshipType::Synergistic);
    assert_eq!(detection.tier, "similarity");
    assert!(orch
        .snapshot()
        .await
        .has_edge(&id("cdn"), &id("cache"), RelationshipType::Synergistic));
}

/// Test: A slow classifier falls back to the similarity answer
/// Given a classifier slower than the configured timeout
/// Then the similarity result is used and auto_relate still succeeds
#[tokio::test]
async fn test_semantic_timeout_falls_back() {
    let mut config = test_config();
    config.detection.semantic_timeout_ms = 20;
    let detector = RelationshipDetector::from_config(
        &config.detection,
        Some(Arc::new(FixedSimilarity(0.4))),
        Some(Arc::new(SlowClassifier {
            answer: RelationshipType::Enables,
            delay: Duration::from_secs(10),
        })),
    );
    let orch = Orchestrator::new(config, RecordingWork::new())
        .unwrap()
        .with_detector(detector);
    pair(&orch, ("a", "Tune garbage collector"), ("b", "Rename logo asset")).await;

    let detection = tokio::time::timeout(
        Duration::from_secs(2),
        orch.auto_relate(&id("a"), &id("b")),
    )
    .await
    .expect("detection stalled on the classifier")
    .unwrap();

    assert_eq!(detection.relationship, RelationshipType::Independent);
    assert_eq!(detection.tier, "similarity");
    assert!((detection.confidence - 0.6).abs() < 1e-9);
}

/// Test: A fast classifier answer is stored
#[tokio::test]
async fn test_semantic_answer_creates_precedence_edge() {
    let config = test_config();
    let detector = RelationshipDetector::from_config(
        &config.detection,
        Some(Arc::new(FixedSimilarity(0.5))),
        Some(Arc::new(SlowClassifier {
            answer: RelationshipType::Enables,
            delay: Duration::from_millis(5),
        })),
    );
    let orch = Orchestrator::new(config, RecordingWork::new())
        .unwrap()
        .with_detector(detector);
    pair(&orch, ("schema", "Design schema"), ("api", "Build endpoints")).await;

    let detection = assert_ok!(orch.auto_relate(&id("schema"), &id("api")).await);

    assert_eq!(detection.relationship, RelationshipType::Enables);
    assert_eq!(detection.tier, "semantic");
    let status = assert_ok!(orch.get_status().await);
    assert_eq!(status.execution_order, vec![id("schema"), id("api")]);
}

/// Test: Unknown ids are rejected before detection
#[test]
fn test_auto_relate_unknown_node() {
    let orch = Orchestrator::new(test_config(), RecordingWork::new()).unwrap();
    tokio_test::block_on(async {
        orch.add_task(Node::task("known", "Known").unwrap()).await.unwrap();
        let result = orch.auto_relate(&id("known"), &id("ghost")).await;
        assert_err!(&result);
        assert!(matches!(result, Err(Error::UnknownNode(missing)) if missing == id("ghost")));
    });
}
