//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scriptable work executor that records calls and concurrency
//! - A mock unifier for synergy merges
//! - Small graph builders on top of the orchestrator

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use goalweave::core::{Node, NodeId, Priority, RelationshipType};
use goalweave::orchestration::{ExecutionResult, UnifiedPlan, Unifier, WorkExecutor};
use goalweave::{Error, Orchestrator, OrchestratorConfig, Result};

/// Work executor with scripted failures, an adjustable delay, and call
/// bookkeeping.
#[derive(Default)]
pub struct RecordingWork {
    failing: Mutex<HashSet<NodeId>>,
    panicking: Mutex<HashSet<NodeId>>,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<NodeId>>,
}

impl RecordingWork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(ids: &[&str]) -> Arc<Self> {
        let work = Self::new();
        work.fail(ids);
        work
    }

    pub fn fail(&self, ids: &[&str]) {
        let mut failing = self.failing.lock().unwrap();
        failing.extend(ids.iter().map(|id| NodeId::from(*id)));
    }

    pub fn panic_on(&self, id: &str) {
        self.panicking.lock().unwrap().insert(id.into());
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<NodeId> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of callbacks observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkExecutor for RecordingWork {
    async fn execute(&self, task: &Node, cancel: CancellationToken) -> Result<ExecutionResult> {
        self.calls.lock().unwrap().push(task.id().clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if interrupted {
            return Err(Error::Cancelled);
        }
        if self.panicking.lock().unwrap().contains(task.id()) {
            panic!("scripted panic in {}", task.id());
        }
        if self.failing.lock().unwrap().contains(task.id()) {
            return Err(Error::Execution(format!("{} failed", task.id())));
        }
        Ok(ExecutionResult::new(serde_json::json!({ "task": task.id().as_str() })))
    }
}

/// Unifier that records every component it was asked to merge.
#[derive(Default)]
pub struct MockUnifier {
    fail: bool,
    requests: Mutex<Vec<Vec<NodeId>>>,
}

impl MockUnifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn requests(&self) -> Vec<Vec<NodeId>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Unifier for MockUnifier {
    async fn unify(&self, nodes: &[Node]) -> Result<UnifiedPlan> {
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id().clone()).collect();
        self.requests.lock().unwrap().push(ids.clone());
        if self.fail {
            return Err(Error::Execution("unifier offline".to_string()));
        }
        let titles: Vec<&str> = nodes.iter().map(|n| n.title()).collect();
        Ok(UnifiedPlan {
            summary: titles.join(" + "),
            payload: serde_json::json!({ "members": ids }),
        })
    }
}

/// Config with fast store retries.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.store.retry_attempts = 2;
    config.store.retry_delay_ms = 1;
    config
}

pub fn orchestrator(work: Arc<RecordingWork>) -> Orchestrator {
    Orchestrator::new(test_config(), work).unwrap()
}

pub fn id(raw: &str) -> NodeId {
    NodeId::from(raw)
}

pub fn ids(raw: &[&str]) -> Vec<NodeId> {
    raw.iter().map(|r| NodeId::from(*r)).collect()
}

pub async fn add_tasks(orch: &Orchestrator, raw: &[&str]) {
    for r in raw {
        orch.add_task(Node::task(*r, &format!("Task {}", r)).unwrap())
            .await
            .unwrap();
    }
}

pub async fn add_task_with_priority(orch: &Orchestrator, raw: &str, priority: Priority) {
    orch.add_task(Node::task(raw, &format!("Task {}", raw)).unwrap().with_priority(priority))
        .await
        .unwrap();
}

pub async fn enable(orch: &Orchestrator, from: &str, to: &str) {
    orch.relate(&id(from), &id(to), RelationshipType::Enables)
        .await
        .unwrap();
}

pub async fn status_label(orch: &Orchestrator, raw: &str) -> &'static str {
    orch.node(&id(raw)).await.unwrap().status().label()
}
