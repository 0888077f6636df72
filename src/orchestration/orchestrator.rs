//! The orchestrator facade.
//!
//! [`Orchestrator`] owns the one dependency graph and is the only way to
//! mutate it. Structural mutation is serialized against execution through
//! an internal guard; status and progress reads never wait on a run.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::core::{
    goal_progress, progress, DependencyEdge, DependencyGraph, EdgeBuilder, Node, NodeId, NodeStatus,
    RelationshipType, StatusCounts,
};
use crate::error::{Error, Result};
use crate::orchestration::detection::{Detection, RelationshipDetector};
use crate::orchestration::resolver::ConflictDecision;
use crate::orchestration::scheduler::{ExecutionReport, TopologicalExecutor, WorkExecutor};
use crate::orchestration::store::{NodeStore, StoreWriter};
use crate::orchestration::synergy::{SynergyAwareExecutor, Unifier};

/// Metadata key holding the detector's confidence on auto-related edges.
pub const CONFIDENCE_KEY: &str = "confidence";
/// Metadata key holding the tier that produced an auto-related edge.
pub const TIER_KEY: &str = "tier";
/// Metadata key holding a detected type that was stored as `independent`.
pub const DETECTED_KEY: &str = "detected";

/// Point-in-time view returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub counts: StatusCounts,
    pub execution_order: Vec<NodeId>,
    pub ready: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
    pub blocked: Vec<(NodeId, String)>,
    pub goal_progress: Vec<(NodeId, f64)>,
    /// Conflict decisions from the most recent run.
    pub conflicts: Vec<ConflictDecision>,
    pub store_write_failures: usize,
    pub running: bool,
}

pub struct Orchestrator {
    graph: Arc<RwLock<DependencyGraph>>,
    config: OrchestratorConfig,
    detector: Arc<RelationshipDetector>,
    work: Arc<dyn WorkExecutor>,
    unifier: Option<Arc<dyn Unifier>>,
    store: StoreWriter,
    /// Held for the whole of a run and for every structural mutation.
    run_guard: AsyncMutex<()>,
    active_run: Mutex<Option<CancellationToken>>,
    last_report: RwLock<Option<ExecutionReport>>,
}

impl Orchestrator {
    /// Create an orchestrator with a lexical-only detector and no store.
    pub fn new(config: OrchestratorConfig, work: Arc<dyn WorkExecutor>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            graph: Arc::new(RwLock::new(DependencyGraph::new())),
            detector: Arc::new(RelationshipDetector::from_config(&config.detection, None, None)),
            config,
            work,
            unifier: None,
            store: StoreWriter::disabled(),
            run_guard: AsyncMutex::new(()),
            active_run: Mutex::new(None),
            last_report: RwLock::new(None),
        })
    }

    pub fn with_detector(mut self, detector: RelationshipDetector) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    /// Enable synergy merging through `unifier`.
    pub fn with_unifier(mut self, unifier: Arc<dyn Unifier>) -> Self {
        self.unifier = Some(unifier);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = StoreWriter::new(store, self.config.store.clone());
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ========== Graph construction ==========

    pub async fn add_goal(&self, goal: Node) -> Result<NodeId> {
        if !goal.is_goal() {
            return Err(Error::Validation(format!("{} is not a goal", goal.id())));
        }
        self.insert(goal).await
    }

    pub async fn add_task(&self, task: Node) -> Result<NodeId> {
        if !task.is_task() {
            return Err(Error::Validation(format!("{} is not a task", task.id())));
        }
        self.insert(task).await
    }

    async fn insert(&self, node: Node) -> Result<NodeId> {
        let _guard = self.run_guard.lock().await;
        let id = node.id().clone();
        self.graph.write().await.add_node(node.clone())?;
        debug!(%id, kind = node.kind_label(), "node added");
        self.store.record_created(&node);
        Ok(id)
    }

    /// Relate two nodes with a plain edge of `relationship`. Returns `false`
    /// when an identical edge already exists.
    pub async fn relate(&self, a: &NodeId, b: &NodeId, relationship: RelationshipType) -> Result<bool> {
        let edge = DependencyEdge::builder(a, b).relationship(relationship).build()?;
        self.relate_edge(edge).await
    }

    pub async fn relate_edge(&self, edge: DependencyEdge) -> Result<bool> {
        let _guard = self.run_guard.lock().await;
        let added = self.graph.write().await.add_edge(edge.clone())?;
        if added {
            debug!(
                source = %edge.source_id,
                target = %edge.target_id,
                relationship = %edge.relationship,
                "edge added"
            );
        }
        Ok(added)
    }

    /// Classify the pair with the detector and store the result as an edge.
    ///
    /// Returns the detection even when it was `independent`. Detection runs
    /// without holding the graph, so a slow classifier does not stall other
    /// callers. A detected type the pair cannot carry (a `subgoal_of` into a
    /// task, or precedence that would close a cycle) is stored as
    /// `independent` with the detected type under [`DETECTED_KEY`].
    #[instrument(skip(self))]
    pub async fn auto_relate(&self, a: &NodeId, b: &NodeId) -> Result<Detection> {
        let (node_a, node_b) = {
            let g = self.graph.read().await;
            let node_a = g.node(a).cloned().ok_or_else(|| Error::UnknownNode(a.clone()))?;
            let node_b = g.node(b).cloned().ok_or_else(|| Error::UnknownNode(b.clone()))?;
            (node_a, node_b)
        };

        let detection = self
            .detector
            .detect(&node_a, &node_b, &CancellationToken::new())
            .await?;

        let provenance = |builder: EdgeBuilder| {
            builder
                .metadata(CONFIDENCE_KEY, serde_json::Value::from(detection.confidence))
                .metadata(TIER_KEY, serde_json::Value::from(detection.tier.clone()))
        };

        let _guard = self.run_guard.lock().await;
        let mut graph = self.graph.write().await;
        let detected =
            provenance(DependencyEdge::builder(a, b).relationship(detection.relationship)).build()?;
        let edge = match graph.check_edge(&detected) {
            Ok(()) => detected,
            Err(e) if matches!(e, Error::Validation(_) | Error::Cycle { .. }) => {
                warn!(
                    relationship = %detection.relationship,
                    error = %e,
                    "detected relationship cannot be stored, recording as independent"
                );
                provenance(DependencyEdge::builder(a, b).independent())
                    .metadata(
                        DETECTED_KEY,
                        serde_json::Value::from(detection.relationship.as_str()),
                    )
                    .build()?
            }
            Err(e) => return Err(e),
        };
        graph.add_edge(edge)?;

        info!(
            relationship = %detection.relationship,
            confidence = detection.confidence,
            tier = %detection.tier,
            "relationship detected"
        );
        Ok(detection)
    }

    /// Attach tasks and sub-goals to `goal_id` in one step.
    ///
    /// Every id is resolved and every edge checked before anything is
    /// applied; on error the graph is left as it was.
    pub async fn decompose(
        &self,
        goal_id: &NodeId,
        task_ids: &[NodeId],
        subgoal_ids: &[NodeId],
    ) -> Result<()> {
        let _guard = self.run_guard.lock().await;
        let mut graph = self.graph.write().await;

        match graph.node(goal_id) {
            None => return Err(Error::UnknownNode(goal_id.clone())),
            Some(node) if !node.is_goal() => {
                return Err(Error::Validation(format!("{} is not a goal", goal_id)))
            }
            Some(_) => {}
        }
        for (id, want_goal) in task_ids
            .iter()
            .map(|id| (id, false))
            .chain(subgoal_ids.iter().map(|id| (id, true)))
        {
            let node = graph.node(id).ok_or_else(|| Error::UnknownNode(id.clone()))?;
            if node.is_goal() != want_goal {
                return Err(Error::Validation(format!(
                    "{} is a {}, expected a {}",
                    id,
                    node.kind_label(),
                    if want_goal { "goal" } else { "task" }
                )));
            }
        }

        let mut staged = graph.clone();
        for id in task_ids.iter().chain(subgoal_ids) {
            staged.add_edge(DependencyEdge::builder(id, goal_id).subgoal_of().build()?)?;
        }
        *graph = staged;

        info!(
            goal = %goal_id,
            tasks = task_ids.len(),
            subgoals = subgoal_ids.len(),
            "goal decomposed"
        );
        Ok(())
    }

    /// Mark a goal completed regardless of its contributors.
    pub async fn complete_goal(&self, goal_id: &NodeId) -> Result<()> {
        let _guard = self.run_guard.lock().await;
        let mut graph = self.graph.write().await;
        let node = graph
            .node_mut(goal_id)
            .ok_or_else(|| Error::UnknownNode(goal_id.clone()))?;
        if !node.is_goal() {
            return Err(Error::Validation(format!("{} is not a goal", goal_id)));
        }
        node.complete(None);
        self.store.record_status(goal_id, node.status());
        info!(goal = %goal_id, "goal completed by override");
        Ok(())
    }

    // ========== Execution ==========

    /// Run everything runnable, level by level, with at most `max_parallel`
    /// work callbacks in flight.
    ///
    /// Partial failure is reported in the returned [`ExecutionReport`];
    /// only an invalid argument or a cyclic graph is an error.
    #[instrument(skip(self))]
    pub async fn execute(&self, max_parallel: usize) -> Result<ExecutionReport> {
        if max_parallel == 0 {
            return Err(Error::Validation("max_parallel must be at least 1".to_string()));
        }
        let _guard = self.run_guard.lock().await;

        let cancel = CancellationToken::new();
        self.set_active_run(Some(cancel.clone()));

        let executor = TopologicalExecutor::new(Arc::clone(&self.work), max_parallel)
            .with_conflict_policy(self.config.conflict_policy)
            .with_store(self.store.clone());
        let result = match &self.unifier {
            Some(unifier) => {
                SynergyAwareExecutor::new(executor, Arc::clone(unifier))
                    .run(&self.graph, &cancel)
                    .await
            }
            None => executor.run(&self.graph, &cancel).await,
        };

        self.set_active_run(None);
        let report = result?;
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    /// Run with the configured `max_parallel`.
    pub async fn execute_default(&self) -> Result<ExecutionReport> {
        self.execute(self.config.max_parallel).await
    }

    /// Cancel the active run. Returns `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        match self.active_run.lock() {
            Ok(active) => match active.as_ref() {
                Some(token) => {
                    info!("cancelling active run");
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => {
                warn!("run registry poisoned, cannot cancel");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.active_run
            .lock()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }

    fn set_active_run(&self, token: Option<CancellationToken>) {
        if let Ok(mut active) = self.active_run.lock() {
            *active = token;
        }
    }

    pub async fn last_report(&self) -> Option<ExecutionReport> {
        self.last_report.read().await.clone()
    }

    /// Wait for queued store writes to drain.
    pub async fn flush_store(&self) {
        self.store.flush().await;
    }

    // ========== Queries ==========

    pub async fn get_progress(&self, id: &NodeId) -> Result<f64> {
        progress(&*self.graph.read().await, id)
    }

    pub async fn get_status(&self) -> Result<StatusSnapshot> {
        let graph = self.graph.read().await;

        let mut failed = Vec::new();
        let mut blocked = Vec::new();
        for node in graph.nodes() {
            match node.status() {
                NodeStatus::Failed { error } => failed.push((node.id().clone(), error.clone())),
                NodeStatus::Blocked { reason } => blocked.push((node.id().clone(), reason.clone())),
                _ => {}
            }
        }
        failed.sort();
        blocked.sort();

        let conflicts = self
            .last_report
            .read()
            .await
            .as_ref()
            .map(|r| r.conflicts.clone())
            .unwrap_or_default();

        Ok(StatusSnapshot {
            counts: StatusCounts::from_graph(&graph),
            execution_order: graph.execution_order()?,
            ready: graph.get_ready_nodes(),
            failed,
            blocked,
            goal_progress: goal_progress(&graph)?,
            conflicts,
            store_write_failures: self.store.failed_writes(),
            running: self.is_running(),
        })
    }

    pub async fn node(&self, id: &NodeId) -> Option<Node> {
        self.graph.read().await.node(id).cloned()
    }

    /// A copy of the current graph.
    pub async fn snapshot(&self) -> DependencyGraph {
        self.graph.read().await.clone()
    }

    /// Graphviz DOT description of the graph.
    pub async fn visualize(&self) -> String {
        self.graph.read().await.to_dot()
    }
}
