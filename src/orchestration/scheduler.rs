//! Level-by-level execution of the dependency graph.
//!
//! The scheduler walks execution levels strictly in order. Within a level,
//! task units run concurrently through the injected [`WorkExecutor`],
//! bounded by a semaphore of `max_parallel` permits. Goals are never
//! executed; their status is derived from their contributors after every
//! pass.
//!
//! The graph lock is only held while admitting a level and while applying
//! its outcomes, never across a work callback, so status and progress reads
//! stay responsive during a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConflictPolicy;
use crate::core::{derive_goal_statuses, goal_progress, DependencyGraph, Node, NodeId, NodeStatus, Priority};
use crate::error::{Error, Result};
use crate::orchestration::resolver::{ConflictDecision, ConflictResolver};
use crate::orchestration::store::StoreWriter;
use crate::orchestration::synergy::UnifiedPlan;

/// Outcome payload of a successful work callback, stored as the task result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub payload: serde_json::Value,
}

impl ExecutionResult {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }
}

/// The opaque work collaborator.
///
/// Returning an error marks the task failed; the scheduler never retries.
/// Returning [`Error::Cancelled`] puts the task back to pending instead.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, task: &Node, cancel: CancellationToken) -> Result<ExecutionResult>;

    /// Execute a merged synergy unit.
    ///
    /// `members` are the unit's runnable tasks in precedence order. The
    /// default runs them one after another and stops at the first failure,
    /// which fails the whole unit.
    async fn execute_unified(
        &self,
        plan: &UnifiedPlan,
        members: &[Node],
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let mut results = serde_json::Map::new();
        for member in members {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let result = self.execute(member, cancel.clone()).await?;
            results.insert(member.id().to_string(), result.payload);
        }
        Ok(ExecutionResult::new(serde_json::json!({
            "plan": plan.payload.clone(),
            "results": results,
        })))
    }
}

/// A merged synergy component scheduled as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedUnit {
    /// Members in precedence order.
    pub members: Vec<NodeId>,
    pub plan: UnifiedPlan,
}

/// One schedulable unit: a single node or a merged synergy component.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleUnit {
    Single(NodeId),
    Merged(MergedUnit),
}

type AdmissionKey = (Reverse<Priority>, Option<DateTime<Utc>>, NodeId);

impl ScheduleUnit {
    pub fn members(&self) -> &[NodeId] {
        match self {
            ScheduleUnit::Single(id) => std::slice::from_ref(id),
            ScheduleUnit::Merged(unit) => &unit.members,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members().contains(id)
    }

    pub fn plan(&self) -> Option<&UnifiedPlan> {
        match self {
            ScheduleUnit::Single(_) => None,
            ScheduleUnit::Merged(unit) => Some(&unit.plan),
        }
    }

    /// Smallest member id.
    pub fn lead(&self) -> Option<&NodeId> {
        self.members().iter().min()
    }

    /// Highest member priority.
    pub fn priority(&self, graph: &DependencyGraph) -> Priority {
        self.members()
            .iter()
            .filter_map(|id| graph.node(id))
            .map(|n| n.priority())
            .max()
            .unwrap_or_default()
    }

    /// Ordering used when units compete: priority descending, then earliest
    /// creation, then id.
    pub(crate) fn admission_key(&self, graph: &DependencyGraph) -> AdmissionKey {
        let created = self
            .members()
            .iter()
            .filter_map(|id| graph.node(id))
            .map(|n| n.header.created_at)
            .min();
        (
            Reverse(self.priority(graph)),
            created,
            self.lead().cloned().unwrap_or_else(|| NodeId(String::new())),
        )
    }
}

/// A merge that was dropped from the schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMerge {
    pub members: Vec<NodeId>,
    pub reason: String,
}

/// Units grouped into levels, ready to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub levels: Vec<Vec<ScheduleUnit>>,
    pub skipped_merges: Vec<SkippedMerge>,
}

impl ExecutionPlan {
    pub fn merged_units(&self) -> Vec<Vec<NodeId>> {
        self.levels
            .iter()
            .flatten()
            .filter_map(|unit| match unit {
                ScheduleUnit::Merged(m) => Some(m.members.clone()),
                ScheduleUnit::Single(_) => None,
            })
            .collect()
    }
}

/// Summary of one `execute` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Levels that were started.
    pub levels_run: usize,
    /// Nodes that reached completed during the run, goals included.
    pub completed: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
    pub blocked: Vec<(NodeId, String)>,
    /// In-flight nodes returned to pending by cancellation.
    pub interrupted: Vec<NodeId>,
    pub conflicts: Vec<ConflictDecision>,
    pub merged_units: Vec<Vec<NodeId>>,
    pub skipped_merges: Vec<SkippedMerge>,
    pub cancelled: bool,
}

impl ExecutionReport {
    /// Nothing failed, nothing blocked and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.blocked.is_empty()
    }

    fn record(&mut self, id: &NodeId, status: &NodeStatus) {
        match status {
            NodeStatus::Completed => self.completed.push(id.clone()),
            NodeStatus::Failed { error } => self.failed.push((id.clone(), error.clone())),
            NodeStatus::Blocked { reason } => self.blocked.push((id.clone(), reason.clone())),
            NodeStatus::Pending => self.interrupted.push(id.clone()),
            NodeStatus::Ready | NodeStatus::InProgress => {}
        }
    }
}

/// Events emitted as a run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    LevelStarted { level: usize, units: usize },
    NodeStarted { id: NodeId },
    NodeCompleted { id: NodeId },
    NodeFailed { id: NodeId, error: String },
    NodeBlocked { id: NodeId, reason: String },
    ConflictResolved(ConflictDecision),
    RunFinished { cancelled: bool },
}

struct Job {
    tasks: Vec<Node>,
    plan: Option<UnifiedPlan>,
}

enum Outcome {
    Completed(ExecutionResult),
    Failed(String),
    Cancelled,
}

struct JobOutcome {
    ids: Vec<NodeId>,
    outcome: Outcome,
}

/// Executes a graph level by level.
///
/// # Example
///
/// ```ignore
/// let graph = RwLock::new(graph);
/// let executor = TopologicalExecutor::new(Arc::new(MyWork), 4)
///     .with_conflict_policy(ConflictPolicy::Block);
/// let report = executor.run(&graph, &CancellationToken::new()).await?;
/// ```
pub struct TopologicalExecutor {
    /// The work collaborator.
    work: Arc<dyn WorkExecutor>,
    /// Size of the per-level semaphore.
    max_parallel: usize,
    /// Decides `conflicts_with` contests before each pass.
    resolver: ConflictResolver,
    /// Write-through persistence.
    store: StoreWriter,
    /// Optional lifecycle event sink.
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl TopologicalExecutor {
    pub fn new(work: Arc<dyn WorkExecutor>, max_parallel: usize) -> Self {
        Self {
            work,
            max_parallel: max_parallel.max(1),
            resolver: ConflictResolver::new(ConflictPolicy::default()),
            store: StoreWriter::disabled(),
            events: None,
        }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.resolver = ConflictResolver::new(policy);
        self
    }

    pub fn with_store(mut self, store: StoreWriter) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Every node as its own unit, grouped by
    /// [`execution_levels`](DependencyGraph::execution_levels).
    pub fn plan(&self, graph: &DependencyGraph) -> Result<ExecutionPlan> {
        let levels = graph
            .execution_levels()?
            .into_iter()
            .map(|level| level.into_iter().map(ScheduleUnit::Single).collect())
            .collect();
        Ok(ExecutionPlan {
            levels,
            skipped_merges: Vec::new(),
        })
    }

    pub async fn run(
        &self,
        graph: &RwLock<DependencyGraph>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let plan = {
            let g = graph.read().await;
            self.plan(&g)?
        };
        self.run_plan(graph, plan, cancel).await
    }

    /// Run a prepared plan. Partial failure is reported, not returned as an
    /// error.
    pub async fn run_plan(
        &self,
        graph: &RwLock<DependencyGraph>,
        plan: ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport {
            merged_units: plan.merged_units(),
            skipped_merges: plan.skipped_merges.clone(),
            ..Default::default()
        };
        info!(
            levels = plan.levels.len(),
            max_parallel = self.max_parallel,
            merged = report.merged_units.len(),
            "starting run"
        );

        for (level, units) in plan.levels.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            debug!(level, units = units.len(), "starting level");
            self.emit(SchedulerEvent::LevelStarted {
                level,
                units: units.len(),
            });
            report.levels_run += 1;

            let mut pass = units;
            loop {
                let (jobs, deferred) = self.admit(graph, pass, level, &mut report).await?;
                let outcomes = self.dispatch(jobs, cancel).await;
                self.settle(graph, outcomes, &mut report).await?;

                if deferred.is_empty() || cancel.is_cancelled() {
                    break;
                }
                pass = self.readmit(graph, deferred, &mut report).await?;
                if pass.is_empty() {
                    break;
                }
                debug!(level, units = pass.len(), "re-admitting conflict losers");
            }
        }

        report.cancelled = cancel.is_cancelled();
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            cancelled = report.cancelled,
            "run finished"
        );
        self.emit(SchedulerEvent::RunFinished {
            cancelled: report.cancelled,
        });
        Ok(report)
    }

    /// Decide which units of a pass run. Blocks units with an unmet
    /// upstream, resolves conflicts, and moves admitted tasks to in
    /// progress. Returns the jobs plus losers held back for re-admission.
    async fn admit(
        &self,
        graph: &RwLock<DependencyGraph>,
        pass: Vec<ScheduleUnit>,
        level: usize,
        report: &mut ExecutionReport,
    ) -> Result<(Vec<Job>, Vec<(ScheduleUnit, NodeId)>)> {
        let mut g = graph.write().await;

        let mut candidates = Vec::new();
        for unit in pass {
            let startable = startable_members(&g, &unit);
            if startable.is_empty() {
                continue;
            }
            if let Some(culprit) = unmet_dependency(&g, &unit) {
                let reason = format!("upstream {} did not complete", culprit);
                for id in &startable {
                    self.block_node(&mut g, id, &reason, report);
                }
                continue;
            }
            candidates.push(unit);
        }

        let resolution = self.resolver.resolve(&g, candidates, level);

        let mut deferred = Vec::new();
        for rejection in resolution.rejected {
            let decision = rejection.decision;
            self.emit(SchedulerEvent::ConflictResolved(decision.clone()));
            if decision.deferred {
                deferred.push((rejection.unit, decision.winner.clone()));
            } else {
                for id in startable_members(&g, &rejection.unit) {
                    self.block_node(&mut g, &id, &decision.reason, report);
                }
            }
            report.conflicts.push(decision);
        }

        let mut jobs = Vec::new();
        for unit in resolution.admitted {
            let mut tasks = Vec::new();
            for id in unit.members() {
                let Some(node) = g.node_mut(id) else {
                    continue;
                };
                if !node.can_start() {
                    continue;
                }
                if node.is_goal() {
                    if node.status() == &NodeStatus::Pending {
                        node.mark_ready();
                        self.store.record_status(id, node.status());
                    }
                    continue;
                }
                node.mark_ready();
                node.start();
                trace!(%id, "node started");
                self.store.record_status(id, node.status());
                tasks.push(node.clone());
            }
            if tasks.is_empty() {
                continue;
            }
            for task in &tasks {
                self.emit(SchedulerEvent::NodeStarted {
                    id: task.id().clone(),
                });
            }
            jobs.push(Job {
                tasks,
                plan: unit.plan().cloned(),
            });
        }

        Ok((jobs, deferred))
    }

    /// Run every job under the semaphore and collect outcomes.
    async fn dispatch(&self, jobs: Vec<Job>, cancel: &CancellationToken) -> Vec<JobOutcome> {
        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let mut set = JoinSet::new();

        for job in jobs {
            let permits = Arc::clone(&permits);
            let work = Arc::clone(&self.work);
            let cancel = cancel.clone();
            set.spawn(async move {
                let ids = job.tasks.iter().map(|n| n.id().clone()).collect();
                let outcome = run_job(work, job, permits, cancel).await;
                JobOutcome { ids, outcome }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "execution task aborted"),
            }
        }
        outcomes
    }

    /// Apply job outcomes, then refresh goal statuses and progress.
    async fn settle(
        &self,
        graph: &RwLock<DependencyGraph>,
        outcomes: Vec<JobOutcome>,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let mut g = graph.write().await;

        for JobOutcome { ids, outcome } in outcomes {
            for id in &ids {
                let Some(node) = g.node_mut(id) else {
                    continue;
                };
                match &outcome {
                    Outcome::Completed(result) => {
                        node.complete(Some(result.payload.clone()));
                        trace!(%id, "node completed");
                        self.emit(SchedulerEvent::NodeCompleted { id: id.clone() });
                    }
                    Outcome::Failed(err) => {
                        node.fail(err);
                        warn!(%id, error = %err, "task failed");
                        self.emit(SchedulerEvent::NodeFailed {
                            id: id.clone(),
                            error: err.clone(),
                        });
                    }
                    Outcome::Cancelled => {
                        node.reset();
                        debug!(%id, "task interrupted, back to pending");
                    }
                }
                self.store.record_status(id, node.status());
                report.record(id, node.status());
            }
        }

        self.refresh_goals(&mut g, report)
    }

    /// Re-admit deferred losers whose winner failed; block the rest.
    async fn readmit(
        &self,
        graph: &RwLock<DependencyGraph>,
        deferred: Vec<(ScheduleUnit, NodeId)>,
        report: &mut ExecutionReport,
    ) -> Result<Vec<ScheduleUnit>> {
        let mut g = graph.write().await;
        let mut retry = Vec::new();
        for (unit, winner) in deferred {
            if matches!(g.status_of(&winner), Some(NodeStatus::Failed { .. })) {
                retry.push(unit);
                continue;
            }
            let reason = format!("conflicts with {} which completed first", winner);
            for id in startable_members(&g, &unit) {
                self.block_node(&mut g, &id, &reason, report);
            }
        }
        self.refresh_goals(&mut g, report)?;
        Ok(retry)
    }

    fn refresh_goals(&self, g: &mut DependencyGraph, report: &mut ExecutionReport) -> Result<()> {
        for id in derive_goal_statuses(g)? {
            if let Some(node) = g.node(&id) {
                trace!(%id, status = node.status().label(), "goal status derived");
                self.store.record_status(&id, node.status());
                report.record(&id, node.status());
            }
        }
        if self.store.is_enabled() {
            for (id, fraction) in goal_progress(g)? {
                self.store.record_progress(&id, fraction);
            }
        }
        Ok(())
    }

    fn block_node(
        &self,
        g: &mut DependencyGraph,
        id: &NodeId,
        reason: &str,
        report: &mut ExecutionReport,
    ) {
        let Some(node) = g.node_mut(id) else {
            return;
        };
        node.block(reason);
        debug!(%id, reason, "node blocked");
        self.store.record_status(id, node.status());
        report.record(id, node.status());
        self.emit(SchedulerEvent::NodeBlocked {
            id: id.clone(),
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

async fn run_job(
    work: Arc<dyn WorkExecutor>,
    job: Job,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) -> Outcome {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Outcome::Cancelled,
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Outcome::Cancelled,
        },
    };

    let call = async {
        match (&job.plan, job.tasks.first()) {
            (Some(plan), _) => work.execute_unified(plan, &job.tasks, cancel.child_token()).await,
            (None, Some(task)) => work.execute(task, cancel.child_token()).await,
            (None, None) => Ok(ExecutionResult::default()),
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        result = AssertUnwindSafe(call).catch_unwind() => match result {
            Ok(Ok(result)) => Outcome::Completed(result),
            Ok(Err(Error::Cancelled)) => Outcome::Cancelled,
            Ok(Err(Error::Execution(msg))) => Outcome::Failed(msg),
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(_) => Outcome::Failed("work callback panicked".to_string()),
        },
    }
}

fn startable_members(graph: &DependencyGraph, unit: &ScheduleUnit) -> Vec<NodeId> {
    unit.members()
        .iter()
        .filter(|id| graph.node(id).is_some_and(|n| n.can_start()))
        .cloned()
        .collect()
}

/// First precedence predecessor outside the unit that has not completed.
fn unmet_dependency(graph: &DependencyGraph, unit: &ScheduleUnit) -> Option<NodeId> {
    unit.members().iter().find_map(|member| {
        graph
            .precedence_predecessors(member)
            .into_iter()
            .find(|pred| !unit.contains(pred.id()) && !pred.status().is_completed())
            .map(|pred| pred.id().clone())
    })
}
