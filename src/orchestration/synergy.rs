//! Synergy-aware scheduling.
//!
//! Nodes joined by `synergistic` edges are merged into one execution unit
//! before the run starts. Each connected component is handed to the
//! injected [`Unifier`], which returns a combined plan; the component is
//! then scheduled as a single unit on the contracted graph. A merge that
//! would make the contracted precedence graph cyclic is skipped and its
//! members run on their own.

use async_trait::async_trait;
use futures::future::join_all;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{DependencyGraph, Node, NodeId, RelationshipType};
use crate::error::{Error, Result};
use crate::orchestration::scheduler::{
    ExecutionPlan, ExecutionReport, MergedUnit, ScheduleUnit, SkippedMerge, TopologicalExecutor,
};

/// Combined execution plan for a synergy component. Opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedPlan {
    pub summary: String,
    pub payload: serde_json::Value,
}

/// The unification collaborator.
#[async_trait]
pub trait Unifier: Send + Sync {
    async fn unify(&self, nodes: &[Node]) -> Result<UnifiedPlan>;
}

/// Connected components of the `synergistic` subgraph with more than one
/// member. Members are sorted by id, components by their first member.
pub fn synergy_components(graph: &DependencyGraph) -> Vec<Vec<NodeId>> {
    let ids: Vec<NodeId> = graph.nodes().map(|n| n.id().clone()).collect();
    let position: HashMap<&NodeId, usize> = ids.iter().enumerate().map(|(i, id)| (id, i)).collect();

    let mut sets = UnionFind::<usize>::new(ids.len());
    for edge in graph.edges_of_type(RelationshipType::Synergistic) {
        if let (Some(&a), Some(&b)) = (position.get(&edge.source_id), position.get(&edge.target_id)) {
            sets.union(a, b);
        }
    }

    let mut groups: HashMap<usize, Vec<NodeId>> = HashMap::new();
    for (i, id) in ids.iter().enumerate() {
        groups.entry(sets.find(i)).or_default().push(id.clone());
    }

    let mut components: Vec<Vec<NodeId>> = groups
        .into_values()
        .filter(|members| members.len() > 1)
        .map(|mut members| {
            members.sort();
            members
        })
        .collect();
    components.sort();
    components
}

/// Contract accepted merges and group the resulting units into levels.
///
/// Merges are tried in the given order; one that would close a precedence
/// cycle between units is skipped.
pub fn contract(
    graph: &DependencyGraph,
    merges: Vec<(Vec<NodeId>, UnifiedPlan)>,
) -> Result<ExecutionPlan> {
    let order = graph.execution_order()?;
    let position: HashMap<&NodeId, usize> = order.iter().enumerate().map(|(i, id)| (id, i)).collect();

    let mut accepted: Vec<(Vec<NodeId>, UnifiedPlan)> = Vec::new();
    let mut skipped_merges = Vec::new();
    for (members, plan) in merges {
        let acyclic = {
            let mut groups: Vec<&[NodeId]> = accepted.iter().map(|(m, _)| m.as_slice()).collect();
            groups.push(&members);
            contraction_is_acyclic(graph, &groups)
        };
        if acyclic {
            accepted.push((members, plan));
        } else {
            warn!(?members, "synergy merge would create a dependency cycle, running members separately");
            skipped_merges.push(SkippedMerge {
                members,
                reason: "merging would create a dependency cycle".to_string(),
            });
        }
    }

    let mut units = Vec::new();
    let mut unit_of: HashMap<NodeId, usize> = HashMap::new();
    for (mut members, plan) in accepted {
        members.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
        for id in &members {
            unit_of.insert(id.clone(), units.len());
        }
        units.push(ScheduleUnit::Merged(MergedUnit { members, plan }));
    }
    for id in &order {
        if !unit_of.contains_key(id) {
            unit_of.insert(id.clone(), units.len());
            units.push(ScheduleUnit::Single(id.clone()));
        }
    }

    Ok(ExecutionPlan {
        levels: layer_units(graph, units, &unit_of)?,
        skipped_merges,
    })
}

fn unit_graph(graph: &DependencyGraph, unit_of: &HashMap<NodeId, usize>, count: usize) -> DiGraph<(), ()> {
    let mut units = DiGraph::with_capacity(count, 0);
    for _ in 0..count {
        units.add_node(());
    }
    for edge in graph.edges().filter(|e| e.relationship.is_precedence()) {
        let (Some(&s), Some(&t)) = (unit_of.get(&edge.source_id), unit_of.get(&edge.target_id)) else {
            continue;
        };
        if s != t {
            units.update_edge(NodeIndex::new(s), NodeIndex::new(t), ());
        }
    }
    units
}

fn contraction_is_acyclic(graph: &DependencyGraph, groups: &[&[NodeId]]) -> bool {
    let mut unit_of: HashMap<NodeId, usize> = HashMap::new();
    for (i, group) in groups.iter().enumerate() {
        for id in group.iter() {
            unit_of.insert(id.clone(), i);
        }
    }
    let mut count = groups.len();
    for node in graph.nodes() {
        if !unit_of.contains_key(node.id()) {
            unit_of.insert(node.id().clone(), count);
            count += 1;
        }
    }
    !is_cyclic_directed(&unit_graph(graph, &unit_of, count))
}

/// Longest-path levels over units, each level ordered by priority
/// descending then lead id.
fn layer_units(
    graph: &DependencyGraph,
    units: Vec<ScheduleUnit>,
    unit_of: &HashMap<NodeId, usize>,
) -> Result<Vec<Vec<ScheduleUnit>>> {
    let contracted = unit_graph(graph, unit_of, units.len());
    let order = toposort(&contracted, None)
        .map_err(|_| Error::Validation("contracted schedule contains a cycle".to_string()))?;

    let mut depth = vec![0usize; units.len()];
    for index in order {
        depth[index.index()] = contracted
            .neighbors_directed(index, Direction::Incoming)
            .map(|pred| depth[pred.index()] + 1)
            .max()
            .unwrap_or(0);
    }

    let mut levels: Vec<Vec<ScheduleUnit>> = Vec::new();
    for (i, unit) in units.into_iter().enumerate() {
        let d = depth[i];
        if levels.len() <= d {
            levels.resize_with(d + 1, Vec::new);
        }
        levels[d].push(unit);
    }
    for level in &mut levels {
        level.sort_by_cached_key(|unit| (Reverse(unit.priority(graph)), unit.lead().cloned()));
    }
    Ok(levels)
}

/// Runs synergy components as merged units on top of a
/// [`TopologicalExecutor`].
pub struct SynergyAwareExecutor {
    inner: TopologicalExecutor,
    unifier: Arc<dyn Unifier>,
}

impl SynergyAwareExecutor {
    pub fn new(inner: TopologicalExecutor, unifier: Arc<dyn Unifier>) -> Self {
        Self { inner, unifier }
    }

    /// Unify every component that still has runnable tasks, concurrently,
    /// then contract. A component whose unification fails is not merged.
    pub async fn plan(&self, graph: &RwLock<DependencyGraph>) -> Result<ExecutionPlan> {
        let requests: Vec<Vec<Node>> = {
            let g = graph.read().await;
            synergy_components(&g)
                .into_iter()
                .map(|members| members.iter().filter_map(|id| g.node(id).cloned()).collect::<Vec<_>>())
                .filter(|nodes| nodes.iter().any(|n| n.is_task() && n.can_start()))
                .collect()
        };
        debug!(components = requests.len(), "unifying synergy components");

        let plans = join_all(requests.iter().map(|nodes| self.unifier.unify(nodes))).await;

        let mut merges = Vec::new();
        let mut failed_merges = Vec::new();
        for (nodes, plan) in requests.iter().zip(plans) {
            let members: Vec<NodeId> = nodes.iter().map(|n| n.id().clone()).collect();
            match plan {
                Ok(plan) => merges.push((members, plan)),
                Err(e) => {
                    warn!(?members, error = %e, "unification failed, running members separately");
                    failed_merges.push(SkippedMerge {
                        members,
                        reason: format!("unification failed: {}", e),
                    });
                }
            }
        }

        let g = graph.read().await;
        let mut plan = contract(&g, merges)?;
        plan.skipped_merges.extend(failed_merges);
        info!(
            merged = plan.merged_units().len(),
            skipped = plan.skipped_merges.len(),
            "synergy plan ready"
        );
        Ok(plan)
    }

    pub async fn run(
        &self,
        graph: &RwLock<DependencyGraph>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let plan = self.plan(graph).await?;
        self.inner.run_plan(graph, plan, cancel).await
    }
}
