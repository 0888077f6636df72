//! Completion progress over the goal hierarchy.
//!
//! Progress is always computed from current node state; nothing here is
//! cached between calls.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::dag::DependencyGraph;
use crate::core::node::{NodeId, NodeKind, NodeStatus};
use crate::error::{Error, Result};

/// Completion fraction in `[0.0, 1.0]` for any node.
///
/// A task is 1.0 when completed, else 0.0. A goal is the unweighted mean
/// over its contributing tasks and sub-goals; a goal without contributors
/// is 0.0. A goal explicitly marked completed reports 1.0.
pub fn progress(graph: &DependencyGraph, id: &NodeId) -> Result<f64> {
    let mut memo = HashMap::new();
    progress_memo(graph, id, &mut memo)
}

fn progress_memo(
    graph: &DependencyGraph,
    id: &NodeId,
    memo: &mut HashMap<NodeId, f64>,
) -> Result<f64> {
    if let Some(&p) = memo.get(id) {
        return Ok(p);
    }
    let node = graph
        .node(id)
        .ok_or_else(|| Error::UnknownNode(id.clone()))?;

    let value = match &node.kind {
        NodeKind::Task(_) => binary(node.status()),
        NodeKind::Goal(_) if node.status().is_completed() => 1.0,
        NodeKind::Goal(goal) => {
            let total = goal.contributor_count();
            if total == 0 {
                0.0
            } else {
                let mut sum = 0.0;
                for task_id in &goal.contributing_task_ids {
                    sum += graph.node(task_id).map(|t| binary(t.status())).unwrap_or(0.0);
                }
                for sub_id in &goal.contributing_subgoal_ids {
                    sum += progress_memo(graph, sub_id, memo)?;
                }
                (sum / total as f64).clamp(0.0, 1.0)
            }
        }
    };

    memo.insert(id.clone(), value);
    Ok(value)
}

fn binary(status: &NodeStatus) -> f64 {
    if status.is_completed() {
        1.0
    } else {
        0.0
    }
}

/// Progress for every goal in the graph, keyed by id.
pub fn goal_progress(graph: &DependencyGraph) -> Result<Vec<(NodeId, f64)>> {
    let mut memo = HashMap::new();
    let mut out = Vec::new();
    for node in graph.nodes().filter(|n| n.is_goal()) {
        out.push((node.id().clone(), progress_memo(graph, node.id(), &mut memo)?));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Re-derive goal statuses from their contributors and upstream nodes.
///
/// Goals are never executed. After their precedence predecessors change
/// state:
/// - every predecessor completed -> completed
/// - any predecessor failed or blocked -> blocked
/// - any contributor started or completed -> in progress
///
/// Contributors are predecessors through `subgoal_of`; `enables` edges into
/// a goal gate its completion the same way. Completed goals (including
/// explicit overrides) and goals with no contributors are left alone.
/// Sub-goals are settled before their parents. Returns the ids whose
/// status changed.
pub fn derive_goal_statuses(graph: &mut DependencyGraph) -> Result<Vec<NodeId>> {
    let order = graph.execution_order()?;
    let mut changed = Vec::new();

    for id in order {
        let Some(node) = graph.node(&id) else {
            continue;
        };
        let Some(goal) = node.as_goal() else {
            continue;
        };
        if node.status().is_completed() || goal.contributor_count() == 0 {
            continue;
        }

        let mut all_done = true;
        let mut stalled: Option<String> = None;
        let mut started = false;
        for pred in graph.precedence_predecessors(&id) {
            let contributes = goal.contributors().any(|c| c == pred.id());
            match pred.status() {
                NodeStatus::Completed => started |= contributes,
                NodeStatus::InProgress => {
                    started |= contributes;
                    all_done = false;
                }
                NodeStatus::Failed { .. } | NodeStatus::Blocked { .. } => {
                    all_done = false;
                    if stalled.is_none() {
                        stalled = Some(if contributes {
                            format!("contributor {} did not complete", pred.id())
                        } else {
                            format!("upstream {} did not complete", pred.id())
                        });
                    }
                }
                NodeStatus::Pending | NodeStatus::Ready => all_done = false,
            }
        }
        // A contributor missing from the graph never completes.
        if goal.contributors().any(|c| graph.node(c).is_none()) {
            all_done = false;
        }

        let next = if all_done {
            NodeStatus::Completed
        } else if let Some(reason) = stalled {
            NodeStatus::Blocked { reason }
        } else if started {
            NodeStatus::InProgress
        } else {
            continue;
        };

        if node.status() == &next {
            continue;
        }
        if let Some(node) = graph.node_mut(&id) {
            match next {
                NodeStatus::Completed => node.complete(None),
                NodeStatus::Blocked { reason } => node.block(&reason),
                _ => node.start(),
            }
            changed.push(id);
        }
    }

    Ok(changed)
}

/// Per-status node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn from_graph(graph: &DependencyGraph) -> Self {
        let mut counts = Self::default();
        for node in graph.nodes() {
            counts.record(node.status());
        }
        counts
    }

    pub fn record(&mut self, status: &NodeStatus) {
        match status {
            NodeStatus::Pending => self.pending += 1,
            NodeStatus::Ready => self.ready += 1,
            NodeStatus::InProgress => self.in_progress += 1,
            NodeStatus::Blocked { .. } => self.blocked += 1,
            NodeStatus::Completed => self.completed += 1,
            NodeStatus::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.ready + self.in_progress + self.blocked + self.completed + self.failed
    }
}
