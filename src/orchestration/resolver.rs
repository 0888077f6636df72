//! Resolution of `conflicts_with` pairs before a level starts.
//!
//! Two nodes joined by a `conflicts_with` edge must never both be running or
//! completed. When both are eligible in the same pass, the resolver admits
//! the higher-priority one (earlier creation breaks ties, then id) and turns
//! the other away. A node that conflicts with one already running or
//! completed is always turned away.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::config::ConflictPolicy;
use crate::core::{DependencyGraph, NodeId, NodeStatus, RelationshipType};
use crate::orchestration::scheduler::ScheduleUnit;

/// A recorded scheduling decision between two conflicting nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDecision {
    /// The node allowed to proceed (or the one already running/completed).
    pub winner: NodeId,
    /// The node turned away.
    pub loser: NodeId,
    /// Execution level at which the decision was made.
    pub level: usize,
    pub reason: String,
    /// The loser was held back for re-admission instead of being blocked.
    pub deferred: bool,
}

/// A unit turned away by the resolver.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub unit: ScheduleUnit,
    pub decision: ConflictDecision,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Units cleared to run, in admission order.
    pub admitted: Vec<ScheduleUnit>,
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Contest {
    /// The winner was admitted in this same pass.
    SamePass,
    /// The winner was already running or completed.
    Settled,
}

pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Split `candidates` into admitted and rejected units.
    ///
    /// Candidates are considered greedily in priority order. Only task
    /// members take part; goals are never executed so they never contend.
    pub fn resolve(
        &self,
        graph: &DependencyGraph,
        candidates: Vec<ScheduleUnit>,
        level: usize,
    ) -> Resolution {
        let mut ordered: Vec<_> = candidates
            .into_iter()
            .map(|unit| (unit.admission_key(graph), unit))
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let mut claimed: HashSet<NodeId> = HashSet::new();
        let mut resolution = Resolution::default();

        for (_, unit) in ordered {
            match find_contest(graph, &unit, &claimed) {
                Some((winner, loser, contest)) => {
                    let deferred = contest == Contest::SamePass
                        && self.policy == ConflictPolicy::RunIfWinnerFails;
                    let reason = match contest {
                        Contest::SamePass => format!(
                            "conflicts with {} which was scheduled first at level {}",
                            winner, level
                        ),
                        Contest::Settled => format!(
                            "conflicts with {} which already ran or is running",
                            winner
                        ),
                    };
                    debug!(%winner, %loser, level, deferred, "conflict resolved");
                    resolution.rejected.push(Rejection {
                        unit,
                        decision: ConflictDecision {
                            winner,
                            loser,
                            level,
                            reason,
                            deferred,
                        },
                    });
                }
                None => {
                    for id in unit.members() {
                        if graph.node(id).is_some_and(|n| n.is_task()) {
                            claimed.insert(id.clone());
                        }
                    }
                    resolution.admitted.push(unit);
                }
            }
        }

        resolution
    }
}

fn find_contest(
    graph: &DependencyGraph,
    unit: &ScheduleUnit,
    claimed: &HashSet<NodeId>,
) -> Option<(NodeId, NodeId, Contest)> {
    for member in unit.members() {
        if !graph.node(member).is_some_and(|n| n.is_task()) {
            continue;
        }
        for other in graph.symmetric_neighbors(member, RelationshipType::ConflictsWith) {
            if unit.contains(&other) {
                continue;
            }
            if claimed.contains(&other) {
                return Some((other, member.clone(), Contest::SamePass));
            }
            if matches!(
                graph.status_of(&other),
                Some(NodeStatus::Completed | NodeStatus::InProgress)
            ) {
                return Some((other, member.clone(), Contest::Settled));
            }
        }
    }
    None
}
