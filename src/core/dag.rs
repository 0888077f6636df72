//! Goal graph: a directed multigraph of tasks and goals.
//!
//! Nodes live in a petgraph `DiGraph` keyed by [`NodeId`]. Any number of
//! typed edges may join the same pair of nodes, but the subgraph of
//! precedence edges (`enables`, `subgoal_of`) is kept acyclic: a mutation
//! that would close a cycle is rejected before anything is written.

use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write as _;

use crate::core::node::{Node, NodeId, NodeKind, NodeStatus, Priority};
use crate::core::relationship::{DependencyEdge, RelationshipType};
use crate::error::{Error, Result};

/// Tie-break used everywhere an ordering is reported: higher priority
/// first, then ascending id.
type OrderKey = (Reverse<Priority>, NodeId);

/// The goal dependency graph.
#[derive(Clone, Default)]
pub struct DependencyGraph {
    /// The underlying directed multigraph.
    graph: DiGraph<Node, DependencyEdge>,
    /// Index mapping from NodeId to NodeIndex for fast lookups.
    node_index: HashMap<NodeId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    ///
    /// A goal that already lists contributors gets a `subgoal_of` edge from
    /// each of them; every listed contributor must exist and be of the
    /// right kind.
    ///
    /// # Errors
    /// - `DuplicateId` if the id is taken
    /// - `UnknownNode` if a listed contributor is missing
    /// - `Validation` if a contributor has the wrong kind
    pub fn add_node(&mut self, node: Node) -> Result<NodeIndex> {
        if self.node_index.contains_key(node.id()) {
            return Err(Error::DuplicateId(node.id().clone()));
        }

        let mut contributors = Vec::new();
        if let Some(goal) = node.as_goal() {
            for id in &goal.contributing_task_ids {
                self.expect_kind(id, true)?;
                contributors.push(id.clone());
            }
            for id in &goal.contributing_subgoal_ids {
                self.expect_kind(id, false)?;
                contributors.push(id.clone());
            }
        }

        let id = node.id().clone();
        let index = self.graph.add_node(node);
        self.node_index.insert(id.clone(), index);

        // The new goal has no outgoing edges, so these cannot close a cycle.
        for contributor in contributors {
            let source = self.node_index[&contributor];
            self.graph.add_edge(
                source,
                index,
                DependencyEdge::new(contributor, id.clone(), RelationshipType::SubgoalOf),
            );
        }

        Ok(index)
    }

    fn expect_kind(&self, id: &NodeId, task: bool) -> Result<()> {
        let node = self
            .node(id)
            .ok_or_else(|| Error::UnknownNode(id.clone()))?;
        if node.is_task() != task {
            return Err(Error::Validation(format!(
                "{} is a {}, expected a {}",
                id,
                node.kind_label(),
                if task { "task" } else { "goal" }
            )));
        }
        Ok(())
    }

    /// Add a typed edge.
    ///
    /// Symmetric edges are canonicalised so inserting the same pair from
    /// either direction stores one edge. Returns `false` when an identical
    /// edge (same endpoints and type) already exists.
    ///
    /// # Errors
    /// - `UnknownNode` if either endpoint is missing
    /// - `Cycle` if a precedence edge would close a cycle (including a
    ///   self-loop)
    /// - `Validation` for a symmetric self-relationship or a `subgoal_of`
    ///   edge whose target is not a goal
    ///
    /// The graph is unchanged whenever an error is returned.
    pub fn add_edge(&mut self, edge: DependencyEdge) -> Result<bool> {
        let edge = canonicalize(edge);
        self.check_canonical(&edge)?;
        if self.has_edge(&edge.source_id, &edge.target_id, edge.relationship) {
            return Ok(false);
        }

        let source = self.index_of(&edge.source_id)?;
        let target = self.index_of(&edge.target_id)?;
        let relationship = edge.relationship;

        if relationship == RelationshipType::SubgoalOf {
            let contributor_is_task = self.graph[source].is_task();
            let contributor = edge.source_id.clone();
            if let Some(goal) = self.graph[target].as_goal_mut() {
                if contributor_is_task {
                    goal.contributing_task_ids.insert(contributor);
                } else {
                    goal.contributing_subgoal_ids.insert(contributor);
                }
            }
        }

        self.graph.add_edge(source, target, edge);
        Ok(true)
    }

    /// Run the checks [`add_edge`](Self::add_edge) applies without touching
    /// the graph. `Ok` means the edge can be stored (or already is).
    pub fn check_edge(&self, edge: &DependencyEdge) -> Result<()> {
        self.check_canonical(&canonicalize(edge.clone()))
    }

    fn check_canonical(&self, edge: &DependencyEdge) -> Result<()> {
        let source = self.index_of(&edge.source_id)?;
        let target = self.index_of(&edge.target_id)?;
        let relationship = edge.relationship;

        if source == target {
            if relationship.is_precedence() {
                return Err(cycle_error(edge));
            }
            return Err(Error::Validation(format!(
                "{} cannot be {} with itself",
                edge.source_id, relationship
            )));
        }

        if relationship == RelationshipType::SubgoalOf && !self.graph[target].is_goal() {
            return Err(Error::Validation(format!(
                "subgoal_of target {} is not a goal",
                edge.target_id
            )));
        }

        if relationship.is_precedence()
            && !self.has_edge(&edge.source_id, &edge.target_id, relationship)
            && self.precedence_path(target, source)
        {
            return Err(cycle_error(edge));
        }
        Ok(())
    }

    /// Whether adding a precedence edge `source -> target` would close a cycle.
    pub fn would_create_cycle(&self, source: &NodeId, target: &NodeId) -> Result<bool> {
        let s = self.index_of(source)?;
        let t = self.index_of(target)?;
        Ok(s == t || self.precedence_path(t, s))
    }

    fn precedence_path(&self, from: NodeIndex, to: NodeIndex) -> bool {
        has_path_connecting(&self.precedence_view(), from, to, None)
    }

    /// Projection onto precedence edges only. Node indices are preserved
    /// because no node is dropped.
    fn precedence_view(&self) -> DiGraph<(), ()> {
        self.graph.filter_map(
            |_, _| Some(()),
            |_, edge| edge.relationship.is_precedence().then_some(()),
        )
    }

    fn index_of(&self, id: &NodeId) -> Result<NodeIndex> {
        self.node_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownNode(id.clone()))
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.node_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        match self.node_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.node_index.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.graph.edge_weights()
    }

    pub fn edges_of_type(&self, relationship: RelationshipType) -> Vec<&DependencyEdge> {
        self.edges()
            .filter(|edge| edge.relationship == relationship)
            .collect()
    }

    /// Whether `a` and `b` are joined by `relationship` (either direction
    /// for symmetric types).
    pub fn has_edge(&self, a: &NodeId, b: &NodeId, relationship: RelationshipType) -> bool {
        let (Some(&ai), Some(&bi)) = (self.node_index.get(a), self.node_index.get(b)) else {
            return false;
        };
        let mut candidates = self.graph.edges_connecting(ai, bi).chain(
            relationship
                .is_symmetric()
                .then(|| self.graph.edges_connecting(bi, ai))
                .into_iter()
                .flatten(),
        );
        candidates.any(|e| e.weight().relationship == relationship)
    }

    /// Every edge between `a` and `b`, in either direction.
    pub fn edges_between(&self, a: &NodeId, b: &NodeId) -> Vec<&DependencyEdge> {
        let (Some(&ai), Some(&bi)) = (self.node_index.get(a), self.node_index.get(b)) else {
            return Vec::new();
        };
        self.graph
            .edges_connecting(ai, bi)
            .chain(self.graph.edges_connecting(bi, ai))
            .map(|e| e.weight())
            .collect()
    }

    /// Nodes with a precedence edge into `id`.
    pub fn precedence_predecessors(&self, id: &NodeId) -> Vec<&Node> {
        self.precedence_neighbors(id, Direction::Incoming)
    }

    /// Nodes reached by a precedence edge out of `id`.
    pub fn precedence_successors(&self, id: &NodeId) -> Vec<&Node> {
        self.precedence_neighbors(id, Direction::Outgoing)
    }

    fn precedence_neighbors(&self, id: &NodeId, direction: Direction) -> Vec<&Node> {
        let Some(&index) = self.node_index.get(id) else {
            return Vec::new();
        };
        let mut seen = Vec::new();
        for edge in self.graph.edges_directed(index, direction) {
            if !edge.weight().relationship.is_precedence() {
                continue;
            }
            let other = match direction {
                Direction::Incoming => edge.source(),
                Direction::Outgoing => edge.target(),
            };
            if !seen.contains(&other) {
                seen.push(other);
            }
        }
        seen.into_iter().map(|i| &self.graph[i]).collect()
    }

    /// Nodes joined to `id` by a symmetric `relationship`.
    pub fn symmetric_neighbors(&self, id: &NodeId, relationship: RelationshipType) -> Vec<NodeId> {
        let Some(&index) = self.node_index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<NodeId> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .chain(self.graph.edges_directed(index, Direction::Incoming))
            .filter(|e| e.weight().relationship == relationship)
            .filter_map(|e| e.weight().other_end(id).cloned())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Whether every precedence predecessor of `id` has completed.
    pub fn predecessors_completed(&self, id: &NodeId) -> bool {
        self.precedence_predecessors(id)
            .iter()
            .all(|node| node.status().is_completed())
    }

    // ========== Validation & Scheduling ==========

    /// Every cycle in the precedence subgraph, each as a sorted id list.
    /// Empty means valid.
    pub fn validate(&self) -> Vec<Vec<NodeId>> {
        let view = self.precedence_view();
        let mut cycles: Vec<Vec<NodeId>> = tarjan_scc(&view)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || view.find_edge(component[0], component[0]).is_some()
            })
            .map(|component| {
                let mut ids: Vec<NodeId> = component
                    .into_iter()
                    .map(|i| self.graph[i].id().clone())
                    .collect();
                ids.sort();
                ids
            })
            .collect();
        cycles.sort();
        cycles
    }

    fn order_key(&self, index: NodeIndex) -> OrderKey {
        let node = &self.graph[index];
        (Reverse(node.priority()), node.id().clone())
    }

    /// Topological order over precedence edges (Kahn's algorithm).
    ///
    /// Among nodes whose predecessors are all placed, higher priority comes
    /// first, then ascending id.
    pub fn execution_order(&self) -> Result<Vec<NodeId>> {
        Ok(self
            .topological_indices()?
            .into_iter()
            .map(|i| self.graph[i].id().clone())
            .collect())
    }

    fn topological_indices(&self) -> Result<Vec<NodeIndex>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|i| (i, 0))
            .collect();
        for edge in self.graph.edge_references() {
            if edge.weight().relationship.is_precedence() {
                *in_degree.entry(edge.target()).or_default() += 1;
            }
        }

        let mut heap: BinaryHeap<Reverse<(OrderKey, NodeIndex)>> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&i, _)| Reverse((self.order_key(i), i)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, index))) = heap.pop() {
            order.push(index);
            for edge in self.graph.edges_directed(index, Direction::Outgoing) {
                if !edge.weight().relationship.is_precedence() {
                    continue;
                }
                let target = edge.target();
                if let Some(deg) = in_degree.get_mut(&target) {
                    *deg -= 1;
                    if *deg == 0 {
                        heap.push(Reverse((self.order_key(target), target)));
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            let cycle = self.validate().into_iter().next().unwrap_or_default();
            let names: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
            return Err(Error::Validation(format!(
                "precedence cycle detected: {}",
                names.join(", ")
            )));
        }
        Ok(order)
    }

    /// Nodes grouped by dependency depth: the length of the longest
    /// precedence chain ending at the node. Within a level the order
    /// follows [`execution_order`](Self::execution_order).
    pub fn execution_levels(&self) -> Result<Vec<Vec<NodeId>>> {
        let order = self.topological_indices()?;
        let mut depth: HashMap<NodeIndex, usize> = HashMap::with_capacity(order.len());
        let mut levels: Vec<Vec<NodeId>> = Vec::new();

        for index in order {
            let d = self
                .graph
                .edges_directed(index, Direction::Incoming)
                .filter(|e| e.weight().relationship.is_precedence())
                .filter_map(|e| depth.get(&e.source()).map(|p| p + 1))
                .max()
                .unwrap_or(0);
            depth.insert(index, d);
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(self.graph[index].id().clone());
        }

        Ok(levels)
    }

    /// Pending nodes whose precedence predecessors are all completed, in
    /// reporting order. Nodes already marked ready are not repeated.
    pub fn get_ready_nodes(&self) -> Vec<NodeId> {
        let mut ready: Vec<(OrderKey, NodeId)> = self
            .graph
            .node_indices()
            .filter(|&i| {
                let node = &self.graph[i];
                node.status() == &NodeStatus::Pending && self.predecessors_completed(node.id())
            })
            .map(|i| (self.order_key(i), self.graph[i].id().clone()))
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, id)| id).collect()
    }

    /// Graphviz DOT rendering. Nodes and edges are sorted so the output is
    /// stable for an unchanged graph.
    pub fn to_dot(&self) -> String {
        let mut nodes: Vec<&Node> = self.nodes().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        let mut edges: Vec<&DependencyEdge> = self.edges().collect();
        edges.sort_by(|a, b| {
            (&a.source_id, &a.target_id, a.relationship).cmp(&(
                &b.source_id,
                &b.target_id,
                b.relationship,
            ))
        });

        let mut out = String::from("digraph goals {\n");
        for node in nodes {
            let shape = match node.kind {
                NodeKind::Goal(_) => "ellipse",
                NodeKind::Task(_) => "box",
            };
            let _ = writeln!(
                out,
                "  \"{}\" [label=\"{}\\n({})\", shape={}, priority={}];",
                escape(node.id().as_str()),
                escape(node.title()),
                node.status().label(),
                shape,
                node.priority()
            );
        }
        for edge in edges {
            let dir = if edge.relationship.is_symmetric() {
                ", dir=none"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [label=\"{}\", weight={}{}];",
                escape(edge.source_id.as_str()),
                escape(edge.target_id.as_str()),
                edge.relationship,
                edge.weight,
                dir
            );
        }
        out.push_str("}\n");
        out
    }

    pub fn status_of(&self, id: &NodeId) -> Option<&NodeStatus> {
        self.node(id).map(|n| n.status())
    }
}

fn canonicalize(mut edge: DependencyEdge) -> DependencyEdge {
    if edge.relationship.is_symmetric() && edge.target_id < edge.source_id {
        std::mem::swap(&mut edge.source_id, &mut edge.target_id);
    }
    edge
}

fn cycle_error(edge: &DependencyEdge) -> Error {
    Error::Cycle {
        source_id: edge.source_id.clone(),
        target_id: edge.target_id.clone(),
        relationship: edge.relationship,
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\r', "")
        .replace('\n', "\\n")
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
