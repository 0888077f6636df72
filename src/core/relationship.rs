//! Typed relationships between goal-graph nodes.
//!
//! Edges carry one of six [`RelationshipType`]s. Precedence types
//! (`enables`, `subgoal_of`) are directed and gate scheduling; the other
//! four are symmetric and stored once per unordered pair, lexicographically
//! smaller id first.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::node::NodeId;
use crate::error::{Error, Result};

/// Metadata key holding the merge strategy of a synergistic edge.
pub const STRATEGY_KEY: &str = "strategy";
/// Metadata key holding the prioritisation boost of a reinforcing edge.
pub const BOOST_FACTOR_KEY: &str = "boost_factor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Source must complete before target may become ready.
    Enables,
    /// Source counts toward the target goal's progress.
    SubgoalOf,
    /// Both nodes should be unified into one plan before scheduling.
    Synergistic,
    /// The two nodes must not both run or complete.
    ConflictsWith,
    /// Prioritisation hint only.
    Reinforces,
    /// No relationship.
    Independent,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 6] = [
        RelationshipType::Enables,
        RelationshipType::SubgoalOf,
        RelationshipType::Synergistic,
        RelationshipType::ConflictsWith,
        RelationshipType::Reinforces,
        RelationshipType::Independent,
    ];

    /// Symmetric types are stored with canonical endpoint order.
    pub fn is_symmetric(&self) -> bool {
        !self.is_precedence()
    }

    /// Precedence types must stay acyclic and gate readiness.
    pub fn is_precedence(&self) -> bool {
        matches!(self, RelationshipType::Enables | RelationshipType::SubgoalOf)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Enables => "enables",
            RelationshipType::SubgoalOf => "subgoal_of",
            RelationshipType::Synergistic => "synergistic",
            RelationshipType::ConflictsWith => "conflicts_with",
            RelationshipType::Reinforces => "reinforces",
            RelationshipType::Independent => "independent",
        }
    }
}

impl Default for RelationshipType {
    fn default() -> Self {
        Self::Independent
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = Error;

    /// Accepts `ENABLES`, `enables`, `subgoal-of`, `conflicts` and similar
    /// spellings, as returned by free-form classifiers.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "enables" => Ok(RelationshipType::Enables),
            "subgoal_of" | "subgoal" => Ok(RelationshipType::SubgoalOf),
            "synergistic" | "synergy" => Ok(RelationshipType::Synergistic),
            "conflicts_with" | "conflicts" | "conflict" => Ok(RelationshipType::ConflictsWith),
            "reinforces" => Ok(RelationshipType::Reinforces),
            "independent" | "none" => Ok(RelationshipType::Independent),
            _ => Err(Error::Validation(format!(
                "unknown relationship type '{}'",
                s.trim()
            ))),
        }
    }
}

/// An immutable, typed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub relationship: RelationshipType,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DependencyEdge {
    /// Start building an edge from `source` to `target`.
    pub fn builder(source: impl Into<NodeId>, target: impl Into<NodeId>) -> EdgeBuilder {
        EdgeBuilder::new(source, target)
    }

    /// Shorthand for a default-weight edge with no metadata.
    pub fn new(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        relationship: RelationshipType,
    ) -> Self {
        let (source_id, target_id) = canonical_pair(source.into(), target.into(), relationship);
        Self {
            source_id,
            target_id,
            relationship,
            weight: 1.0,
            metadata: BTreeMap::new(),
        }
    }

    /// True when the edge links `a` and `b` with `relationship`, in either
    /// direction for symmetric types.
    pub fn connects(&self, a: &NodeId, b: &NodeId, relationship: RelationshipType) -> bool {
        if self.relationship != relationship {
            return false;
        }
        let forward = &self.source_id == a && &self.target_id == b;
        if relationship.is_symmetric() {
            forward || (&self.source_id == b && &self.target_id == a)
        } else {
            forward
        }
    }

    /// The endpoint opposite `id`, if `id` is one of the endpoints.
    pub fn other_end(&self, id: &NodeId) -> Option<&NodeId> {
        if &self.source_id == id {
            Some(&self.target_id)
        } else if &self.target_id == id {
            Some(&self.source_id)
        } else {
            None
        }
    }
}

fn canonical_pair(
    source: NodeId,
    target: NodeId,
    relationship: RelationshipType,
) -> (NodeId, NodeId) {
    if relationship.is_symmetric() && target < source {
        (target, source)
    } else {
        (source, target)
    }
}

/// Fluent constructor for [`DependencyEdge`].
///
/// ```
/// use goalweave::core::{DependencyEdge, RelationshipType};
///
/// let edge = DependencyEdge::builder("b", "a")
///     .synergistic("shared-schema")
///     .weight(2.0)
///     .build()
///     .unwrap();
/// assert_eq!(edge.source_id.as_str(), "a");
/// assert_eq!(edge.relationship, RelationshipType::Synergistic);
/// ```
#[derive(Debug, Clone)]
pub struct EdgeBuilder {
    source_id: NodeId,
    target_id: NodeId,
    relationship: Option<RelationshipType>,
    weight: f64,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl EdgeBuilder {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source_id: source.into(),
            target_id: target.into(),
            relationship: None,
            weight: 1.0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn relationship(mut self, relationship: RelationshipType) -> Self {
        self.relationship = Some(relationship);
        self
    }

    pub fn enables(self) -> Self {
        self.relationship(RelationshipType::Enables)
    }

    pub fn subgoal_of(self) -> Self {
        self.relationship(RelationshipType::SubgoalOf)
    }

    pub fn synergistic(self, strategy: &str) -> Self {
        self.relationship(RelationshipType::Synergistic)
            .metadata(STRATEGY_KEY, serde_json::Value::from(strategy))
    }

    pub fn conflicts(self) -> Self {
        self.relationship(RelationshipType::ConflictsWith)
    }

    pub fn reinforces(self, boost_factor: f64) -> Self {
        self.relationship(RelationshipType::Reinforces)
            .metadata(BOOST_FACTOR_KEY, serde_json::Value::from(boost_factor))
    }

    pub fn independent(self) -> Self {
        self.relationship(RelationshipType::Independent)
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Validate and produce the edge, canonicalising symmetric endpoints.
    pub fn build(self) -> Result<DependencyEdge> {
        let relationship = self.relationship.ok_or_else(|| {
            Error::Validation(format!(
                "edge {} -> {} has no relationship type",
                self.source_id, self.target_id
            ))
        })?;
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(Error::Validation(format!(
                "edge weight must be a finite non-negative number, got {}",
                self.weight
            )));
        }
        let (source_id, target_id) = canonical_pair(self.source_id, self.target_id, relationship);
        Ok(DependencyEdge {
            source_id,
            target_id,
            relationship,
            weight: self.weight,
            metadata: self.metadata,
        })
    }
}
