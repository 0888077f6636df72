//! Node data model for the goal graph.
//!
//! Every vertex shares a [`NodeHeader`] (identity, status, priority,
//! timestamps) and carries a kind-specific payload: a [`TaskDetails`] for
//! atomic work or a [`GoalDetails`] for aggregating objectives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a node. Tasks and goals share one namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a fresh identifier from a UUID v4.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum NodeStatus {
    /// Created, predecessors not yet resolved.
    Pending,
    /// All precedence predecessors completed.
    Ready,
    /// Handed to the execution engine.
    InProgress,
    /// Cannot proceed.
    Blocked {
        /// Why the node is blocked.
        reason: String,
    },
    /// Finished successfully.
    Completed,
    /// The work callback failed.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl NodeStatus {
    /// Stable lowercase label without the attached reason.
    pub fn label(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::InProgress => "in_progress",
            NodeStatus::Blocked { .. } => "blocked",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, NodeStatus::Completed)
    }

    /// Failed or blocked: the node will not complete during this run.
    pub fn is_stalled(&self) -> bool {
        matches!(self, NodeStatus::Failed { .. } | NodeStatus::Blocked { .. })
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Failed { error } => write!(f, "failed: {}", error),
            NodeStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Ordered scheduling priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::Validation(format!("unknown priority '{}'", other))),
        }
    }
}

/// Fields shared by tasks and goals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeader {
    pub id: NodeId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: NodeStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload of an atomic unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDetails {
    /// Free-form classification used by external routing.
    #[serde(default)]
    pub task_type: String,
    /// Opaque executor reference.
    pub assigned_to: Option<String>,
    /// Payload stored when the work callback succeeds.
    pub result: Option<serde_json::Value>,
}

/// Payload of an aggregating objective.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalDetails {
    /// Informational only; never evaluated mechanically.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub contributing_task_ids: BTreeSet<NodeId>,
    #[serde(default)]
    pub contributing_subgoal_ids: BTreeSet<NodeId>,
}

impl GoalDetails {
    pub fn contributor_count(&self) -> usize {
        self.contributing_task_ids.len() + self.contributing_subgoal_ids.len()
    }

    /// All contributors, tasks first, each group in id order.
    pub fn contributors(&self) -> impl Iterator<Item = &NodeId> {
        self.contributing_task_ids
            .iter()
            .chain(self.contributing_subgoal_ids.iter())
    }
}

/// Discriminates tasks from goals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeKind {
    Task(TaskDetails),
    Goal(GoalDetails),
}

/// A vertex in the goal graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(flatten)]
    pub header: NodeHeader,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    /// Create a task node. The title must be non-empty.
    pub fn task(id: impl Into<NodeId>, title: &str) -> Result<Self> {
        Self::with_kind(id.into(), title, NodeKind::Task(TaskDetails::default()))
    }

    /// Create a goal node with no contributors. The title must be non-empty.
    pub fn goal(id: impl Into<NodeId>, title: &str) -> Result<Self> {
        Self::with_kind(id.into(), title, NodeKind::Goal(GoalDetails::default()))
    }

    fn with_kind(id: NodeId, title: &str, kind: NodeKind) -> Result<Self> {
        if id.0.trim().is_empty() {
            return Err(Error::Validation("node id must not be empty".to_string()));
        }
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation(format!(
                "node {} must have a non-empty title",
                id
            )));
        }
        let now = Utc::now();
        Ok(Self {
            header: NodeHeader {
                id,
                title: title.to_string(),
                description: String::new(),
                status: NodeStatus::Pending,
                priority: Priority::default(),
                created_at: now,
                updated_at: now,
            },
            kind,
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.header.description = description.to_string();
        self
    }

    /// Override the creation timestamp (used for conflict tie-breaks).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.header.created_at = created_at;
        self.header.updated_at = created_at;
        self
    }

    /// Set the routing classification. No effect on goals.
    pub fn with_task_type(mut self, task_type: &str) -> Self {
        if let NodeKind::Task(details) = &mut self.kind {
            details.task_type = task_type.to_string();
        }
        self
    }

    /// Set the executor reference. No effect on goals.
    pub fn with_assignee(mut self, assignee: &str) -> Self {
        if let NodeKind::Task(details) = &mut self.kind {
            details.assigned_to = Some(assignee.to_string());
        }
        self
    }

    /// Append a success criterion. No effect on tasks.
    pub fn with_success_criterion(mut self, criterion: &str) -> Self {
        if let NodeKind::Goal(details) = &mut self.kind {
            details.success_criteria.push(criterion.to_string());
        }
        self
    }

    /// Pre-register a contributing task. No effect on tasks.
    pub fn with_contributing_task(mut self, id: impl Into<NodeId>) -> Self {
        if let NodeKind::Goal(details) = &mut self.kind {
            details.contributing_task_ids.insert(id.into());
        }
        self
    }

    /// Pre-register a contributing sub-goal. No effect on tasks.
    pub fn with_contributing_subgoal(mut self, id: impl Into<NodeId>) -> Self {
        if let NodeKind::Goal(details) = &mut self.kind {
            details.contributing_subgoal_ids.insert(id.into());
        }
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.header.id
    }

    pub fn title(&self) -> &str {
        &self.header.title
    }

    pub fn status(&self) -> &NodeStatus {
        &self.header.status
    }

    pub fn priority(&self) -> Priority {
        self.header.priority
    }

    pub fn is_task(&self) -> bool {
        matches!(self.kind, NodeKind::Task(_))
    }

    pub fn is_goal(&self) -> bool {
        matches!(self.kind, NodeKind::Goal(_))
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            NodeKind::Task(_) => "task",
            NodeKind::Goal(_) => "goal",
        }
    }

    pub fn as_task(&self) -> Option<&TaskDetails> {
        match &self.kind {
            NodeKind::Task(details) => Some(details),
            NodeKind::Goal(_) => None,
        }
    }

    pub fn as_goal(&self) -> Option<&GoalDetails> {
        match &self.kind {
            NodeKind::Goal(details) => Some(details),
            NodeKind::Task(_) => None,
        }
    }

    pub fn as_goal_mut(&mut self) -> Option<&mut GoalDetails> {
        match &mut self.kind {
            NodeKind::Goal(details) => Some(details),
            NodeKind::Task(_) => None,
        }
    }

    /// Title and description joined, used as detection input.
    pub fn text(&self) -> String {
        if self.header.description.is_empty() {
            self.header.title.clone()
        } else {
            format!("{} {}", self.header.title, self.header.description)
        }
    }

    fn set_status(&mut self, status: NodeStatus) {
        self.header.status = status;
        self.header.updated_at = Utc::now();
    }

    /// Transition to Ready once predecessors are satisfied.
    pub fn mark_ready(&mut self) {
        self.set_status(NodeStatus::Ready);
    }

    /// Hand the node to the execution engine.
    pub fn start(&mut self) {
        self.set_status(NodeStatus::InProgress);
    }

    /// Mark the node completed, storing the task payload if any.
    pub fn complete(&mut self, result: Option<serde_json::Value>) {
        if let NodeKind::Task(details) = &mut self.kind {
            details.result = result;
        }
        self.set_status(NodeStatus::Completed);
    }

    pub fn fail(&mut self, error: &str) {
        self.set_status(NodeStatus::Failed {
            error: error.to_string(),
        });
    }

    pub fn block(&mut self, reason: &str) {
        self.set_status(NodeStatus::Blocked {
            reason: reason.to_string(),
        });
    }

    /// Return an interrupted node to Pending so a later run can pick it up.
    pub fn reset(&mut self) {
        self.set_status(NodeStatus::Pending);
    }

    /// Completed or failed.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.header.status,
            NodeStatus::Completed | NodeStatus::Failed { .. }
        )
    }

    /// Pending or Ready.
    pub fn can_start(&self) -> bool {
        matches!(self.header.status, NodeStatus::Pending | NodeStatus::Ready)
    }
}
