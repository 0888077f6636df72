//! Core domain models for goal orchestration.
//!
//! This module contains the fundamental data structures: nodes (tasks and
//! goals), typed relationships, the dependency graph and the progress
//! aggregator that runs over it.

pub mod dag;
pub mod node;
pub mod progress;
pub mod relationship;

pub use dag::DependencyGraph;
pub use node::{GoalDetails, Node, NodeHeader, NodeId, NodeKind, NodeStatus, Priority, TaskDetails};
pub use progress::{derive_goal_statuses, goal_progress, progress, StatusCounts};
pub use relationship::{DependencyEdge, EdgeBuilder, RelationshipType};
