//! Orchestration layer for goalweave.
//!
//! This module provides the components that act on the dependency graph:
//! the tiered relationship detector, conflict resolution, the level-by-level
//! scheduler and its synergy-aware variant, best-effort persistence, and the
//! [`Orchestrator`] facade that ties them together.

mod detection;
mod orchestrator;
mod resolver;
mod scheduler;
mod store;
mod synergy;

pub use detection::{
    Detection, DetectionTier, LexicalTier, RelationshipDetector, SemanticClassifier, SemanticTier,
    SimilarityProvider, SimilarityTier,
};
pub use orchestrator::{Orchestrator, StatusSnapshot, CONFIDENCE_KEY, DETECTED_KEY, TIER_KEY};
pub use resolver::{ConflictDecision, ConflictResolver, Rejection, Resolution};
pub use scheduler::{
    ExecutionPlan, ExecutionReport, ExecutionResult, MergedUnit, ScheduleUnit, SchedulerEvent,
    SkippedMerge, TopologicalExecutor, WorkExecutor,
};
pub use store::{InMemoryStore, NodeStore, StoreWriter};
pub use synergy::{contract, synergy_components, SynergyAwareExecutor, UnifiedPlan, Unifier};
