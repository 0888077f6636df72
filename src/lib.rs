//! goalweave: a multi-goal dependency graph orchestrator.
//!
//! Goals and tasks live in one typed dependency graph. Precedence edges
//! (`enables`, `subgoal_of`) are kept acyclic and drive level-by-level
//! execution; the other relationship types steer scheduling (conflicts,
//! synergy merges) without gating it. See [`orchestration::Orchestrator`]
//! for the entry point.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod util;

pub use config::{ConflictPolicy, OrchestratorConfig};
pub use error::{Error, Result};
pub use orchestration::Orchestrator;
