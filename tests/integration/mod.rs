//! Integration test suite for goalweave.
//!
//! These tests drive the [`Orchestrator`](goalweave::Orchestrator) facade
//! end to end: building graphs, detecting relationships, executing levels
//! and reading status back.
//!
//! # Test Categories
//!
//! - `scenarios`: The reference scenarios for progress, ordering, cycles,
//!   detection and conflicts
//! - `execution`: Failure isolation, bounded parallelism, cancellation
//! - `conflicts`: Conflict policies across passes and levels
//! - `synergy`: Synergy merges and their fallbacks
//! - `detection`: Tiered detection through `auto_relate`
//! - `persistence`: Write-through store behaviour and config loading
//!
//! # CI Compatibility
//!
//! All collaborators are in-process mocks; nothing touches the network.

mod fixtures;

mod scenarios;
mod conflicts;
mod detection;
mod persistence;
