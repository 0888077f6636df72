use thiserror::Error;

use crate::core::NodeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Node already exists: {0}")]
    DuplicateId(NodeId),

    #[error("Node not found: {0}")]
    UnknownNode(NodeId),

    #[error("Adding {relationship} edge from {source_id} to {target_id} would create a cycle")]
    Cycle {
        source_id: NodeId,
        target_id: NodeId,
        relationship: crate::core::RelationshipType,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Relationship detection timed out after {0:?}")]
    DetectionTimeout(std::time::Duration),

    #[error("Relationship detection failed: {0}")]
    Detection(String),

    #[error("Task execution failed: {0}")]
    Execution(String),

    #[error("Store write failed: {0}")]
    Store(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No home directory")]
    NoHomeDir,
}

impl Error {
    /// Whether this error came from a structural graph mutation that was
    /// rejected and left the graph unchanged.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::DuplicateId(_) | Error::UnknownNode(_) | Error::Cycle { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
