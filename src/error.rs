//! Error types for the ancestry engine

use thiserror::Error;

use crate::types::NodeId;

pub type Result<T> = std::result::Result<T, AncestryError>;

#[derive(Error, Debug)]
pub enum AncestryError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Shard {shard} unavailable ({ids} ids not served)")]
    ShardUnavailable { shard: u16, ids: usize },

    #[error("Index not built yet for node {0}")]
    IndexInconsistent(NodeId),

    #[error("Node {0} descends from a quarantined subgraph")]
    CorruptSubgraph(NodeId),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Ingest pipeline stopped")]
    IngestStopped,
}

impl AncestryError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            AncestryError::NodeNotFound(_) => "NODE_NOT_FOUND",
            AncestryError::ShardUnavailable { .. } => "SHARD_UNAVAILABLE",
            AncestryError::IndexInconsistent(_) => "INDEX_INCONSISTENT",
            AncestryError::CorruptSubgraph(_) => "CORRUPT_SUBGRAPH",
            AncestryError::Config(_) => "INVALID_CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True for conditions that may clear up on their own (retry later or
    /// with a larger budget).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AncestryError::ShardUnavailable { .. } | AncestryError::IndexInconsistent(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let id = NodeId(7);
        assert_eq!(AncestryError::NodeNotFound(id).code(), "NODE_NOT_FOUND");
        assert_eq!(AncestryError::IndexInconsistent(id).code(), "INDEX_INCONSISTENT");
        assert_eq!(
            AncestryError::ShardUnavailable { shard: 1, ids: 3 }.code(),
            "SHARD_UNAVAILABLE"
        );
        assert_eq!(AncestryError::IngestStopped.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AncestryError::ShardUnavailable { shard: 0, ids: 1 }.is_transient());
        assert!(AncestryError::IndexInconsistent(NodeId(1)).is_transient());
        assert!(!AncestryError::NodeNotFound(NodeId(1)).is_transient());
        assert!(!AncestryError::CorruptSubgraph(NodeId(1)).is_transient());
    }

    #[test]
    fn test_display_includes_id() {
        let err = AncestryError::NodeNotFound(NodeId(0xabc));
        assert!(err.to_string().contains("abc"), "unexpected: {}", err);
    }
}
