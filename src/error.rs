//! Error types for the graph store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(u128),

    #[error("Edge not found: {src} -> {dst} ({kind})")]
    EdgeNotFound { src: u128, dst: u128, kind: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Manifest references a missing/corrupt file, or a file exists that no
    /// manifest version references (strict mode). Always fatal.
    #[error("Manifest consistency violation: {0}")]
    ManifestInconsistency(String),

    #[error("Malformed record at index {index}: {reason}")]
    MalformedRecord { index: usize, reason: String },

    #[error("Unknown kind in filter: {0}")]
    UnknownKind(String),

    #[error("Unresolvable shard key: {0:?}")]
    UnresolvableShardKey(String),

    #[error("Shard {shard} failed: {reason}")]
    ShardFailed { shard: u16, reason: String },

    #[error("Engine is poisoned after a failed manifest commit: {0}")]
    EnginePoisoned(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GraphError {
    /// Errors that should take down the whole engine instance rather than
    /// a single shard.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GraphError::ManifestInconsistency(_) | GraphError::EnginePoisoned(_)
        )
    }
}
