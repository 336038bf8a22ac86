//! State store error types

use thiserror::Error;

/// Result type for state store operations
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by the typed scope accessors and snapshot persistence
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Node {0} is not the leader and cannot write cluster scope")]
    NotLeader(String),

    #[error("Node {writer} cannot write the scope of node {owner}")]
    ForeignScope { owner: String, writer: String },

    #[error("Scope is read-only: {0}")]
    ReadOnly(String),

    #[error("Unknown relation: {0}")]
    UnknownRelation(u32),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] broker_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
