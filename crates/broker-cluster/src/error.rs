//! Cluster error types

use thiserror::Error;

use broker_auth::AuthError;
use broker_state::StateError;

/// Result type for reconciliation and coordination
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Event {0} requires a relation id")]
    MissingRelationId(String),

    #[error("Workload error: {0}")]
    Workload(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Core error: {0}")]
    Core(#[from] broker_core::Error),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
