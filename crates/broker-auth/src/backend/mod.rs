//! Admin-tool backends
//!
//! Every call returns a [`CommandOutcome`] instead of failing, so callers can
//! tell "try again on the next trigger" apart from a real failure.

mod kafka;
mod memory;

pub use kafka::{parse_acl_listing, KafkaToolsBackend, ToolsConfig};
pub use memory::{CallCounts, MemoryBackend};

use async_trait::async_trait;

use broker_core::types::AclEntry;

/// Result of one admin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Command succeeded, with its output
    Ready(String),
    /// The backend is not reachable yet; retry later
    NotReadyYet(String),
    /// The command ran and failed
    Failed(String),
}

impl CommandOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, CommandOutcome::Ready(_))
    }
}

/// SCRAM user and ACL administration against the dependency service
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Create or update a SCRAM-SHA-512 user
    async fn upsert_user(&self, zookeeper: &str, username: &str, password: &str) -> CommandOutcome;

    async fn delete_user(&self, zookeeper: &str, username: &str) -> CommandOutcome;

    async fn add_acls(&self, zookeeper: &str, acls: &[AclEntry]) -> CommandOutcome;

    /// Revoke every ACL held by a principal
    async fn remove_all_acls(&self, zookeeper: &str, username: &str) -> CommandOutcome;
}
