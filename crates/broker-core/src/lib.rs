//! Broker Operator Core Library
//!
//! Core types, constants and configuration shared by every broker-operator crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::OperatorConfig;
pub use error::{Error, Result};

/// Operator version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default application name, also used as the dependency chroot
pub const APP_NAME: &str = "kafka";

/// Internal principal used for inter-broker authentication
pub const INTER_BROKER_USER: &str = "sync";

/// Internal principal handed to operators through `get-admin-credentials`
pub const ADMIN_USER: &str = "admin";

/// Every internal principal, in the order credentials are applied
pub const INTERNAL_USERS: [&str; 2] = [INTER_BROKER_USER, ADMIN_USER];

/// Client listener port without TLS
pub const CLIENT_PORT: u16 = 9092;

/// Client listener port with TLS
pub const CLIENT_TLS_PORT: u16 = 9093;

/// Inter-broker listener port
pub const INTERNAL_PORT: u16 = 19092;

/// Default dependency (ZooKeeper) client port
pub const DEPENDENCY_PORT: u16 = 2181;

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 32;

/// Well-known shared-store keys
pub mod keys {
    /// Cluster scope: set once every internal user exists on the backend
    pub const CREDENTIALS_READY: &str = "credentials-ready";
    /// Cluster scope: `;`-joined superuser principals
    pub const SUPERUSERS: &str = "superusers";
    /// Cluster scope: TLS flag written by the certificates collaborator
    pub const TLS: &str = "tls";

    /// Node scope: this node's network address
    pub const ADDRESS: &str = "address";
    /// Node scope: restart lock ticket
    pub const RESTART_LOCK_QUEUE: &str = "restart-lock-queue";
    /// Node scope: set to the node id while the node holds the restart lock
    pub const RESTART_LOCK_HOLDER: &str = "restart-lock-holder";
    /// Node scope: action to run when the lock is granted
    pub const RESTART_LOCK_ACTION: &str = "restart-lock-action";
    /// Node scope: last reported status, JSON encoded
    pub const STATUS: &str = "status";

    /// Dependency relation (local side): chroot requested by the leader
    pub const CHROOT: &str = "chroot";

    /// Cluster scope key holding an internal principal's password
    pub fn password_key(username: &str) -> String {
        format!("{}-password", username)
    }

    /// Cluster scope key holding a client grant
    pub fn relation_key(relation_id: u32) -> String {
        format!("relation-{}", relation_id)
    }
}
