//! Authentication and authorization for the broker operator
//!
//! - [`CredentialAuthority`]: leader-only lifecycle of the internal principals
//! - [`acl`]: role to ACL mapping and the superuser list
//! - [`backend`]: the admin-tool seam, with a command-line and an in-memory
//!   implementation

pub mod acl;
mod authority;
pub mod backend;
mod error;

pub use acl::{acls_for, format_superusers, superusers};
pub use authority::{ApplyStatus, CredentialAuthority};
pub use backend::{
    AuthBackend, CallCounts, CommandOutcome, KafkaToolsBackend, MemoryBackend, ToolsConfig,
};
pub use error::{AuthError, AuthResult};

use rand::distr::Alphanumeric;
use rand::Rng;

use broker_core::PASSWORD_LENGTH;

/// Generate a random alphanumeric password
pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}
