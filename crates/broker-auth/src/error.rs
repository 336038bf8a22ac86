//! Authorization and credential errors

use thiserror::Error;

use broker_state::StateError;

/// Result type for credential operations
pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Password rotation must be called on leader unit")]
    NotLeader,

    #[error("Password already exists, please choose a different password.")]
    PasswordInUse,

    #[error("Can only update internal users {internal:?}, not {username}")]
    UnknownPrincipal {
        username: String,
        internal: Vec<&'static str>,
    },

    #[error("No stored password for internal user {0}")]
    MissingPassword(String),

    #[error("Backend not ready: {0}")]
    Unavailable(String),

    #[error("Backend command failed: {0}")]
    Backend(String),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

impl AuthError {
    /// Whether retrying on a later trigger may succeed without operator action
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Unavailable(_))
    }
}
