//! TLS flag shared between the cluster and its dependency

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsState {
    Enabled,
    #[default]
    Disabled,
}

impl TlsState {
    /// Anything other than `enabled` reads as disabled
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("enabled") => TlsState::Enabled,
            _ => TlsState::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, TlsState::Enabled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsState::Enabled => "enabled",
            TlsState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for TlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
