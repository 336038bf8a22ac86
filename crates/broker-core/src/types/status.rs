//! Operator-visible node status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health surface reported to the host for a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    Installing,
    Waiting(String),
    Active(Option<String>),
    Blocked(String),
}

impl Default for UnitStatus {
    fn default() -> Self {
        UnitStatus::Installing
    }
}

impl UnitStatus {
    pub fn waiting(reason: impl Into<String>) -> Self {
        UnitStatus::Waiting(reason.into())
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        UnitStatus::Blocked(reason.into())
    }

    pub fn active() -> Self {
        UnitStatus::Active(None)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, UnitStatus::Active(_))
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, UnitStatus::Blocked(_))
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            UnitStatus::Installing => None,
            UnitStatus::Waiting(m) | UnitStatus::Blocked(m) => Some(m),
            UnitStatus::Active(m) => m.as_deref(),
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Installing => write!(f, "installing"),
            UnitStatus::Waiting(m) => write!(f, "waiting({})", m),
            UnitStatus::Active(None) => write!(f, "active"),
            UnitStatus::Active(Some(m)) => write!(f, "active({})", m),
            UnitStatus::Blocked(m) => write!(f, "blocked({})", m),
        }
    }
}
