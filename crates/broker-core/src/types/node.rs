//! Node identity and role

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Host-assigned node identifier, `<app>/<ordinal>`
pub type NodeId = String;

/// Role of a node within the node-group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Authorized to write cluster scope
    Leader,
    #[default]
    Follower,
}

impl NodeRole {
    pub fn from_leadership(is_leader: bool) -> Self {
        if is_leader {
            NodeRole::Leader
        } else {
            NodeRole::Follower
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "leader"),
            NodeRole::Follower => write!(f, "follower"),
        }
    }
}

/// Ordinal part of a node id, used as the broker id
pub fn node_ordinal(id: &str) -> Result<u32> {
    id.rsplit_once('/')
        .and_then(|(_, ordinal)| ordinal.parse().ok())
        .ok_or_else(|| Error::InvalidNodeId(id.to_string()))
}

/// A member of the node-group as seen through the shared store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    /// Network address published in node scope, if any
    pub address: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            role,
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn ordinal(&self) -> Result<u32> {
        node_ordinal(&self.id)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, NodeRole::Leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ordinal() {
        assert_eq!(node_ordinal("kafka/0").unwrap(), 0);
        assert_eq!(node_ordinal("kafka/12").unwrap(), 12);
        assert!(node_ordinal("kafka").is_err());
        assert!(node_ordinal("kafka/x").is_err());
    }

    #[test]
    fn test_node_role() {
        let node = Node::new("kafka/1", NodeRole::from_leadership(true)).with_address("10.0.0.2");
        assert!(node.is_leader());
        assert_eq!(node.ordinal().unwrap(), 1);
        assert_eq!(node.address.as_deref(), Some("10.0.0.2"));
        assert_eq!(NodeRole::Follower.to_string(), "follower");
    }
}
