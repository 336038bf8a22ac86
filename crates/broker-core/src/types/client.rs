//! External client relationships and their access grants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Host-assigned id of a relation
pub type RelationId = u32;

/// Role a client may request through `extra-user-roles`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Producer,
    Consumer,
    Admin,
}

impl FromStr for ClientRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "producer" => Ok(ClientRole::Producer),
            "consumer" => Ok(ClientRole::Consumer),
            "admin" => Ok(ClientRole::Admin),
            other => Err(Error::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRole::Producer => write!(f, "producer"),
            ClientRole::Consumer => write!(f, "consumer"),
            ClientRole::Admin => write!(f, "admin"),
        }
    }
}

/// Parameters a client publishes on its side of the relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub topic: String,
    #[serde(rename = "extra-user-roles")]
    pub roles: Vec<ClientRole>,
}

impl ClientRequest {
    /// Parse the remote record; `None` until a topic has been requested.
    ///
    /// Unknown roles are dropped with a warning rather than failing the whole request.
    pub fn from_record(record: &HashMap<String, String>) -> Option<Self> {
        let topic = record.get("topic").filter(|t| !t.is_empty())?.clone();

        let mut roles: Vec<ClientRole> = record
            .get("extra-user-roles")
            .map(|raw| {
                raw.split(',')
                    .filter(|r| !r.trim().is_empty())
                    .filter_map(|r| match r.parse() {
                        Ok(role) => Some(role),
                        Err(e) => {
                            tracing::warn!("Ignoring client role: {}", e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        roles.sort();
        roles.dedup();

        Some(Self { topic, roles })
    }

    pub fn has_role(&self, role: ClientRole) -> bool {
        self.roles.contains(&role)
    }
}

/// Resource kinds an ACL entry can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceType {
    Topic,
    Group,
    Cluster,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Topic => write!(f, "TOPIC"),
            ResourceType::Group => write!(f, "GROUP"),
            ResourceType::Cluster => write!(f, "CLUSTER"),
        }
    }
}

/// How an ACL entry's resource name is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PatternType {
    Literal,
    Prefixed,
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternType::Literal => write!(f, "LITERAL"),
            PatternType::Prefixed => write!(f, "PREFIXED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AclOperation {
    Read,
    Write,
    Create,
    Describe,
    All,
}

impl fmt::Display for AclOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclOperation::Read => write!(f, "READ"),
            AclOperation::Write => write!(f, "WRITE"),
            AclOperation::Create => write!(f, "CREATE"),
            AclOperation::Describe => write!(f, "DESCRIBE"),
            AclOperation::All => write!(f, "ALL"),
        }
    }
}

/// One allow rule for a principal
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AclEntry {
    pub username: String,
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub pattern: PatternType,
    pub operation: AclOperation,
}

/// Provisioned access for one external client relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGrant {
    pub relation_id: RelationId,
    pub username: String,
    pub password: String,
    pub roles: Vec<ClientRole>,
    pub topic: String,
    pub acls: Vec<AclEntry>,
    pub consumer_group_prefix: String,
    pub created_at: DateTime<Utc>,
}

impl ClientGrant {
    /// Username derived from the relation id
    pub fn username_for(relation_id: RelationId) -> String {
        format!("relation-{}", relation_id)
    }

    /// Consumer groups the client may use start with this prefix
    pub fn group_prefix_for(username: &str) -> String {
        format!("{}-", username)
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&ClientRole::Admin)
    }

    /// Whether a new request asks for anything different than this grant
    pub fn matches(&self, request: &ClientRequest) -> bool {
        self.topic == request.topic && self.roles == request.roles
    }

    pub fn to_record(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_record(record: &str) -> Result<Self> {
        Ok(serde_json::from_str(record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_client_request_parsing() {
        let req = ClientRequest::from_record(&record(&[
            ("topic", "orders"),
            ("extra-user-roles", "consumer,producer,consumer"),
        ]))
        .unwrap();

        assert_eq!(req.topic, "orders");
        assert_eq!(req.roles, vec![ClientRole::Producer, ClientRole::Consumer]);
        assert!(!req.has_role(ClientRole::Admin));
    }

    #[test]
    fn test_client_request_requires_topic() {
        assert!(ClientRequest::from_record(&record(&[("extra-user-roles", "admin")])).is_none());
        assert!(ClientRequest::from_record(&record(&[("topic", "")])).is_none());
    }

    #[test]
    fn test_unknown_roles_are_dropped() {
        let req = ClientRequest::from_record(&record(&[
            ("topic", "t"),
            ("extra-user-roles", "admin, wizard"),
        ]))
        .unwrap();
        assert_eq!(req.roles, vec![ClientRole::Admin]);
    }

    #[test]
    fn test_grant_record() {
        let grant = ClientGrant {
            relation_id: 4,
            username: ClientGrant::username_for(4),
            password: "pw".to_string(),
            roles: vec![ClientRole::Admin],
            topic: "t".to_string(),
            acls: vec![],
            consumer_group_prefix: ClientGrant::group_prefix_for("relation-4"),
            created_at: Utc::now(),
        };

        assert_eq!(grant.username, "relation-4");
        assert_eq!(grant.consumer_group_prefix, "relation-4-");
        assert!(grant.is_admin());

        let parsed = ClientGrant::from_record(&grant.to_record().unwrap()).unwrap();
        assert_eq!(parsed, grant);
        assert!(ClientGrant::from_record("mellon").is_err());
    }
}
