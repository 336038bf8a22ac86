//! Role to ACL mapping and the superuser list

use std::collections::BTreeSet;

use broker_core::types::{AclEntry, AclOperation, ClientGrant, ClientRole, PatternType, ResourceType};

fn entry(
    username: &str,
    resource_type: ResourceType,
    resource_name: &str,
    pattern: PatternType,
    operation: AclOperation,
) -> AclEntry {
    AclEntry {
        username: username.to_string(),
        resource_type,
        resource_name: resource_name.to_string(),
        pattern,
        operation,
    }
}

/// ACL entries granting `roles` on `topic` to a client principal.
///
/// Entries are sorted and free of duplicates, so two grants for the same
/// request compare equal.
pub fn acls_for(username: &str, topic: &str, roles: &[ClientRole], group_prefix: &str) -> Vec<AclEntry> {
    let mut acls = BTreeSet::new();

    for role in roles {
        match role {
            ClientRole::Producer => {
                for op in [AclOperation::Create, AclOperation::Write, AclOperation::Describe] {
                    acls.insert(entry(username, ResourceType::Topic, topic, PatternType::Literal, op));
                }
            }
            ClientRole::Consumer => {
                for op in [AclOperation::Read, AclOperation::Describe] {
                    acls.insert(entry(username, ResourceType::Topic, topic, PatternType::Literal, op));
                }
                acls.insert(entry(
                    username,
                    ResourceType::Group,
                    group_prefix,
                    PatternType::Prefixed,
                    AclOperation::Read,
                ));
            }
            ClientRole::Admin => {
                acls.insert(entry(
                    username,
                    ResourceType::Topic,
                    topic,
                    PatternType::Literal,
                    AclOperation::All,
                ));
            }
        }
    }

    acls.into_iter().collect()
}

/// Static administrators plus every client holding the admin role, in order
/// of first appearance
pub fn superusers(static_users: &[String], grants: &[ClientGrant]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    static_users
        .iter()
        .cloned()
        .chain(grants.iter().filter(|g| g.is_admin()).map(|g| g.username.clone()))
        .filter(|user| seen.insert(user.clone()))
        .collect()
}

/// Render principals the way `super.users` expects them
pub fn format_superusers(users: &[String]) -> String {
    users
        .iter()
        .map(|u| format!("User:{}", u))
        .collect::<Vec<_>>()
        .join(";")
}
