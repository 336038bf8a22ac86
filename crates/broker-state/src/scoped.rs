//! Typed, write-checked access to each scope
//!
//! A [`StateView`] is one node's window onto the host: it knows who the node
//! is and whether it currently leads, and hands out accessors that refuse
//! writes the node is not entitled to make.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::warn;

use broker_core::keys;
use broker_core::types::{ClientGrant, NodeId, RelationId, TlsState, UnitStatus};
use broker_core::INTERNAL_USERS;

use crate::error::{StateError, StateResult};
use crate::traits::{LeadershipOracle, Scope, StateStore, Topology};

/// One node's view of the host environment
#[derive(Clone)]
pub struct StateView {
    node: NodeId,
    store: Arc<dyn StateStore>,
    topology: Arc<dyn Topology>,
    leadership: Arc<dyn LeadershipOracle>,
}

impl StateView {
    pub fn new(
        node: impl Into<NodeId>,
        store: Arc<dyn StateStore>,
        topology: Arc<dyn Topology>,
        leadership: Arc<dyn LeadershipOracle>,
    ) -> Self {
        Self {
            node: node.into(),
            store,
            topology,
            leadership,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    pub fn cluster(&self) -> ClusterState {
        ClusterState {
            node: self.node.clone(),
            store: Arc::clone(&self.store),
            leadership: Arc::clone(&self.leadership),
        }
    }

    /// This node's own record
    pub fn unit(&self) -> UnitState {
        self.unit_of(&self.node)
    }

    /// Another node's record; writes through it are rejected
    pub fn unit_of(&self, owner: &str) -> UnitState {
        UnitState {
            owner: owner.to_string(),
            writer: self.node.clone(),
            store: Arc::clone(&self.store),
        }
    }

    pub fn relation(&self, id: RelationId) -> RelationState {
        RelationState {
            id,
            node: self.node.clone(),
            store: Arc::clone(&self.store),
            leadership: Arc::clone(&self.leadership),
        }
    }

    /// Peer group members, `None` while the peer group is absent
    pub fn peers(&self) -> Option<Vec<NodeId>> {
        self.topology.peer_group()
    }

    /// Addresses published by every peer that has one, in peer order
    pub fn peer_addresses(&self) -> Vec<(NodeId, String)> {
        self.peers()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|peer| {
                let address = self.unit_of(&peer).address()?;
                Some((peer, address))
            })
            .collect()
    }
}

/// Cluster-wide record, writable by the leader only
pub struct ClusterState {
    node: NodeId,
    store: Arc<dyn StateStore>,
    leadership: Arc<dyn LeadershipOracle>,
}

impl ClusterState {
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(&Scope::Cluster, key)
    }

    pub fn set(&self, key: &str, value: &str) -> StateResult<()> {
        self.check_leader()?;
        self.store.set(&Scope::Cluster, key, Some(value));
        Ok(())
    }

    pub fn remove(&self, key: &str) -> StateResult<()> {
        self.check_leader()?;
        self.store.set(&Scope::Cluster, key, None);
        Ok(())
    }

    fn check_leader(&self) -> StateResult<()> {
        if self.leadership.is_leader() {
            Ok(())
        } else {
            Err(StateError::NotLeader(self.node.clone()))
        }
    }

    pub fn internal_password(&self, username: &str) -> Option<String> {
        self.get(&keys::password_key(username))
    }

    pub fn set_internal_password(&self, username: &str, password: &str) -> StateResult<()> {
        self.set(&keys::password_key(username), password)
    }

    /// Stored passwords of the internal principals, keyed by username
    pub fn internal_credentials(&self) -> BTreeMap<String, String> {
        INTERNAL_USERS
            .iter()
            .filter_map(|user| Some((user.to_string(), self.internal_password(user)?)))
            .collect()
    }

    pub fn credentials_ready(&self) -> bool {
        self.get(keys::CREDENTIALS_READY).is_some()
    }

    pub fn mark_credentials_ready(&self) -> StateResult<()> {
        self.set(keys::CREDENTIALS_READY, "added")
    }

    pub fn tls(&self) -> TlsState {
        TlsState::parse(self.get(keys::TLS).as_deref())
    }

    pub fn superusers(&self) -> Option<String> {
        self.get(keys::SUPERUSERS)
    }

    pub fn set_superusers(&self, value: &str) -> StateResult<()> {
        self.set(keys::SUPERUSERS, value)
    }

    /// Grant for a relation; a malformed record is logged and ignored
    pub fn grant(&self, relation_id: RelationId) -> Option<ClientGrant> {
        let raw = self.get(&keys::relation_key(relation_id))?;
        match ClientGrant::from_record(&raw) {
            Ok(grant) => Some(grant),
            Err(e) => {
                warn!("Ignoring malformed grant for relation {}: {}", relation_id, e);
                None
            }
        }
    }

    /// Every readable grant in the cluster record, ordered by relation id
    pub fn grants(&self) -> Vec<ClientGrant> {
        let mut ids: Vec<RelationId> = self
            .store
            .record(&Scope::Cluster)
            .keys()
            .filter_map(|k| k.strip_prefix("relation-")?.parse().ok())
            .collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.grant(id)).collect()
    }

    pub fn put_grant(&self, grant: &ClientGrant) -> StateResult<()> {
        let record = grant.to_record()?;
        self.set(&keys::relation_key(grant.relation_id), &record)
    }

    pub fn remove_grant(&self, relation_id: RelationId) -> StateResult<()> {
        self.remove(&keys::relation_key(relation_id))
    }
}

/// A node's own record, writable only by that node
pub struct UnitState {
    owner: NodeId,
    writer: NodeId,
    store: Arc<dyn StateStore>,
}

impl UnitState {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(&Scope::Unit(self.owner.clone()), key)
    }

    pub fn set(&self, key: &str, value: Option<&str>) -> StateResult<()> {
        if self.owner != self.writer {
            return Err(StateError::ForeignScope {
                owner: self.owner.clone(),
                writer: self.writer.clone(),
            });
        }
        self.store.set(&Scope::Unit(self.owner.clone()), key, value);
        Ok(())
    }

    pub fn address(&self) -> Option<String> {
        self.get(keys::ADDRESS)
    }

    pub fn set_address(&self, address: &str) -> StateResult<()> {
        self.set(keys::ADDRESS, Some(address))
    }

    /// Last reported status; nodes that never reported are installing
    pub fn status(&self) -> UnitStatus {
        self.get(keys::STATUS)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn set_status(&self, status: &UnitStatus) -> StateResult<()> {
        let raw = serde_json::to_string(status)?;
        self.set(keys::STATUS, Some(&raw))
    }
}

/// Both sides of one external relationship
pub struct RelationState {
    id: RelationId,
    node: NodeId,
    store: Arc<dyn StateStore>,
    leadership: Arc<dyn LeadershipOracle>,
}

impl RelationState {
    pub fn id(&self) -> RelationId {
        self.id
    }

    /// What the other application published
    pub fn remote(&self) -> HashMap<String, String> {
        self.store.record(&Scope::remote(self.id))
    }

    /// What we published
    pub fn local(&self) -> HashMap<String, String> {
        self.store.record(&Scope::local(self.id))
    }

    pub fn local_get(&self, key: &str) -> Option<String> {
        self.store.get(&Scope::local(self.id), key)
    }

    /// Merge entries into our side; leader only
    pub fn publish(&self, entries: &[(&str, String)]) -> StateResult<()> {
        self.check_leader()?;
        for (key, value) in entries {
            self.store.set(&Scope::local(self.id), key, Some(value));
        }
        Ok(())
    }

    /// Drop everything we published; leader only
    pub fn clear_local(&self) -> StateResult<()> {
        self.check_leader()?;
        self.store.clear(&Scope::local(self.id));
        Ok(())
    }

    /// The remote side can never be written by this node
    pub fn set_remote(&self, _key: &str, _value: &str) -> StateResult<()> {
        Err(StateError::ReadOnly(Scope::remote(self.id).to_string()))
    }

    fn check_leader(&self) -> StateResult<()> {
        if self.leadership.is_leader() {
            Ok(())
        } else {
            Err(StateError::NotLeader(self.node.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryHost, RelationKind};
    use broker_core::types::ClientRole;

    fn view(host: &Arc<MemoryHost>, node: &str) -> StateView {
        StateView::new(
            node,
            Arc::clone(host) as Arc<dyn StateStore>,
            Arc::clone(host) as Arc<dyn Topology>,
            host.leadership_for(node),
        )
    }

    #[test]
    fn test_cluster_writes_require_leadership() {
        let host = Arc::new(MemoryHost::new());
        host.set_leader(Some("kafka/0"));

        let leader = view(&host, "kafka/0");
        let follower = view(&host, "kafka/1");

        leader.cluster().set_internal_password("sync", "mellon").unwrap();
        assert!(matches!(
            follower.cluster().set_internal_password("sync", "other"),
            Err(StateError::NotLeader(_))
        ));
        assert_eq!(
            follower.cluster().internal_password("sync").as_deref(),
            Some("mellon")
        );
    }

    #[test]
    fn test_unit_writes_only_by_owner() {
        let host = Arc::new(MemoryHost::new());
        let a = view(&host, "kafka/0");

        a.unit().set_address("10.0.0.1").unwrap();
        assert!(matches!(
            a.unit_of("kafka/1").set_address("10.0.0.2"),
            Err(StateError::ForeignScope { .. })
        ));
        assert_eq!(a.unit_of("kafka/0").address().as_deref(), Some("10.0.0.1"));

        assert_eq!(a.unit().status(), UnitStatus::Installing);
        a.unit().set_status(&UnitStatus::blocked("missing required zookeeper relation")).unwrap();
        assert_eq!(
            a.unit_of("kafka/0").status().message(),
            Some("missing required zookeeper relation")
        );
    }

    #[test]
    fn test_peer_addresses_skip_unpublished() {
        let host = Arc::new(MemoryHost::new());
        host.add_peer("kafka/0");
        host.add_peer("kafka/1");
        view(&host, "kafka/1").unit().set_address("shelob").unwrap();

        let addresses = view(&host, "kafka/0").peer_addresses();
        assert_eq!(addresses, vec![("kafka/1".to_string(), "shelob".to_string())]);
    }

    #[test]
    fn test_internal_credentials_and_marker() {
        let host = Arc::new(MemoryHost::new());
        host.set_leader(Some("kafka/0"));
        let cluster = view(&host, "kafka/0").cluster();

        assert!(cluster.internal_credentials().is_empty());
        assert!(!cluster.credentials_ready());

        cluster.set_internal_password("sync", "a").unwrap();
        cluster.set_internal_password("admin", "b").unwrap();
        cluster.mark_credentials_ready().unwrap();

        let creds = cluster.internal_credentials();
        assert_eq!(creds.get("sync").map(String::as_str), Some("a"));
        assert_eq!(creds.get("admin").map(String::as_str), Some("b"));
        assert!(cluster.credentials_ready());
        assert_eq!(cluster.tls(), TlsState::Disabled);
    }

    #[test]
    fn test_grants_listing_skips_malformed() {
        let host = Arc::new(MemoryHost::new());
        host.set_leader(Some("kafka/0"));
        let cluster = view(&host, "kafka/0").cluster();

        let grant = ClientGrant {
            relation_id: 2,
            username: "relation-2".into(),
            password: "pw".into(),
            roles: vec![ClientRole::Consumer],
            topic: "t".into(),
            acls: vec![],
            consumer_group_prefix: "relation-2-".into(),
            created_at: chrono::Utc::now(),
        };
        cluster.put_grant(&grant).unwrap();
        cluster.set("relation-1", "mellon").unwrap();

        let grants = cluster.grants();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].relation_id, 2);

        cluster.remove_grant(2).unwrap();
        assert!(cluster.grant(2).is_none());
    }

    #[test]
    fn test_relation_sides() {
        let host = Arc::new(MemoryHost::new());
        host.set_leader(Some("kafka/0"));
        let id = host.add_relation(RelationKind::Client, "app");
        host.update_remote(id, &[("topic", "orders")]);

        let leader = view(&host, "kafka/0").relation(id);
        let follower = view(&host, "kafka/1").relation(id);

        assert_eq!(leader.remote().get("topic").map(String::as_str), Some("orders"));
        leader.publish(&[("username", "relation-1".to_string())]).unwrap();
        assert!(follower.publish(&[("username", "x".to_string())]).is_err());
        assert!(leader.set_remote("topic", "other").is_err());
        assert_eq!(follower.local_get("username").as_deref(), Some("relation-1"));

        leader.clear_local().unwrap();
        assert!(leader.local().is_empty());
    }
}
