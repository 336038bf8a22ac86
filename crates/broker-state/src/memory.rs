//! In-memory host environment
//!
//! Holds the shared store, topology and leadership in one snapshot so that
//! several nodes in one process (tests) or consecutive CLI invocations (via
//! the JSON snapshot file) observe the same world.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use broker_core::types::{NodeId, RelationId};

use crate::error::StateResult;
use crate::traits::{LeadershipOracle, RelationSide, Scope, StateStore, Topology};

type Record = BTreeMap<String, String>;

/// Kind of external relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// The coordination service the brokers depend on
    Dependency,
    /// An application consuming broker access
    Client,
}

/// Both sides of one relation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationRecord {
    pub kind: RelationKind,
    pub remote_app: String,
    #[serde(default)]
    pub local: Record,
    #[serde(default)]
    pub remote: Record,
}

/// Serializable state of the whole host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Node currently holding leadership
    #[serde(default)]
    pub leader: Option<NodeId>,
    /// Node-group members, `None` while the peer group is absent
    #[serde(default)]
    pub peers: Option<Vec<NodeId>>,
    /// Attached log-data volumes per node
    #[serde(default)]
    pub volumes: BTreeMap<NodeId, usize>,
    #[serde(default)]
    pub cluster: Record,
    #[serde(default)]
    pub units: BTreeMap<NodeId, Record>,
    #[serde(default)]
    pub relations: BTreeMap<RelationId, RelationRecord>,
}

/// Shared store, topology and leadership kept in process memory
#[derive(Debug, Default)]
pub struct MemoryHost {
    inner: RwLock<HostSnapshot>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: HostSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> HostSnapshot {
        self.inner.read().clone()
    }

    /// Load a snapshot file; a missing file yields an empty host
    pub fn load(path: &Path) -> StateResult<Self> {
        if !path.exists() {
            debug!("No host snapshot at {:?}, starting empty", path);
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_snapshot(serde_json::from_str(&content)?))
    }

    pub fn save(&self, path: &Path) -> StateResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&*self.inner.read())?;
        std::fs::write(path, content)?;
        debug!("Saved host snapshot to {:?}", path);
        Ok(())
    }

    /// Leadership oracle answering for one node
    pub fn leadership_for(self: &Arc<Self>, node: impl Into<NodeId>) -> Arc<dyn LeadershipOracle> {
        Arc::new(HostLeadership {
            host: Arc::clone(self),
            node: node.into(),
        })
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.inner.read().leader.clone()
    }

    pub fn set_leader(&self, node: Option<&str>) {
        self.inner.write().leader = node.map(String::from);
    }

    /// Create the peer group if needed and add a member
    pub fn add_peer(&self, node: &str) {
        let mut inner = self.inner.write();
        let peers = inner.peers.get_or_insert_with(Vec::new);
        if !peers.iter().any(|p| p == node) {
            peers.push(node.to_string());
        }
    }

    pub fn remove_peer(&self, node: &str) {
        let mut inner = self.inner.write();
        if let Some(peers) = inner.peers.as_mut() {
            peers.retain(|p| p != node);
        }
        inner.units.remove(node);
    }

    pub fn set_volumes(&self, node: &str, count: usize) {
        self.inner.write().volumes.insert(node.to_string(), count);
    }

    /// Establish a relation and return its id
    pub fn add_relation(&self, kind: RelationKind, remote_app: &str) -> RelationId {
        let mut inner = self.inner.write();
        let id = inner.relations.keys().next_back().map_or(1, |last| last + 1);
        inner.relations.insert(
            id,
            RelationRecord {
                kind,
                remote_app: remote_app.to_string(),
                local: Record::new(),
                remote: Record::new(),
            },
        );
        id
    }

    pub fn remove_relation(&self, id: RelationId) {
        self.inner.write().relations.remove(&id);
    }

    /// Merge the other application's data into its side of a relation
    pub fn update_remote(&self, id: RelationId, pairs: &[(&str, &str)]) {
        for (key, value) in pairs {
            self.set(&Scope::remote(id), key, Some(value));
        }
    }

    fn relation_ids(&self, kind: RelationKind) -> Vec<RelationId> {
        self.inner
            .read()
            .relations
            .iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }
}

fn write_value(record: &mut Record, key: &str, value: Option<&str>) {
    match value {
        Some(v) if !v.is_empty() => {
            record.insert(key.to_string(), v.to_string());
        }
        _ => {
            record.remove(key);
        }
    }
}

impl StateStore for MemoryHost {
    fn get(&self, scope: &Scope, key: &str) -> Option<String> {
        let inner = self.inner.read();
        let record = match scope {
            Scope::Unit(id) => inner.units.get(id),
            Scope::Cluster => Some(&inner.cluster),
            Scope::Relation { id, side } => inner.relations.get(id).map(|r| match side {
                RelationSide::Local => &r.local,
                RelationSide::Remote => &r.remote,
            }),
        };
        record.and_then(|r| r.get(key).cloned())
    }

    fn set(&self, scope: &Scope, key: &str, value: Option<&str>) {
        let mut inner = self.inner.write();
        match scope {
            Scope::Unit(id) => write_value(inner.units.entry(id.clone()).or_default(), key, value),
            Scope::Cluster => write_value(&mut inner.cluster, key, value),
            Scope::Relation { id, side } => {
                // Writes to a relation that no longer exists are dropped
                if let Some(relation) = inner.relations.get_mut(id) {
                    match side {
                        RelationSide::Local => write_value(&mut relation.local, key, value),
                        RelationSide::Remote => write_value(&mut relation.remote, key, value),
                    }
                }
            }
        }
    }

    fn record(&self, scope: &Scope) -> HashMap<String, String> {
        let inner = self.inner.read();
        let record = match scope {
            Scope::Unit(id) => inner.units.get(id).cloned(),
            Scope::Cluster => Some(inner.cluster.clone()),
            Scope::Relation { id, side } => inner.relations.get(id).map(|r| match side {
                RelationSide::Local => r.local.clone(),
                RelationSide::Remote => r.remote.clone(),
            }),
        };
        record.unwrap_or_default().into_iter().collect()
    }

    fn clear(&self, scope: &Scope) {
        let mut inner = self.inner.write();
        match scope {
            Scope::Unit(id) => {
                inner.units.remove(id);
            }
            Scope::Cluster => inner.cluster.clear(),
            Scope::Relation { id, side } => {
                if let Some(relation) = inner.relations.get_mut(id) {
                    match side {
                        RelationSide::Local => relation.local.clear(),
                        RelationSide::Remote => relation.remote.clear(),
                    }
                }
            }
        }
    }
}

impl Topology for MemoryHost {
    fn peer_group(&self) -> Option<Vec<NodeId>> {
        self.inner.read().peers.clone()
    }

    fn dependency_relation(&self) -> Option<RelationId> {
        self.relation_ids(RelationKind::Dependency).into_iter().next()
    }

    fn client_relations(&self) -> Vec<RelationId> {
        self.relation_ids(RelationKind::Client)
    }

    fn attached_volumes(&self, node: &str) -> usize {
        self.inner.read().volumes.get(node).copied().unwrap_or(0)
    }
}

/// Leadership of one node as recorded by a [`MemoryHost`]
pub struct HostLeadership {
    host: Arc<MemoryHost>,
    node: NodeId,
}

impl LeadershipOracle for HostLeadership {
    fn is_leader(&self) -> bool {
        self.host.leader().as_deref() == Some(self.node.as_str())
    }
}
