//! Host-provided capabilities
//!
//! The shared store, the node-group topology and leadership all come from the
//! host environment. These traits are the seams; [`crate::MemoryHost`] is the
//! in-process implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use broker_core::types::{NodeId, RelationId};

/// Which side of a relation a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationSide {
    /// Our application's side, published to the other application
    Local,
    /// The other application's side, read-only for us
    Remote,
}

/// Partition of the shared store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Per-node record
    Unit(NodeId),
    /// Cluster-wide record of the node-group
    Cluster,
    /// One side of an external relationship
    Relation { id: RelationId, side: RelationSide },
}

impl Scope {
    pub fn local(id: RelationId) -> Self {
        Scope::Relation {
            id,
            side: RelationSide::Local,
        }
    }

    pub fn remote(id: RelationId) -> Self {
        Scope::Relation {
            id,
            side: RelationSide::Remote,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Unit(id) => write!(f, "unit:{}", id),
            Scope::Cluster => write!(f, "cluster"),
            Scope::Relation { id, side } => match side {
                RelationSide::Local => write!(f, "relation-{}:local", id),
                RelationSide::Remote => write!(f, "relation-{}:remote", id),
            },
        }
    }
}

/// Raw key/value access to the replicated store.
///
/// No write access control and no transactions; last write wins.
pub trait StateStore: Send + Sync {
    fn get(&self, scope: &Scope, key: &str) -> Option<String>;

    /// Setting `None` or an empty value removes the key
    fn set(&self, scope: &Scope, key: &str, value: Option<&str>);

    /// Snapshot of every key in a scope
    fn record(&self, scope: &Scope) -> HashMap<String, String>;

    /// Remove every key in a scope
    fn clear(&self, scope: &Scope);
}

/// Node-group and relation layout as the host currently sees it
pub trait Topology: Send + Sync {
    /// Members of the node-group, `None` while the peer group does not exist
    fn peer_group(&self) -> Option<Vec<NodeId>>;

    /// Id of the dependency relation, if established
    fn dependency_relation(&self) -> Option<RelationId>;

    /// Ids of every established client relation
    fn client_relations(&self) -> Vec<RelationId>;

    /// Log-data volumes currently attached to a node
    fn attached_volumes(&self, node: &str) -> usize;
}

/// Leadership as decided by the host
pub trait LeadershipOracle: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Leadership fixed by the caller, flipped explicitly
#[derive(Debug, Default)]
pub struct StaticLeadership(AtomicBool);

impl StaticLeadership {
    pub fn new(is_leader: bool) -> Self {
        Self(AtomicBool::new(is_leader))
    }

    pub fn set(&self, is_leader: bool) {
        self.0.store(is_leader, Ordering::SeqCst);
    }
}

impl LeadershipOracle for StaticLeadership {
    fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
