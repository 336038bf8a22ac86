//! Broker State - the scoped, eventually-consistent shared store
//!
//! # Scopes
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Cluster scope        written by the current leader only  │
//! ├──────────────────────────────────────────────────────────┤
//! │ Unit scope (x N)     written by the owning node only     │
//! ├──────────────────────────────────────────────────────────┤
//! │ Relation scope       local side: leader, remote: nobody  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The raw [`StateStore`] has no access control. Every write made by the
//! operator goes through the typed accessors in [`scoped`], which reject
//! writes the caller is not entitled to make.

mod error;
mod memory;
pub mod scoped;
mod traits;

pub use error::{StateError, StateResult};
pub use memory::{HostLeadership, HostSnapshot, MemoryHost, RelationKind, RelationRecord};
pub use scoped::{ClusterState, RelationState, StateView, UnitState};
pub use traits::{LeadershipOracle, RelationSide, Scope, StateStore, StaticLeadership, Topology};
