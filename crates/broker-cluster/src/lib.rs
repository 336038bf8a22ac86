//! Broker Cluster - reconciliation and coordination for one broker node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │        trigger / action  ──►  deferred queue (FIFO)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        Reconciler                           │
//! │                                                             │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐   │
//! │  │  Dependency   │  │  Properties   │  │    Client     │   │
//! │  │    reader     │  │   builder     │  │  provisioner  │   │
//! │  └───────────────┘  └───────────────┘  └───────────────┘   │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐   │
//! │  │  Credential   │  │   Restart     │  │   Workload    │   │
//! │  │  authority    │  │ coordinator   │  │  (snap/mem)   │   │
//! │  └───────────────┘  └───────────────┘  └───────────────┘   │
//! │                                                             │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │
//!                     ┌──────────┴──────────┐
//!                     │  Shared state store │
//!                     └─────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `UNINITIALIZED → WAITING_DEPENDENCY → WAITING_PEER_GROUP →
//! WAITING_CREDENTIALS → READY → ACTIVE`, with `BLOCKED` reachable from any
//! phase. Triggers that cannot be acted on yet are deferred and redelivered
//! before the next trigger.

mod dependency;
mod engine;
mod error;
mod events;
mod files;
pub mod metrics;
mod properties;
mod provider;
mod restart;
mod workload;

pub use dependency::DependencyConfig;
pub use engine::{NodePhase, Reconciler, StatusReport};
pub use error::{ClusterError, ClusterResult};
pub use events::{ActionOutput, AdminAction, DeferredEvent, Disposition, Dispatcher, EventKind};
pub use files::ConfigFiles;
pub use properties::{extra_args, BrokerInputs, PropertiesBuilder};
pub use provider::ClientProvisioner;
pub use restart::{LockAttempt, QueueEntry, RestartAction, RestartCoordinator, RestartLockState};
pub use workload::{MemoryWorkload, SnapWorkload, Workload};
