//! Triggers, administrative actions and the deferring dispatcher

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use broker_core::types::RelationId;

use crate::engine::Reconciler;
use crate::error::{ClusterError, ClusterResult};
use crate::metrics;

/// Externally observed change delivered to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "relation_id", rename_all = "kebab-case")]
pub enum EventKind {
    Install,
    Start,
    LeaderElected,
    ConfigChanged,
    PeerChanged,
    DependencyJoined,
    DependencyChanged,
    DependencyBroken,
    StorageAttached,
    StorageDetaching,
    ClientChanged(RelationId),
    ClientBroken(RelationId),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Install => "install",
            EventKind::Start => "start",
            EventKind::LeaderElected => "leader-elected",
            EventKind::ConfigChanged => "config-changed",
            EventKind::PeerChanged => "peer-changed",
            EventKind::DependencyJoined => "dependency-joined",
            EventKind::DependencyChanged => "dependency-changed",
            EventKind::DependencyBroken => "dependency-broken",
            EventKind::StorageAttached => "storage-attached",
            EventKind::StorageDetaching => "storage-detaching",
            EventKind::ClientChanged(_) => "client-changed",
            EventKind::ClientBroken(_) => "client-broken",
        }
    }

    /// Build an event from its name; client events need a relation id
    pub fn parse(name: &str, relation_id: Option<RelationId>) -> ClusterResult<Self> {
        let needs_relation = |make: fn(RelationId) -> EventKind| {
            relation_id
                .map(make)
                .ok_or_else(|| ClusterError::MissingRelationId(name.to_string()))
        };

        match name {
            "install" => Ok(EventKind::Install),
            "start" => Ok(EventKind::Start),
            "leader-elected" => Ok(EventKind::LeaderElected),
            "config-changed" => Ok(EventKind::ConfigChanged),
            "peer-changed" => Ok(EventKind::PeerChanged),
            "dependency-joined" => Ok(EventKind::DependencyJoined),
            "dependency-changed" => Ok(EventKind::DependencyChanged),
            "dependency-broken" => Ok(EventKind::DependencyBroken),
            "storage-attached" => Ok(EventKind::StorageAttached),
            "storage-detaching" => Ok(EventKind::StorageDetaching),
            "client-changed" => needs_relation(EventKind::ClientChanged),
            "client-broken" => needs_relation(EventKind::ClientBroken),
            other => Err(ClusterError::UnknownEvent(other.to_string())),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::ClientChanged(id) | EventKind::ClientBroken(id) => {
                write!(f, "{}({})", self.name(), id)
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Operator-initiated operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminAction {
    /// Rotate an internal password; a random one is generated when omitted
    SetPassword {
        username: String,
        password: Option<String>,
    },
    GetAdminCredentials,
    RollingRestartUnit,
}

impl AdminAction {
    pub fn name(&self) -> &'static str {
        match self {
            AdminAction::SetPassword { .. } => "set-password",
            AdminAction::GetAdminCredentials => "get-admin-credentials",
            AdminAction::RollingRestartUnit => "rolling-restart-unit",
        }
    }
}

/// Results of an administrative action
pub type ActionOutput = BTreeMap<String, String>;

/// What became of a delivered trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// Not actionable yet; redeliver later
    Deferred(String),
}

impl Disposition {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Disposition::Deferred(_))
    }
}

/// A trigger waiting for redelivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredEvent {
    pub event: EventKind,
    /// Times the event has been deferred so far
    pub attempts: u32,
}

/// Feeds triggers to one node's [`Reconciler`], one at a time.
///
/// Deferred triggers are kept in arrival order and redelivered before every
/// newly delivered trigger or action. A redelivery that errors stays queued.
pub struct Dispatcher {
    reconciler: Reconciler,
    deferred: VecDeque<DeferredEvent>,
    warn_threshold: u32,
}

impl Dispatcher {
    pub fn new(reconciler: Reconciler, warn_threshold: u32) -> Self {
        Self {
            reconciler,
            deferred: VecDeque::new(),
            warn_threshold,
        }
    }

    /// Resume with triggers deferred by an earlier run
    pub fn with_deferred(mut self, deferred: Vec<DeferredEvent>) -> Self {
        self.deferred = deferred.into();
        self
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn deferred(&self) -> Vec<DeferredEvent> {
        self.deferred.iter().cloned().collect()
    }

    fn defer(&mut self, event: EventKind, attempts: u32, reason: &str) {
        metrics::record_deferral(event.name());
        if attempts >= self.warn_threshold {
            warn!("Event {} deferred {} times: {}", event, attempts, reason);
        } else {
            debug!("Deferred {}: {}", event, reason);
        }

        if let Some(existing) = self.deferred.iter_mut().find(|d| d.event == event) {
            existing.attempts = existing.attempts.max(attempts);
            return;
        }
        self.deferred.push_back(DeferredEvent { event, attempts });
    }

    async fn redeliver(&mut self) {
        let pending = std::mem::take(&mut self.deferred);
        for DeferredEvent { event, attempts } in pending {
            match self.reconciler.handle(&event).await {
                Ok(Disposition::Handled) => info!("Deferred {} handled", event),
                Ok(Disposition::Deferred(reason)) => self.defer(event, attempts + 1, &reason),
                Err(e) => {
                    error!("Deferred {} failed: {}", event, e);
                    self.defer(event, attempts + 1, &e.to_string());
                }
            }
        }
    }

    /// Redeliver deferred triggers, then handle `event`
    pub async fn deliver(&mut self, event: EventKind) -> ClusterResult<Disposition> {
        self.redeliver().await;

        let disposition = self.reconciler.handle(&event).await?;
        if let Disposition::Deferred(reason) = &disposition {
            self.defer(event, 1, reason);
        }
        Ok(disposition)
    }

    /// Redeliver deferred triggers, then run an administrative action
    pub async fn run_action(&mut self, action: &AdminAction) -> ClusterResult<ActionOutput> {
        self.redeliver().await;
        self.reconciler.run_action(action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_names() {
        assert_eq!(EventKind::parse("start", None).unwrap(), EventKind::Start);
        assert_eq!(
            EventKind::parse("client-changed", Some(4)).unwrap(),
            EventKind::ClientChanged(4)
        );
        assert!(matches!(
            EventKind::parse("client-broken", None),
            Err(ClusterError::MissingRelationId(_))
        ));
        assert!(matches!(
            EventKind::parse("update-status", None),
            Err(ClusterError::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_names_round_trip_through_parse() {
        let events = [
            EventKind::Install,
            EventKind::Start,
            EventKind::LeaderElected,
            EventKind::ConfigChanged,
            EventKind::PeerChanged,
            EventKind::DependencyJoined,
            EventKind::DependencyChanged,
            EventKind::DependencyBroken,
            EventKind::StorageAttached,
            EventKind::StorageDetaching,
            EventKind::ClientChanged(1),
            EventKind::ClientBroken(1),
        ];
        for event in events {
            assert_eq!(EventKind::parse(event.name(), Some(1)).unwrap(), event);
        }
    }

    #[test]
    fn test_deferred_event_serialization() {
        let deferred = vec![
            DeferredEvent {
                event: EventKind::Start,
                attempts: 2,
            },
            DeferredEvent {
                event: EventKind::ClientChanged(3),
                attempts: 1,
            },
        ];
        let json = serde_json::to_string(&deferred).unwrap();
        assert!(json.contains("\"event\":\"client-changed\""));
        let parsed: Vec<DeferredEvent> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, deferred);
    }
}
