//! Rolling restart coordination
//!
//! A distributed FIFO lock built only from node-scope records, so that at
//! most one broker restarts at a time without any coordinator process.
//!
//! Each node can only write its own record, so the queue is the union of
//! every node's ticket: a requester takes one more than the largest ticket it
//! can see, and the queue is ordered by `(ticket, node id)`. The node at the
//! head writes itself as holder, re-reads, and backs off if anyone else
//! claimed the lock in between. The holder always clears its ticket and
//! holder fields after running its action.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, warn};

use broker_core::keys;
use broker_core::types::NodeId;
use broker_state::StateView;

use crate::error::{ClusterError, ClusterResult};

/// What the lock holder does with the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestartAction {
    Restart,
    /// Disable then enable the service, needed after storage changes
    DisableEnable,
}

impl RestartAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartAction::Restart => "restart",
            RestartAction::DisableEnable => "disable-enable",
        }
    }
}

impl fmt::Display for RestartAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartAction {
    type Err = ClusterError;

    fn from_str(s: &str) -> ClusterResult<Self> {
        match s {
            "restart" => Ok(RestartAction::Restart),
            "disable-enable" => Ok(RestartAction::DisableEnable),
            other => Err(ClusterError::Workload(format!("Unknown restart action: {}", other))),
        }
    }
}

/// One queued restart request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub node: NodeId,
    pub ticket: u64,
    pub action: RestartAction,
}

/// The restart lock as visible from one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartLockState {
    /// Requests in grant order
    pub queue: Vec<QueueEntry>,
    /// Nodes currently claiming the lock; more than one only during a race
    pub holders: Vec<NodeId>,
}

impl RestartLockState {
    /// Collect every peer's record; the observing node is always included
    pub fn observe(view: &StateView) -> Self {
        let mut nodes = view.peers().unwrap_or_default();
        if !nodes.iter().any(|n| n == view.node_id()) {
            nodes.push(view.node_id().to_string());
        }

        let mut state = Self::default();
        for node in nodes {
            let record = view.unit_of(&node);
            if let Some(ticket) = record
                .get(keys::RESTART_LOCK_QUEUE)
                .and_then(|t| t.parse().ok())
            {
                let action = record
                    .get(keys::RESTART_LOCK_ACTION)
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(RestartAction::Restart);
                state.queue.push(QueueEntry {
                    node: node.clone(),
                    ticket,
                    action,
                });
            }
            if record.get(keys::RESTART_LOCK_HOLDER).as_deref() == Some(node.as_str()) {
                state.holders.push(node);
            }
        }
        state
            .queue
            .sort_by(|a, b| (a.ticket, &a.node).cmp(&(b.ticket, &b.node)));
        state
    }

    pub fn head(&self) -> Option<&QueueEntry> {
        self.queue.first()
    }

    pub fn entry(&self, node: &str) -> Option<&QueueEntry> {
        self.queue.iter().find(|e| e.node == node)
    }

    pub fn position(&self, node: &str) -> Option<usize> {
        self.queue.iter().position(|e| e.node == node)
    }

    pub fn holder(&self) -> Option<&NodeId> {
        self.holders.first()
    }

    fn next_ticket(&self) -> u64 {
        self.queue.iter().map(|e| e.ticket).max().unwrap_or(0) + 1
    }
}

/// Result of trying to take the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// This node holds the lock and must run the action, then release
    Granted(RestartAction),
    /// Queued behind someone else, or the lock is held elsewhere
    Waiting,
    /// Another node claimed the lock at the same time; try again later
    Yielded,
    /// This node has no pending request
    NotQueued,
}

/// Request, acquire and release operations on the restart lock
pub struct RestartCoordinator;

impl RestartCoordinator {
    /// Queue a restart for this node.
    ///
    /// A node already queued keeps its position; asking for
    /// [`RestartAction::DisableEnable`] upgrades the pending action.
    /// Returns whether a new request was queued.
    pub fn request(view: &StateView, action: RestartAction) -> ClusterResult<bool> {
        let state = RestartLockState::observe(view);
        let unit = view.unit();

        if let Some(entry) = state.entry(view.node_id()) {
            if action > entry.action {
                unit.set(keys::RESTART_LOCK_ACTION, Some(action.as_str()))?;
                debug!("Upgraded queued restart of {} to {}", view.node_id(), action);
            }
            return Ok(false);
        }

        let ticket = state.next_ticket();
        unit.set(keys::RESTART_LOCK_QUEUE, Some(&ticket.to_string()))?;
        unit.set(keys::RESTART_LOCK_ACTION, Some(action.as_str()))?;
        info!("Queued {} of {} with ticket {}", action, view.node_id(), ticket);
        Ok(true)
    }

    /// Try to take the lock for this node
    pub fn try_acquire(view: &StateView) -> ClusterResult<LockAttempt> {
        let me = view.node_id();
        let state = RestartLockState::observe(view);

        let Some(own) = state.entry(me).cloned() else {
            if state.holders.iter().any(|h| h == me) {
                view.unit().set(keys::RESTART_LOCK_HOLDER, None)?;
            }
            return Ok(LockAttempt::NotQueued);
        };

        let at_head = state.head().map(|h| h.node.as_str()) == Some(me);
        let holding = state.holders.iter().any(|h| h == me);
        let others_hold = state.holders.iter().any(|h| h != me);

        if holding {
            if !at_head {
                // A claim left over from a lost race; the head goes first
                view.unit().set(keys::RESTART_LOCK_HOLDER, None)?;
                return Ok(LockAttempt::Yielded);
            }
            if others_hold {
                return Ok(LockAttempt::Waiting);
            }
            // Already holding, e.g. after an interrupted pass
            return Ok(LockAttempt::Granted(own.action));
        }

        if !at_head || others_hold {
            return Ok(LockAttempt::Waiting);
        }

        view.unit().set(keys::RESTART_LOCK_HOLDER, Some(me))?;

        let after = RestartLockState::observe(view);
        let contested = after.holders.iter().any(|h| h != me)
            || after.head().map(|h| h.node.as_str()) != Some(me);
        if contested {
            warn!("Restart lock contested for {}, yielding", me);
            view.unit().set(keys::RESTART_LOCK_HOLDER, None)?;
            return Ok(LockAttempt::Yielded);
        }

        info!("Restart lock granted to {}", me);
        Ok(LockAttempt::Granted(own.action))
    }

    /// Leave the queue and drop the lock
    pub fn release(view: &StateView) -> ClusterResult<()> {
        let unit = view.unit();
        unit.set(keys::RESTART_LOCK_HOLDER, None)?;
        unit.set(keys::RESTART_LOCK_QUEUE, None)?;
        unit.set(keys::RESTART_LOCK_ACTION, None)?;
        debug!("Restart lock released by {}", view.node_id());
        Ok(())
    }

    /// Drop the lock and move this node's request to the tail of the queue
    pub fn requeue(view: &StateView) -> ClusterResult<()> {
        let state = RestartLockState::observe(view);
        let unit = view.unit();
        let ticket = state.next_ticket();
        unit.set(keys::RESTART_LOCK_HOLDER, None)?;
        unit.set(keys::RESTART_LOCK_QUEUE, Some(&ticket.to_string()))?;
        debug!("Requeued restart of {} with ticket {}", view.node_id(), ticket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_state::{MemoryHost, StateStore, Topology};
    use std::sync::Arc;

    fn view(host: &Arc<MemoryHost>, node: &str) -> StateView {
        StateView::new(
            node,
            Arc::clone(host) as Arc<dyn StateStore>,
            Arc::clone(host) as Arc<dyn Topology>,
            host.leadership_for(node),
        )
    }

    fn cluster(n: usize) -> (Arc<MemoryHost>, Vec<StateView>) {
        let host = Arc::new(MemoryHost::new());
        let views = (0..n)
            .map(|i| {
                let id = format!("kafka/{}", i);
                host.add_peer(&id);
                view(&host, &id)
            })
            .collect();
        (host, views)
    }

    #[test]
    fn test_fifo_order() {
        let (_, nodes) = cluster(3);

        assert!(RestartCoordinator::request(&nodes[2], RestartAction::Restart).unwrap());
        assert!(RestartCoordinator::request(&nodes[0], RestartAction::Restart).unwrap());
        assert!(RestartCoordinator::request(&nodes[1], RestartAction::Restart).unwrap());
        assert!(!RestartCoordinator::request(&nodes[2], RestartAction::Restart).unwrap());

        let state = RestartLockState::observe(&nodes[0]);
        let order: Vec<&str> = state.queue.iter().map(|e| e.node.as_str()).collect();
        assert_eq!(order, vec!["kafka/2", "kafka/0", "kafka/1"]);
    }

    #[test]
    fn test_mutual_exclusion_and_release() {
        let (_, nodes) = cluster(3);
        for node in &nodes {
            RestartCoordinator::request(node, RestartAction::Restart).unwrap();
        }

        assert_eq!(
            RestartCoordinator::try_acquire(&nodes[0]).unwrap(),
            LockAttempt::Granted(RestartAction::Restart)
        );
        assert_eq!(RestartCoordinator::try_acquire(&nodes[1]).unwrap(), LockAttempt::Waiting);
        assert_eq!(RestartCoordinator::try_acquire(&nodes[2]).unwrap(), LockAttempt::Waiting);

        let state = RestartLockState::observe(&nodes[2]);
        assert_eq!(state.holders, vec!["kafka/0".to_string()]);

        RestartCoordinator::release(&nodes[0]).unwrap();
        assert_eq!(
            RestartCoordinator::try_acquire(&nodes[1]).unwrap(),
            LockAttempt::Granted(RestartAction::Restart)
        );
        assert_eq!(RestartCoordinator::try_acquire(&nodes[0]).unwrap(), LockAttempt::NotQueued);
    }

    #[test]
    fn test_every_request_is_eventually_granted() {
        let (_, nodes) = cluster(4);
        for node in nodes.iter().rev() {
            RestartCoordinator::request(node, RestartAction::Restart).unwrap();
        }

        let mut granted = Vec::new();
        for _ in 0..nodes.len() {
            let mut holders = 0;
            for node in &nodes {
                if let LockAttempt::Granted(_) = RestartCoordinator::try_acquire(node).unwrap() {
                    holders += 1;
                    granted.push(node.node_id().to_string());
                    RestartCoordinator::release(node).unwrap();
                    break;
                }
            }
            assert_eq!(holders, 1);
        }

        assert_eq!(granted, vec!["kafka/3", "kafka/2", "kafka/1", "kafka/0"]);
        assert!(RestartLockState::observe(&nodes[0]).queue.is_empty());
    }

    #[test]
    fn test_upgrade_keeps_position() {
        let (_, nodes) = cluster(2);
        RestartCoordinator::request(&nodes[0], RestartAction::Restart).unwrap();
        RestartCoordinator::request(&nodes[1], RestartAction::Restart).unwrap();
        RestartCoordinator::request(&nodes[1], RestartAction::DisableEnable).unwrap();
        RestartCoordinator::request(&nodes[1], RestartAction::Restart).unwrap();

        let state = RestartLockState::observe(&nodes[0]);
        assert_eq!(state.position("kafka/1"), Some(1));
        assert_eq!(
            state.entry("kafka/1").map(|e| e.action),
            Some(RestartAction::DisableEnable)
        );
    }

    #[test]
    fn test_requeue_moves_to_tail() {
        let (_, nodes) = cluster(2);
        RestartCoordinator::request(&nodes[0], RestartAction::Restart).unwrap();
        RestartCoordinator::request(&nodes[1], RestartAction::Restart).unwrap();

        RestartCoordinator::try_acquire(&nodes[0]).unwrap();
        RestartCoordinator::requeue(&nodes[0]).unwrap();

        let state = RestartLockState::observe(&nodes[1]);
        assert_eq!(state.head().map(|e| e.node.as_str()), Some("kafka/1"));
        assert!(state.holders.is_empty());
    }

    #[test]
    fn test_head_waits_while_lock_held_elsewhere() {
        let (host, nodes) = cluster(2);
        RestartCoordinator::request(&nodes[0], RestartAction::Restart).unwrap();
        // kafka/1 claims the lock without being head, as a racing peer would
        host.set(
            &broker_state::Scope::Unit("kafka/1".into()),
            keys::RESTART_LOCK_HOLDER,
            Some("kafka/1"),
        );

        assert_eq!(RestartCoordinator::try_acquire(&nodes[0]).unwrap(), LockAttempt::Waiting);
        assert_eq!(
            nodes[0].unit().get(keys::RESTART_LOCK_HOLDER),
            None,
            "waiting node must not claim the lock"
        );

        // The stray claim is dropped once its owner looks at the lock
        assert_eq!(RestartCoordinator::try_acquire(&nodes[1]).unwrap(), LockAttempt::NotQueued);
        assert_eq!(
            RestartCoordinator::try_acquire(&nodes[0]).unwrap(),
            LockAttempt::Granted(RestartAction::Restart)
        );
    }

    #[test]
    fn test_non_head_claim_yields() {
        let (host, nodes) = cluster(2);
        RestartCoordinator::request(&nodes[0], RestartAction::Restart).unwrap();
        RestartCoordinator::request(&nodes[1], RestartAction::Restart).unwrap();
        host.set(
            &broker_state::Scope::Unit("kafka/1".into()),
            keys::RESTART_LOCK_HOLDER,
            Some("kafka/1"),
        );

        assert_eq!(RestartCoordinator::try_acquire(&nodes[1]).unwrap(), LockAttempt::Yielded);
        assert_eq!(
            RestartCoordinator::try_acquire(&nodes[0]).unwrap(),
            LockAttempt::Granted(RestartAction::Restart)
        );
    }
}
