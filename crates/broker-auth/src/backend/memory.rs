//! In-memory backend
//!
//! Keeps users and ACLs in process and counts every call. Used by the test
//! suites and by the CLI in dry-run mode.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use broker_core::types::AclEntry;

use super::{AuthBackend, CommandOutcome};

/// Call counts per backend operation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub upsert_user: usize,
    pub delete_user: usize,
    pub add_acls: usize,
    pub remove_all_acls: usize,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    users: RwLock<BTreeMap<String, String>>,
    acls: RwLock<BTreeSet<AclEntry>>,
    unavailable: AtomicBool,
    failure: RwLock<Option<String>>,
    upsert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    add_acl_calls: AtomicUsize,
    remove_acl_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call report the dependency as not reachable
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make every call fail outright with `reason` until [`Self::clear_failure`]
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.write() = Some(reason.into());
    }

    pub fn clear_failure(&self) {
        *self.failure.write() = None;
    }

    pub fn password_of(&self, username: &str) -> Option<String> {
        self.users.read().get(username).cloned()
    }

    pub fn users(&self) -> Vec<String> {
        self.users.read().keys().cloned().collect()
    }

    pub fn acls_of(&self, username: &str) -> Vec<AclEntry> {
        self.acls
            .read()
            .iter()
            .filter(|a| a.username == username)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            upsert_user: self.upsert_calls.load(Ordering::SeqCst),
            delete_user: self.delete_calls.load(Ordering::SeqCst),
            add_acls: self.add_acl_calls.load(Ordering::SeqCst),
            remove_all_acls: self.remove_acl_calls.load(Ordering::SeqCst),
        }
    }

    fn refusal(&self, zookeeper: &str) -> Option<CommandOutcome> {
        if let Some(reason) = self.failure.read().clone() {
            return Some(CommandOutcome::Failed(reason));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Some(CommandOutcome::NotReadyYet("backend unavailable".to_string()));
        }
        if zookeeper.is_empty() {
            return Some(CommandOutcome::NotReadyYet("no zookeeper connection string".to_string()));
        }
        None
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn upsert_user(&self, zookeeper: &str, username: &str, password: &str) -> CommandOutcome {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.refusal(zookeeper) {
            return outcome;
        }
        self.users
            .write()
            .insert(username.to_string(), password.to_string());
        CommandOutcome::Ready(String::new())
    }

    async fn delete_user(&self, zookeeper: &str, username: &str) -> CommandOutcome {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.refusal(zookeeper) {
            return outcome;
        }
        self.users.write().remove(username);
        CommandOutcome::Ready(String::new())
    }

    async fn add_acls(&self, zookeeper: &str, acls: &[AclEntry]) -> CommandOutcome {
        self.add_acl_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.refusal(zookeeper) {
            return outcome;
        }
        self.acls.write().extend(acls.iter().cloned());
        CommandOutcome::Ready(String::new())
    }

    async fn remove_all_acls(&self, zookeeper: &str, username: &str) -> CommandOutcome {
        self.remove_acl_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.refusal(zookeeper) {
            return outcome;
        }
        self.acls.write().retain(|a| a.username != username);
        CommandOutcome::Ready(String::new())
    }
}
