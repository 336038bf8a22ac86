//! Dependency (ZooKeeper) descriptor parsing

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use broker_core::types::TlsState;
use broker_state::StateView;

/// Keys the dependency must publish before the record is usable
const REQUIRED_KEYS: [&str; 5] = ["chroot", "username", "password", "endpoints", "uris"];

/// Connection details published by the dependency service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyConfig {
    pub chroot: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub endpoints: Vec<String>,
    pub uris: Vec<String>,
    /// Connection string: de-chrooted uris, then the chroot once
    pub connect: String,
    pub tls: TlsState,
}

impl DependencyConfig {
    /// Parse the dependency's side of the relation.
    ///
    /// An incomplete record is not an error: it yields an empty,
    /// disconnected config.
    pub fn read(record: &HashMap<String, String>) -> Self {
        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| record.get(*key).map_or(true, |v| v.is_empty()))
            .collect();
        if !missing.is_empty() {
            debug!("Dependency record incomplete, missing {:?}", missing);
            return Self::default();
        }

        let get = |key: &str| record.get(key).cloned().unwrap_or_default();
        let chroot = get("chroot");

        let endpoints: Vec<String> = split_unique(&get("endpoints")).into_iter().collect();
        let uris: Vec<String> = get("uris")
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();

        let hosts: BTreeSet<&str> = uris
            .iter()
            .map(|uri| uri.strip_suffix(chroot.as_str()).unwrap_or(uri))
            .collect();
        let connect = format!("{}{}", hosts.into_iter().collect::<Vec<_>>().join(","), chroot);

        Self {
            chroot,
            username: get("username"),
            password: get("password"),
            endpoints,
            uris,
            connect,
            tls: TlsState::parse(record.get("tls").map(String::as_str)),
        }
    }

    /// Read the dependency relation through a node's view; disconnected when
    /// the relation is absent
    pub fn from_view(view: &StateView) -> Self {
        match view.topology().dependency_relation() {
            Some(id) => Self::read(&view.relation(id).remote()),
            None => Self::default(),
        }
    }

    /// Whether a connection string and credential pair were present
    pub fn connected(&self) -> bool {
        !self.connect.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }
}

fn split_unique(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
