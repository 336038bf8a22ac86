//! Per-client credentials and ACLs

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use broker_auth::{acls_for, format_superusers, generate_password, superusers};
use broker_auth::{AuthBackend, CommandOutcome};
use broker_core::types::{ClientGrant, ClientRequest, RelationId};
use broker_state::StateView;

use crate::dependency::DependencyConfig;
use crate::error::ClusterResult;
use crate::events::Disposition;

/// Provisions and tears down access for client relations.
///
/// Only the leader acts; on followers every call is a no-op.
#[derive(Clone)]
pub struct ClientProvisioner {
    backend: Arc<dyn AuthBackend>,
    static_superusers: Vec<String>,
}

/// Map a backend outcome to "carry on" or a deferral.
///
/// Provisioning only runs from triggers, so a failed command is retried on a
/// later trigger rather than surfaced.
fn check(outcome: CommandOutcome, what: &str) -> Option<Disposition> {
    match outcome {
        CommandOutcome::Ready(_) => None,
        CommandOutcome::NotReadyYet(reason) => {
            debug!("{} deferred: {}", what, reason);
            Some(Disposition::Deferred(format!("{}: {}", what, reason)))
        }
        CommandOutcome::Failed(reason) => {
            error!("{} failed: {}", what, reason);
            Some(Disposition::Deferred(format!("{} failed: {}", what, reason)))
        }
    }
}

impl ClientProvisioner {
    pub fn new(backend: Arc<dyn AuthBackend>, static_superusers: Vec<String>) -> Self {
        Self {
            backend,
            static_superusers,
        }
    }

    /// React to a client publishing or changing its request
    pub async fn on_client_changed(
        &self,
        view: &StateView,
        relation_id: RelationId,
        dependency: &DependencyConfig,
        bootstrap_servers: &[String],
    ) -> ClusterResult<Disposition> {
        if !view.is_leader() {
            return Ok(Disposition::Handled);
        }

        let remote = view.relation(relation_id).remote();
        let Some(request) = ClientRequest::from_record(&remote) else {
            debug!("Client relation {} has not requested a topic yet", relation_id);
            return Ok(Disposition::Handled);
        };

        let cluster = view.cluster();
        let zk = dependency.connect.as_str();

        let grant = match cluster.grant(relation_id) {
            Some(existing) if existing.matches(&request) => existing,
            Some(existing) => {
                info!(
                    "Client relation {} changed request to topic {} roles {:?}",
                    relation_id, request.topic, request.roles
                );
                let acls = acls_for(
                    &existing.username,
                    &request.topic,
                    &request.roles,
                    &existing.consumer_group_prefix,
                );
                if let Some(d) = check(
                    self.backend.remove_all_acls(zk, &existing.username).await,
                    "revoke acls",
                ) {
                    return Ok(d);
                }
                if let Some(d) = check(self.backend.add_acls(zk, &acls).await, "add acls") {
                    return Ok(d);
                }
                let grant = ClientGrant {
                    roles: request.roles.clone(),
                    topic: request.topic.clone(),
                    acls,
                    ..existing
                };
                cluster.put_grant(&grant)?;
                grant
            }
            None => {
                let username = ClientGrant::username_for(relation_id);
                let password = generate_password();
                let prefix = ClientGrant::group_prefix_for(&username);
                let acls = acls_for(&username, &request.topic, &request.roles, &prefix);

                if let Some(d) = check(
                    self.backend.upsert_user(zk, &username, &password).await,
                    "add client user",
                ) {
                    return Ok(d);
                }
                if let Some(d) = check(self.backend.add_acls(zk, &acls).await, "add acls") {
                    return Ok(d);
                }

                let grant = ClientGrant {
                    relation_id,
                    username,
                    password,
                    roles: request.roles.clone(),
                    topic: request.topic.clone(),
                    acls,
                    consumer_group_prefix: prefix,
                    created_at: Utc::now(),
                };
                cluster.put_grant(&grant)?;
                info!(
                    "Provisioned {} for topic {} with roles {:?}",
                    grant.username, grant.topic, grant.roles
                );
                grant
            }
        };

        self.refresh_superusers(view)?;
        self.publish(view, &grant, dependency, bootstrap_servers)?;
        Ok(Disposition::Handled)
    }

    /// Tear down a client's access: one ACL revoke, one user delete
    pub async fn on_client_broken(
        &self,
        view: &StateView,
        relation_id: RelationId,
        dependency: &DependencyConfig,
    ) -> ClusterResult<Disposition> {
        if !view.is_leader() {
            return Ok(Disposition::Handled);
        }

        let cluster = view.cluster();
        let Some(grant) = cluster.grant(relation_id) else {
            debug!("No grant for client relation {}", relation_id);
            return Ok(Disposition::Handled);
        };

        let zk = dependency.connect.as_str();
        if let Some(d) = check(
            self.backend.remove_all_acls(zk, &grant.username).await,
            "revoke acls",
        ) {
            return Ok(d);
        }
        if let Some(d) = check(
            self.backend.delete_user(zk, &grant.username).await,
            "delete client user",
        ) {
            return Ok(d);
        }

        cluster.remove_grant(relation_id)?;
        view.relation(relation_id).clear_local()?;
        info!("Removed {} and its ACLs", grant.username);

        self.refresh_superusers(view)?;
        Ok(Disposition::Handled)
    }

    /// Recompute `superusers` from the static list and admin grants.
    ///
    /// Returns whether the stored value changed.
    pub fn refresh_superusers(&self, view: &StateView) -> ClusterResult<bool> {
        if !view.is_leader() {
            return Ok(false);
        }
        let cluster = view.cluster();
        let rendered = format_superusers(&superusers(&self.static_superusers, &cluster.grants()));
        if cluster.superusers().as_deref() == Some(rendered.as_str()) {
            return Ok(false);
        }
        cluster.set_superusers(&rendered)?;
        info!("Super users now {}", rendered);
        Ok(true)
    }

    /// Republish connection details to every provisioned client
    pub fn update_connection_info(
        &self,
        view: &StateView,
        dependency: &DependencyConfig,
        bootstrap_servers: &[String],
    ) -> ClusterResult<()> {
        if !view.is_leader() {
            return Ok(());
        }
        for relation_id in view.topology().client_relations() {
            match view.cluster().grant(relation_id) {
                Some(grant) => self.publish(view, &grant, dependency, bootstrap_servers)?,
                None => debug!("Client relation {} not provisioned yet", relation_id),
            }
        }
        Ok(())
    }

    fn publish(
        &self,
        view: &StateView,
        grant: &ClientGrant,
        dependency: &DependencyConfig,
        bootstrap_servers: &[String],
    ) -> ClusterResult<()> {
        let relation = view.relation(grant.relation_id);
        let request: BTreeMap<String, String> = relation.remote().into_iter().collect();
        if request.is_empty() {
            warn!("Client relation {} vanished before publishing", grant.relation_id);
            return Ok(());
        }

        relation.publish(&[
            ("username", grant.username.clone()),
            ("password", grant.password.clone()),
            ("endpoints", bootstrap_servers.join(",")),
            ("zookeeper-uris", dependency.connect.clone()),
            ("tls", view.cluster().tls().as_str().to_string()),
            ("consumer-group-prefix", grant.consumer_group_prefix.clone()),
            ("data", serde_json::to_string(&request)?),
        ])?;
        Ok(())
    }
}
