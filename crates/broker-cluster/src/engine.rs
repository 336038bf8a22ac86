//! Per-node reconciliation state machine
//!
//! Every trigger re-reads the shared store and the dependency record, decides
//! whether the node may run, renders the target configuration and compares
//! it with what is on disk. Disruptive changes never restart the broker
//! directly; they go through the [`RestartCoordinator`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use broker_auth::{generate_password, ApplyStatus, AuthBackend, AuthError, CredentialAuthority};
use broker_core::types::{node_ordinal, NodeRole, UnitStatus};
use broker_core::{OperatorConfig, ADMIN_USER};
use broker_state::StateView;

use crate::dependency::DependencyConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::events::{ActionOutput, AdminAction, Disposition, EventKind};
use crate::files::ConfigFiles;
use crate::metrics;
use crate::properties::{self, BrokerInputs, PropertiesBuilder};
use crate::provider::ClientProvisioner;
use crate::restart::{LockAttempt, RestartAction, RestartCoordinator, RestartLockState};
use crate::workload::Workload;

const STORAGE_ATTACHED_MSG: &str =
    "manual partition reassignment may be needed for Kafka to utilize new storage volumes";
const STORAGE_DETACHING_REPLICATED_MSG: &str = concat!(
    "manual partition reassignment from replicated brokers recommended ",
    "due to lost partitions on removed storage volumes"
);
const STORAGE_DETACHING_UNREPLICATED_MSG: &str =
    "potential log-data loss due to storage removal without replication";
const MISSING_DEPENDENCY_MSG: &str = "missing required zookeeper relation";

/// Where a node stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodePhase {
    Uninitialized,
    WaitingDependency,
    WaitingPeerGroup,
    WaitingCredentials,
    Ready,
    Active,
    Blocked,
}

/// Snapshot of a node for operators
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub node: String,
    pub role: NodeRole,
    pub phase: NodePhase,
    pub status: UnitStatus,
    pub address: Option<String>,
    pub credentials_ready: bool,
    pub dependency: DependencyConfig,
    /// Nodes waiting for the restart lock, in grant order
    pub restart_queue: Vec<String>,
    pub restart_holder: Option<String>,
}

/// Drives one node towards the configuration implied by the shared state
pub struct Reconciler {
    config: Arc<OperatorConfig>,
    view: StateView,
    workload: Arc<dyn Workload>,
    authority: CredentialAuthority,
    provisioner: ClientProvisioner,
    files: ConfigFiles,
    address: Option<String>,
}

impl Reconciler {
    pub fn new(
        config: Arc<OperatorConfig>,
        view: StateView,
        workload: Arc<dyn Workload>,
        backend: Arc<dyn AuthBackend>,
    ) -> Self {
        let files = ConfigFiles::from_config(&config);
        let provisioner =
            ClientProvisioner::new(Arc::clone(&backend), config.broker.static_super_users.clone());
        Self {
            config,
            view,
            workload,
            authority: CredentialAuthority::new(backend),
            provisioner,
            files,
            address: None,
        }
    }

    /// Address published into node scope on every trigger
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn view(&self) -> &StateView {
        &self.view
    }

    pub fn files(&self) -> &ConfigFiles {
        &self.files
    }

    pub fn status(&self) -> UnitStatus {
        self.view.unit().status()
    }

    fn broker_id(&self) -> ClusterResult<u32> {
        Ok(node_ordinal(self.view.node_id())?)
    }

    fn dependency(&self) -> DependencyConfig {
        DependencyConfig::from_view(&self.view)
    }

    fn inputs(&self, dependency: &DependencyConfig) -> ClusterResult<BrokerInputs> {
        BrokerInputs::gather(&self.view, &self.config, dependency.clone())
    }

    fn set_status(&self, status: UnitStatus) -> ClusterResult<()> {
        let unit = self.view.unit();
        if unit.status() != status {
            debug!("{} status now {}", self.view.node_id(), status);
            unit.set_status(&status)?;
        }
        Ok(())
    }

    fn publish_address(&self) -> ClusterResult<()> {
        if let Some(address) = &self.address {
            let unit = self.view.unit();
            if unit.address().as_deref() != Some(address.as_str()) {
                unit.set_address(address)?;
            }
        }
        Ok(())
    }

    pub fn phase(&self) -> NodePhase {
        let status = self.status();
        if status.is_blocked() {
            return NodePhase::Blocked;
        }

        let dependency = self.dependency();
        if status == UnitStatus::Installing
            && self.view.peers().is_none()
            && self.view.topology().dependency_relation().is_none()
        {
            NodePhase::Uninitialized
        } else if !dependency.connected() {
            NodePhase::WaitingDependency
        } else if self.view.peers().is_none() {
            NodePhase::WaitingPeerGroup
        } else if !self.view.cluster().credentials_ready() {
            NodePhase::WaitingCredentials
        } else if status.is_active() {
            NodePhase::Active
        } else {
            NodePhase::Ready
        }
    }

    pub fn report(&self) -> StatusReport {
        let lock = RestartLockState::observe(&self.view);
        StatusReport {
            node: self.view.node_id().to_string(),
            role: NodeRole::from_leadership(self.view.is_leader()),
            phase: self.phase(),
            status: self.status(),
            address: self.view.unit().address(),
            credentials_ready: self.view.cluster().credentials_ready(),
            dependency: self.dependency(),
            restart_queue: lock.queue.iter().map(|e| e.node.clone()).collect(),
            restart_holder: lock.holder().cloned(),
        }
    }

    /// The status the node must take when it may not run, `None` when it may
    pub fn evaluate(&self, dependency: &DependencyConfig) -> Option<UnitStatus> {
        if self.view.peers().is_none() {
            return Some(UnitStatus::waiting("waiting for peer relation"));
        }

        if self.view.cluster().tls().is_enabled() != dependency.tls.is_enabled() {
            let msg = "TLS must be enabled for Zookeeper and Kafka";
            error!("{}", msg);
            return Some(UnitStatus::blocked(msg));
        }

        let min = self.config.storage.min_volumes;
        if self.view.topology().attached_volumes(self.view.node_id()) < min {
            let msg = format!("Storage volumes lower than minimum of {}", min);
            error!("{}", msg);
            return Some(UnitStatus::blocked(msg));
        }

        if self.view.topology().dependency_relation().is_none() {
            return Some(UnitStatus::blocked(MISSING_DEPENDENCY_MSG));
        }
        if !dependency.connected() {
            return Some(UnitStatus::waiting("waiting for zookeeper relation"));
        }
        if !self.view.cluster().credentials_ready() {
            return Some(UnitStatus::waiting("waiting for internal credentials"));
        }
        None
    }

    /// Evaluate readiness, recording the reason when not ready
    pub fn ready_to_start(&self, dependency: &DependencyConfig) -> ClusterResult<bool> {
        match self.evaluate(dependency) {
            None => Ok(true),
            Some(status) => {
                debug!("{} not ready: {}", self.view.node_id(), status);
                self.set_status(status)?;
                Ok(false)
            }
        }
    }

    /// Leader only: push the internal users to the backend.
    ///
    /// Returns a deferral while the backend cannot take them yet or a command
    /// failed. With `force` unset, nothing happens once `credentials-ready` is
    /// visible.
    pub async fn ensure_credentials_applied(
        &self,
        dependency: &DependencyConfig,
        force: bool,
    ) -> ClusterResult<Option<Disposition>> {
        if !self.view.is_leader() || self.view.peers().is_none() || !dependency.connected() {
            return Ok(None);
        }
        if !force && self.view.cluster().credentials_ready() {
            return Ok(None);
        }

        match self
            .authority
            .apply_internal_credentials(&self.view, &dependency.connect)
            .await
        {
            Ok(ApplyStatus::Applied) => Ok(None),
            Ok(ApplyStatus::Pending(reason)) => Ok(Some(Disposition::Deferred(format!(
                "internal credentials not applied: {}",
                reason
            )))),
            // Already logged by the authority; retried on the next trigger
            Err(AuthError::Backend(reason)) => Ok(Some(Disposition::Deferred(format!(
                "internal credentials failed: {}",
                reason
            )))),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_artifacts(&self, builder: &PropertiesBuilder<'_>) -> ClusterResult<()> {
        self.files.write_jaas(&builder.jaas_config()).await?;
        self.files
            .write_server_properties(&builder.server_properties())
            .await?;
        self.files
            .write_client_properties(&builder.client_properties())
            .await
    }

    /// Generic pass: render, compare, and request a restart on change
    pub async fn reconcile(&self, action: RestartAction) -> ClusterResult<Disposition> {
        let dependency = self.dependency();
        if let Some(deferred) = self.ensure_credentials_applied(&dependency, false).await? {
            return Ok(deferred);
        }
        if !self.ready_to_start(&dependency)? {
            return Ok(Disposition::Deferred("not ready to start".to_string()));
        }

        let Some(current) = self.files.server_properties().await? else {
            return Ok(Disposition::Deferred("broker not started yet".to_string()));
        };

        self.provisioner.refresh_superusers(&self.view)?;

        let inputs = self.inputs(&dependency)?;
        let builder = PropertiesBuilder::new(&self.config, &inputs);
        let target = builder.server_properties();

        let old = line_set(&current);
        let new = line_set(&target);
        if old != new {
            info!(
                "Broker {} updating config - OLD PROPERTIES = {:?}, NEW PROPERTIES = {:?}",
                inputs.broker_id,
                old.difference(&new).collect::<Vec<_>>(),
                new.difference(&old).collect::<Vec<_>>()
            );
            self.write_artifacts(&builder).await?;
            RestartCoordinator::request(&self.view, action)?;
            metrics::record_reconcile("restart");
        } else {
            let client = builder.client_properties();
            let on_disk = self.files.client_properties().await?.unwrap_or_default();
            if line_set(&on_disk) != line_set(&client) {
                info!("Broker {} updating client properties", inputs.broker_id);
                self.files.write_client_properties(&client).await?;
                metrics::record_reconcile("client");
            } else {
                metrics::record_reconcile("unchanged");
            }
        }

        self.provisioner
            .update_connection_info(&self.view, &dependency, &builder.bootstrap_servers())?;

        self.advance_restart_lock().await?;
        Ok(Disposition::Handled)
    }

    /// Take the restart lock if it is this node's turn and run the queued action
    pub async fn advance_restart_lock(&self) -> ClusterResult<()> {
        match RestartCoordinator::try_acquire(&self.view)? {
            LockAttempt::Granted(action) => self.run_restart(action).await,
            attempt => {
                debug!("{} restart lock: {:?}", self.view.node_id(), attempt);
                Ok(())
            }
        }
    }

    async fn run_restart(&self, action: RestartAction) -> ClusterResult<()> {
        let dependency = self.dependency();
        if !self.ready_to_start(&dependency)? {
            warn!("{} holds the restart lock but is not ready, requeueing", self.view.node_id());
            RestartCoordinator::requeue(&self.view)?;
            return Ok(());
        }

        let broker_id = self.broker_id()?;
        let result = match action {
            RestartAction::Restart => self.workload.restart().await,
            RestartAction::DisableEnable => self.workload.disable_enable().await,
        };
        RestartCoordinator::release(&self.view)?;

        let active = match result {
            Ok(()) => self.workload.broker_active(broker_id, &dependency).await,
            Err(e) => {
                error!("Broker {} {} failed: {}", broker_id, action, e);
                false
            }
        };
        metrics::record_restart(action.as_str(), active);

        if active {
            info!("Broker {} restarted", broker_id);
            self.set_status(UnitStatus::active())
        } else {
            self.set_status(UnitStatus::blocked(format!(
                "Broker {} failed to restart",
                broker_id
            )))
        }
    }

    /// Handle one trigger
    pub async fn handle(&self, event: &EventKind) -> ClusterResult<Disposition> {
        metrics::record_event(event.name());
        self.publish_address()?;
        debug!("{} handling {}", self.view.node_id(), event);

        match event {
            EventKind::Install => self.on_install().await,
            EventKind::Start => self.on_start().await,
            EventKind::LeaderElected => self.on_leader_elected(),
            EventKind::ConfigChanged | EventKind::DependencyChanged => {
                self.reconcile(RestartAction::Restart).await
            }
            EventKind::PeerChanged => {
                let disposition = self.reconcile(RestartAction::Restart).await?;
                if disposition.is_deferred() {
                    self.advance_restart_lock().await?;
                }
                Ok(disposition)
            }
            EventKind::DependencyJoined => self.on_dependency_joined(),
            EventKind::DependencyBroken => self.on_dependency_broken().await,
            EventKind::StorageAttached => self.on_storage_attached().await,
            EventKind::StorageDetaching => self.on_storage_detaching().await,
            EventKind::ClientChanged(id) => self.on_client_changed(*id).await,
            EventKind::ClientBroken(id) => self.on_client_broken(*id).await,
        }
    }

    async fn on_install(&self) -> ClusterResult<Disposition> {
        match self.workload.install().await {
            Ok(()) => {
                let opts = properties::extra_args(&self.config).join(" ");
                self.files.set_env_var("KAFKA_OPTS", &opts).await?;
                self.set_status(UnitStatus::waiting("waiting for zookeeper relation"))?;
            }
            Err(e) => {
                error!("Install failed: {}", e);
                self.set_status(UnitStatus::blocked("unable to install broker workload"))?;
            }
        }
        Ok(Disposition::Handled)
    }

    fn on_leader_elected(&self) -> ClusterResult<Disposition> {
        if self.view.peers().is_none() {
            debug!("no peer relation");
            return Ok(Disposition::Deferred("waiting for peer relation".to_string()));
        }
        if self.view.is_leader() {
            self.authority.ensure_internal_credentials(&self.view)?;
        }
        Ok(Disposition::Handled)
    }

    async fn on_start(&self) -> ClusterResult<Disposition> {
        let dependency = self.dependency();
        if !dependency.connected() {
            return Ok(Disposition::Deferred("dependency not connected".to_string()));
        }
        if self.view.peers().is_none() {
            debug!("no peer relation");
            return Ok(Disposition::Deferred("waiting for peer relation".to_string()));
        }

        if self.view.is_leader() {
            self.authority.ensure_internal_credentials(&self.view)?;
        }

        let inputs = self.inputs(&dependency)?;
        let builder = PropertiesBuilder::new(&self.config, &inputs);
        self.write_artifacts(&builder).await?;

        if let Some(deferred) = self.ensure_credentials_applied(&dependency, true).await? {
            return Ok(deferred);
        }
        if !self.ready_to_start(&dependency)? {
            return Ok(Disposition::Deferred("not ready to start".to_string()));
        }

        if let Err(e) = self.workload.start().await {
            error!("Broker {} failed to start: {}", inputs.broker_id, e);
            self.set_status(UnitStatus::blocked("unable to start broker service"))?;
            return Ok(Disposition::Handled);
        }

        if self.workload.broker_active(inputs.broker_id, &dependency).await {
            info!("Broker {} connected", inputs.broker_id);
            self.set_status(UnitStatus::active())?;
        } else {
            self.set_status(UnitStatus::blocked("broker not connected to zookeeper"))?;
            return Ok(Disposition::Handled);
        }

        self.provisioner.refresh_superusers(&self.view)?;
        self.provisioner
            .update_connection_info(&self.view, &dependency, &builder.bootstrap_servers())?;
        Ok(Disposition::Handled)
    }

    fn on_dependency_joined(&self) -> ClusterResult<Disposition> {
        if !self.view.is_leader() {
            return Ok(Disposition::Handled);
        }
        if let Some(id) = self.view.topology().dependency_relation() {
            let chroot = format!("/{}", self.config.broker.app_name);
            self.view
                .relation(id)
                .publish(&[(broker_core::keys::CHROOT, chroot.clone())])?;
            info!("Requested dependency chroot {}", chroot);
        }
        Ok(Disposition::Handled)
    }

    async fn on_dependency_broken(&self) -> ClusterResult<Disposition> {
        if let Err(e) = self.workload.stop().await {
            error!("Failed to stop broker service: {}", e);
        }
        info!("Broker {} disconnected", self.broker_id()?);
        self.set_status(UnitStatus::blocked(MISSING_DEPENDENCY_MSG))?;
        Ok(Disposition::Handled)
    }

    async fn broker_running(&self, dependency: &DependencyConfig) -> ClusterResult<bool> {
        if !dependency.connected() {
            return Ok(false);
        }
        Ok(self
            .workload
            .broker_active(self.broker_id()?, dependency)
            .await)
    }

    async fn on_storage_attached(&self) -> ClusterResult<Disposition> {
        if !self.broker_running(&self.dependency()).await? {
            return Ok(Disposition::Handled);
        }

        // New directories only receive partitions assigned to them
        warn!("attaching storage - {}", STORAGE_ATTACHED_MSG);
        self.set_status(UnitStatus::Active(Some(STORAGE_ATTACHED_MSG.to_string())))?;
        self.reconcile(RestartAction::DisableEnable).await
    }

    async fn on_storage_detaching(&self) -> ClusterResult<Disposition> {
        if !self.broker_running(&self.dependency()).await? {
            return Ok(Disposition::Handled);
        }

        let replicated = self.view.peers().map_or(false, |peers| peers.len() > 1);
        if replicated {
            warn!("removing storage - {}", STORAGE_DETACHING_REPLICATED_MSG);
            self.set_status(UnitStatus::blocked(STORAGE_DETACHING_REPLICATED_MSG))?;
        } else {
            error!("removing storage - {}", STORAGE_DETACHING_UNREPLICATED_MSG);
            self.set_status(UnitStatus::blocked(STORAGE_DETACHING_UNREPLICATED_MSG))?;
        }
        self.reconcile(RestartAction::DisableEnable).await
    }

    async fn on_client_changed(&self, relation_id: u32) -> ClusterResult<Disposition> {
        if !self.view.is_leader() {
            return Ok(Disposition::Handled);
        }
        let dependency = self.dependency();
        if !self.ready_to_start(&dependency)? {
            return Ok(Disposition::Deferred("not ready to start".to_string()));
        }

        let inputs = self.inputs(&dependency)?;
        let servers = PropertiesBuilder::new(&self.config, &inputs).bootstrap_servers();
        let disposition = self
            .provisioner
            .on_client_changed(&self.view, relation_id, &dependency, &servers)
            .await?;
        if disposition.is_deferred() {
            return Ok(disposition);
        }
        self.reconcile(RestartAction::Restart).await
    }

    async fn on_client_broken(&self, relation_id: u32) -> ClusterResult<Disposition> {
        if !self.view.is_leader() {
            return Ok(Disposition::Handled);
        }
        let disposition = self
            .provisioner
            .on_client_broken(&self.view, relation_id, &self.dependency())
            .await?;
        if disposition.is_deferred() {
            return Ok(disposition);
        }
        self.reconcile(RestartAction::Restart).await
    }

    /// Run an administrative action; failures carry the message shown to the operator
    pub async fn run_action(&self, action: &AdminAction) -> ClusterResult<ActionOutput> {
        self.publish_address()?;
        let result = match action {
            AdminAction::SetPassword { username, password } => {
                self.set_password(username, password.clone()).await
            }
            AdminAction::GetAdminCredentials => self.get_admin_credentials().await,
            AdminAction::RollingRestartUnit => self.rolling_restart_unit().await,
        };
        metrics::record_action(action.name(), result.is_ok());
        if let Err(e) = &result {
            error!("Action {} failed: {}", action.name(), e);
        }
        result
    }

    async fn set_password(
        &self,
        username: &str,
        password: Option<String>,
    ) -> ClusterResult<ActionOutput> {
        if self.view.peers().is_none() {
            return Err(ClusterError::ActionFailed("waiting for peer relation".to_string()));
        }

        let password = password.unwrap_or_else(generate_password);
        let dependency = self.dependency();
        self.authority
            .rotate(&self.view, &dependency.connect, username, &password)
            .await?;

        // The new password reaches server.properties through a regular pass
        match self.reconcile(RestartAction::Restart).await {
            Ok(Disposition::Deferred(reason)) => debug!("Reconcile after rotation deferred: {}", reason),
            Ok(Disposition::Handled) => {}
            Err(e) => warn!("Reconcile after rotation failed: {}", e),
        }

        let mut output = ActionOutput::new();
        output.insert(format!("{}-password", username), password);
        Ok(output)
    }

    async fn get_admin_credentials(&self) -> ClusterResult<ActionOutput> {
        let client = self
            .files
            .client_properties()
            .await?
            .filter(|lines| !lines.is_empty())
            .ok_or_else(|| {
                ClusterError::ActionFailed("client.properties file not found on target unit.".into())
            })?;

        let inputs = self.inputs(&self.dependency())?;
        let tls: BTreeSet<String> = PropertiesBuilder::new(&self.config, &inputs)
            .tls_properties()
            .into_iter()
            .collect();
        let admin: Vec<String> = client.into_iter().filter(|l| !tls.contains(l)).collect();

        let mut output = ActionOutput::new();
        output.insert("username".to_string(), ADMIN_USER.to_string());
        output.insert(
            "password".to_string(),
            self.view
                .cluster()
                .internal_password(ADMIN_USER)
                .unwrap_or_default(),
        );
        output.insert("client-properties".to_string(), admin.join("\n"));
        Ok(output)
    }

    async fn rolling_restart_unit(&self) -> ClusterResult<ActionOutput> {
        RestartCoordinator::request(&self.view, RestartAction::Restart)?;
        self.advance_restart_lock().await?;

        let lock = RestartLockState::observe(&self.view);
        let mut output = ActionOutput::new();
        match lock.position(self.view.node_id()) {
            Some(position) => {
                output.insert("restart".to_string(), "queued".to_string());
                output.insert("position".to_string(), position.to_string());
            }
            None => {
                output.insert("restart".to_string(), "completed".to_string());
                output.insert("status".to_string(), self.status().to_string());
            }
        }
        Ok(output)
    }
}

fn line_set(lines: &[String]) -> BTreeSet<&str> {
    lines.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeferredEvent, Dispatcher};
    use crate::workload::MemoryWorkload;
    use broker_auth::MemoryBackend;
    use broker_core::keys;
    use broker_core::types::RelationId;
    use broker_state::{MemoryHost, RelationKind, StateStore, Topology};
    use tempfile::TempDir;

    struct Fixture {
        host: Arc<MemoryHost>,
        backend: Arc<MemoryBackend>,
        dependency: RelationId,
        dir: TempDir,
    }

    struct Node {
        dispatcher: Dispatcher,
        workload: Arc<MemoryWorkload>,
    }

    impl Node {
        fn reconciler(&self) -> &Reconciler {
            self.dispatcher.reconciler()
        }

        async fn server_properties(&self) -> Vec<String> {
            self.reconciler()
                .files()
                .server_properties()
                .await
                .unwrap()
                .unwrap_or_default()
        }
    }

    const DEPENDENCY_RECORD: [(&str, &str); 6] = [
        ("chroot", "/kafka"),
        ("username", "moria"),
        ("password", "mellon"),
        ("endpoints", "1.1.1.1,2.2.2.2"),
        ("uris", "1.1.1.1:2181/kafka,2.2.2.2:2181/kafka"),
        ("tls", "disabled"),
    ];

    fn fixture(nodes: usize) -> Fixture {
        let host = Arc::new(MemoryHost::new());
        for i in 0..nodes {
            let node = format!("kafka/{}", i);
            host.add_peer(&node);
            host.set_volumes(&node, 1);
        }
        host.set_leader(Some("kafka/0"));
        let dependency = host.add_relation(RelationKind::Dependency, "zookeeper");
        host.update_remote(dependency, &DEPENDENCY_RECORD);

        Fixture {
            host,
            backend: Arc::new(MemoryBackend::new()),
            dependency,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        fn node_with(&self, ordinal: usize, configure: impl FnOnce(&mut OperatorConfig)) -> Node {
            let name = format!("kafka/{}", ordinal);
            let root = self.dir.path().join(format!("kafka-{}", ordinal));

            let mut config = OperatorConfig::default();
            config.paths.config_dir = root.join("etc");
            config.paths.data_dir = root.join("data");
            config.paths.env_file = root.join("environment");
            configure(&mut config);

            let view = StateView::new(
                name.as_str(),
                Arc::clone(&self.host) as Arc<dyn StateStore>,
                Arc::clone(&self.host) as Arc<dyn Topology>,
                self.host.leadership_for(name.as_str()),
            );
            let workload = Arc::new(MemoryWorkload::new());
            let reconciler = Reconciler::new(
                Arc::new(config),
                view,
                Arc::clone(&workload) as Arc<dyn Workload>,
                Arc::clone(&self.backend) as Arc<dyn AuthBackend>,
            )
            .with_address(format!("10.0.0.{}", ordinal));

            Node {
                dispatcher: Dispatcher::new(reconciler, 10),
                workload,
            }
        }

        fn node(&self, ordinal: usize) -> Node {
            self.node_with(ordinal, |_| {})
        }
    }

    async fn started(fixture: &Fixture, count: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = (0..count).map(|i| fixture.node(i)).collect();
        for node in nodes.iter_mut() {
            node.dispatcher.deliver(EventKind::Start).await.unwrap();
        }
        for node in nodes.iter_mut() {
            node.dispatcher.deliver(EventKind::PeerChanged).await.unwrap();
        }
        nodes
    }

    #[tokio::test]
    async fn test_install_writes_env_and_waits() {
        let fixture = fixture(1);
        let mut node = fixture.node(0);

        node.dispatcher.deliver(EventKind::Install).await.unwrap();
        assert_eq!(
            node.reconciler().status(),
            UnitStatus::waiting("waiting for zookeeper relation")
        );

        let env = fixture.dir.path().join("kafka-0").join("environment");
        let content = std::fs::read_to_string(env).unwrap();
        assert!(content.contains("KAFKA_OPTS=-Djava.security.auth.login.config="));
    }

    #[tokio::test]
    async fn test_install_failure_blocks() {
        let fixture = fixture(1);
        let mut node = fixture.node(0);
        node.workload.fail_install(true);

        node.dispatcher.deliver(EventKind::Install).await.unwrap();
        assert_eq!(
            node.reconciler().status(),
            UnitStatus::blocked("unable to install broker workload")
        );
    }

    #[tokio::test]
    async fn test_two_node_bootstrap() {
        let fixture = fixture(2);
        let nodes = started(&fixture, 2).await;

        for node in &nodes {
            assert!(node.reconciler().status().is_active());
            assert_eq!(node.reconciler().phase(), NodePhase::Active);
            assert!(node.workload.is_running());
        }
        assert!(fixture.host.get(&broker_state::Scope::Cluster, keys::CREDENTIALS_READY).is_some());
        assert_eq!(fixture.backend.users(), vec!["admin".to_string(), "sync".to_string()]);

        let client = nodes[0]
            .reconciler()
            .files()
            .client_properties()
            .await
            .unwrap()
            .unwrap();
        let bootstrap = client
            .iter()
            .find(|l| l.starts_with("bootstrap.servers="))
            .unwrap();
        assert!(bootstrap.contains("10.0.0.0:9092"));
        assert!(bootstrap.contains("10.0.0.1:9092"));

        let server = nodes[1].server_properties().await;
        assert!(server.contains(&"broker.id=1".to_string()));
        assert!(server.contains(&"default.replication.factor=2".to_string()));
        assert!(server.contains(&"zookeeper.connect=1.1.1.1:2181,2.2.2.2:2181/kafka".to_string()));
    }

    #[tokio::test]
    async fn test_follower_defers_until_credentials_ready() {
        let fixture = fixture(2);
        let mut leader = fixture.node(0);
        let mut follower = fixture.node(1);

        let d = follower.dispatcher.deliver(EventKind::Start).await.unwrap();
        assert!(d.is_deferred());
        assert_eq!(follower.dispatcher.deferred().len(), 1);
        assert_eq!(follower.reconciler().phase(), NodePhase::WaitingCredentials);
        assert!(!follower.workload.is_running());

        leader.dispatcher.deliver(EventKind::Start).await.unwrap();
        assert!(leader.reconciler().status().is_active());

        follower.dispatcher.deliver(EventKind::ConfigChanged).await.unwrap();
        assert!(follower.dispatcher.deferred().is_empty());
        assert!(follower.reconciler().status().is_active());
        assert!(follower
            .server_properties()
            .await
            .iter()
            .any(|l| l.contains("username=\"sync\"") && !l.contains("password=\"\"")));
    }

    #[tokio::test]
    async fn test_backend_unavailable_defers_start() {
        let fixture = fixture(1);
        let mut node = fixture.node(0);
        fixture.backend.set_available(false);

        let d = node.dispatcher.deliver(EventKind::Start).await.unwrap();
        assert!(d.is_deferred());
        assert!(!node.reconciler().view().cluster().credentials_ready());

        fixture.backend.set_available(true);
        node.dispatcher.deliver(EventKind::ConfigChanged).await.unwrap();
        assert!(node.reconciler().status().is_active());
    }

    #[tokio::test]
    async fn test_backend_failure_defers_start_until_recovery() {
        let fixture = fixture(1);
        let mut node = fixture.node(0);
        fixture.backend.fail_with("boom");

        let d = node.dispatcher.deliver(EventKind::Start).await.unwrap();
        assert_eq!(
            d,
            Disposition::Deferred("internal credentials failed: boom".to_string())
        );
        assert_eq!(node.dispatcher.deferred().len(), 1);
        assert!(!node.workload.is_running());

        fixture.backend.clear_failure();
        node.dispatcher.deliver(EventKind::PeerChanged).await.unwrap();
        assert!(node.dispatcher.deferred().is_empty());
        assert!(node.workload.is_running());
        assert!(node.reconciler().status().is_active());
    }

    #[tokio::test]
    async fn test_set_password_surfaces_backend_failure() {
        let fixture = fixture(1);
        let mut nodes = started(&fixture, 1).await;
        let before = nodes[0].reconciler().view().cluster().internal_password("sync");
        fixture.backend.fail_with("boom");

        let err = nodes[0]
            .dispatcher
            .run_action(&AdminAction::SetPassword {
                username: "sync".to_string(),
                password: Some("new-sync".to_string()),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(
            nodes[0].reconciler().view().cluster().internal_password("sync"),
            before
        );
    }

    #[tokio::test]
    async fn test_failed_redelivery_stays_queued() {
        let fixture = fixture(1);
        // A directory where the environment file belongs makes install error
        let env_dir = fixture.dir.path().to_path_buf();
        let node = fixture.node_with(0, move |c| c.paths.env_file = env_dir);
        let mut dispatcher = node.dispatcher.with_deferred(vec![DeferredEvent {
            event: EventKind::Install,
            attempts: 1,
        }]);

        dispatcher.deliver(EventKind::LeaderElected).await.unwrap();
        assert_eq!(
            dispatcher.deferred(),
            vec![DeferredEvent {
                event: EventKind::Install,
                attempts: 2,
            }]
        );

        dispatcher.deliver(EventKind::LeaderElected).await.unwrap();
        assert_eq!(dispatcher.deferred()[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_client_backend_failure_defers_trigger() {
        let fixture = fixture(1);
        let mut nodes = started(&fixture, 1).await;
        let id = fixture.host.add_relation(RelationKind::Client, "app");
        fixture
            .host
            .update_remote(id, &[("topic", "TOPIC"), ("extra-user-roles", "consumer")]);
        fixture.backend.fail_with("boom");

        let d = nodes[0]
            .dispatcher
            .deliver(EventKind::ClientChanged(id))
            .await
            .unwrap();
        assert!(d.is_deferred());
        assert!(nodes[0].reconciler().view().cluster().grant(id).is_none());

        fixture.backend.clear_failure();
        nodes[0].dispatcher.deliver(EventKind::ConfigChanged).await.unwrap();
        assert!(nodes[0].dispatcher.deferred().is_empty());
        assert!(nodes[0].reconciler().view().cluster().grant(id).is_some());
    }

    #[tokio::test]
    async fn test_restart_failure_blocks_only_that_node() {
        let fixture = fixture(2);
        let mut nodes = started(&fixture, 2).await;
        nodes[1].workload.fail_restart(true);

        fixture.host.update_remote(
            fixture.dependency,
            &[("uris", "1.1.1.1:2181/kafka,3.3.3.3:2181/kafka")],
        );
        for node in nodes.iter_mut() {
            node.dispatcher
                .deliver(EventKind::DependencyChanged)
                .await
                .unwrap();
        }

        assert!(nodes[0].reconciler().status().is_active());
        assert_eq!(nodes[0].workload.count("restart"), 1);
        assert_eq!(
            nodes[1].reconciler().status(),
            UnitStatus::blocked("Broker 1 failed to restart")
        );

        let lock = RestartLockState::observe(nodes[0].reconciler().view());
        assert!(lock.queue.is_empty());
        assert!(lock.holder().is_none());
    }

    #[tokio::test]
    async fn test_unchanged_config_does_not_restart() {
        let fixture = fixture(1);
        let mut nodes = started(&fixture, 1).await;

        nodes[0].dispatcher.deliver(EventKind::ConfigChanged).await.unwrap();
        nodes[0].dispatcher.deliver(EventKind::ConfigChanged).await.unwrap();
        assert_eq!(nodes[0].workload.count("restart"), 0);
    }

    #[tokio::test]
    async fn test_reconcile_before_start_defers() {
        let fixture = fixture(1);
        let mut node = fixture.node(0);
        node.dispatcher.deliver(EventKind::LeaderElected).await.unwrap();

        let d = node.dispatcher.deliver(EventKind::ConfigChanged).await.unwrap();
        assert_eq!(d, Disposition::Deferred("broker not started yet".to_string()));
    }

    #[tokio::test]
    async fn test_tls_mismatch_blocks() {
        let fixture = fixture(1);
        let mut nodes = started(&fixture, 1).await;

        nodes[0]
            .reconciler()
            .view()
            .cluster()
            .set(keys::TLS, "enabled")
            .unwrap();
        let d = nodes[0].dispatcher.deliver(EventKind::ConfigChanged).await.unwrap();

        assert!(d.is_deferred());
        assert_eq!(
            nodes[0].reconciler().status(),
            UnitStatus::blocked("TLS must be enabled for Zookeeper and Kafka")
        );
        assert_eq!(nodes[0].reconciler().phase(), NodePhase::Blocked);
    }

    #[tokio::test]
    async fn test_storage_below_minimum_blocks() {
        let fixture = fixture(1);
        let mut node = fixture.node_with(0, |c| c.storage.min_volumes = 2);

        let d = node.dispatcher.deliver(EventKind::Start).await.unwrap();
        assert!(d.is_deferred());
        assert_eq!(
            node.reconciler().status(),
            UnitStatus::blocked("Storage volumes lower than minimum of 2")
        );
        assert!(!node.workload.is_running());
    }

    #[tokio::test]
    async fn test_storage_attached_uses_disable_enable() {
        let fixture = fixture(1);
        let mut nodes = started(&fixture, 1).await;

        fixture.host.set_volumes("kafka/0", 2);
        nodes[0].dispatcher.deliver(EventKind::StorageAttached).await.unwrap();

        assert_eq!(nodes[0].workload.count("disable-enable"), 1);
        assert_eq!(nodes[0].workload.count("restart"), 0);
        assert!(nodes[0]
            .server_properties()
            .await
            .iter()
            .any(|l| l.starts_with("log.dirs=") && l.contains(',')));
    }

    #[tokio::test]
    async fn test_storage_detaching_without_replication() {
        let fixture = fixture(1);
        let mut nodes = started(&fixture, 1).await;

        nodes[0].dispatcher.deliver(EventKind::StorageDetaching).await.unwrap();
        assert_eq!(
            nodes[0].reconciler().status(),
            UnitStatus::blocked(STORAGE_DETACHING_UNREPLICATED_MSG)
        );
    }

    #[tokio::test]
    async fn test_dependency_joined_requests_chroot() {
        let fixture = fixture(2);
        let mut leader = fixture.node(0);
        let mut follower = fixture.node(1);

        follower.dispatcher.deliver(EventKind::DependencyJoined).await.unwrap();
        let relation = leader.reconciler().view().relation(fixture.dependency);
        assert!(relation.local_get("chroot").is_none());

        leader.dispatcher.deliver(EventKind::DependencyJoined).await.unwrap();
        assert_eq!(relation.local_get("chroot").as_deref(), Some("/kafka"));
    }

    #[tokio::test]
    async fn test_dependency_broken_stops_and_blocks() {
        let fixture = fixture(1);
        let mut nodes = started(&fixture, 1).await;

        fixture.host.remove_relation(fixture.dependency);
        nodes[0].dispatcher.deliver(EventKind::DependencyBroken).await.unwrap();

        assert!(!nodes[0].workload.is_running());
        assert_eq!(
            nodes[0].reconciler().status(),
            UnitStatus::blocked("missing required zookeeper relation")
        );
    }

    #[tokio::test]
    async fn test_set_password_rotates_on_leader_only() {
        let fixture = fixture(2);
        let mut nodes = started(&fixture, 2).await;

        let err = nodes[1]
            .dispatcher
            .run_action(&AdminAction::SetPassword {
                username: "sync".to_string(),
                password: Some("new-sync".to_string()),
            })
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Password rotation must be called on leader unit"));

        let output = nodes[0]
            .dispatcher
            .run_action(&AdminAction::SetPassword {
                username: "sync".to_string(),
                password: Some("new-sync".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(output["sync-password"], "new-sync");
        assert_eq!(fixture.backend.password_of("sync").as_deref(), Some("new-sync"));
        assert!(nodes[0]
            .server_properties()
            .await
            .iter()
            .any(|l| l.contains("password=\"new-sync\"")));

        let admin = nodes[0].reconciler().view().cluster().internal_password("admin").unwrap();
        let err = nodes[0]
            .dispatcher
            .run_action(&AdminAction::SetPassword {
                username: "sync".to_string(),
                password: Some(admin),
            })
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Password already exists, please choose a different password."));
    }

    #[tokio::test]
    async fn test_get_admin_credentials() {
        let fixture = fixture(1);
        let mut fresh = fixture.node(0);
        let err = fresh
            .dispatcher
            .run_action(&AdminAction::GetAdminCredentials)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("client.properties file not found on target unit."));

        let mut nodes = started(&fixture, 1).await;
        let output = nodes[0]
            .dispatcher
            .run_action(&AdminAction::GetAdminCredentials)
            .await
            .unwrap();
        assert_eq!(output["username"], "admin");
        assert_eq!(
            Some(output["password"].clone()),
            nodes[0].reconciler().view().cluster().internal_password("admin")
        );
        assert!(output["client-properties"].contains("sasl.mechanism=SCRAM-SHA-512"));
    }

    #[tokio::test]
    async fn test_rolling_restart_unit() {
        let fixture = fixture(1);
        let mut nodes = started(&fixture, 1).await;

        let output = nodes[0]
            .dispatcher
            .run_action(&AdminAction::RollingRestartUnit)
            .await
            .unwrap();
        assert_eq!(output["restart"], "completed");
        assert_eq!(nodes[0].workload.count("restart"), 1);
        assert!(nodes[0].reconciler().status().is_active());
    }

    #[tokio::test]
    async fn test_admin_client_becomes_superuser() {
        let fixture = fixture(2);
        let mut nodes = started(&fixture, 2).await;

        let id = fixture.host.add_relation(RelationKind::Client, "app");
        fixture
            .host
            .update_remote(id, &[("topic", "TOPIC"), ("extra-user-roles", "admin")]);

        nodes[1]
            .dispatcher
            .deliver(EventKind::ClientChanged(id))
            .await
            .unwrap();
        assert_eq!(fixture.backend.calls().add_acls, 0);

        nodes[0]
            .dispatcher
            .deliver(EventKind::ClientChanged(id))
            .await
            .unwrap();
        let expected = format!("super.users=User:sync;User:relation-{}", id);
        assert!(nodes[0].server_properties().await.contains(&expected));
        assert_eq!(nodes[0].workload.count("restart"), 1);

        let published = nodes[0].reconciler().view().relation(id).local();
        assert!(published["endpoints"].contains(":9092"));
        assert_eq!(published["zookeeper-uris"], "1.1.1.1:2181,2.2.2.2:2181/kafka");

        nodes[1].dispatcher.deliver(EventKind::PeerChanged).await.unwrap();
        assert!(nodes[1].server_properties().await.contains(&expected));

        nodes[0]
            .dispatcher
            .deliver(EventKind::ClientBroken(id))
            .await
            .unwrap();
        assert!(nodes[0]
            .server_properties()
            .await
            .contains(&"super.users=User:sync".to_string()));
        assert_eq!(fixture.backend.calls().delete_user, 1);
    }

    #[tokio::test]
    async fn test_report_serializes_without_secrets() {
        let fixture = fixture(1);
        let nodes = started(&fixture, 1).await;

        let report = nodes[0].reconciler().report();
        assert_eq!(report.role, NodeRole::Leader);
        assert_eq!(report.address.as_deref(), Some("10.0.0.0"));

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"phase\":\"ACTIVE\""));
        assert!(!json.contains("mellon"));
    }
}
