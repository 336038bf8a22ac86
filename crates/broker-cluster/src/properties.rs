//! Broker, client and JAAS artifact construction
//!
//! Everything here is a pure function of [`BrokerInputs`], so two nodes that
//! observe the same shared state render identical lines (apart from their
//! own id and address).

use broker_auth::{format_superusers, superusers};
use broker_core::types::{node_ordinal, TlsState};
use broker_core::{
    OperatorConfig, ADMIN_USER, CLIENT_PORT, CLIENT_TLS_PORT, INTERNAL_PORT, INTER_BROKER_USER,
};
use broker_state::StateView;

use crate::dependency::DependencyConfig;
use crate::error::ClusterResult;

const SCRAM_MECHANISM: &str = "SCRAM-SHA-512";
const SCRAM_LOGIN_MODULE: &str = "org.apache.kafka.common.security.scram.ScramLoginModule";
const INTERNAL_LISTENER: &str = "INTERNAL_SASL_PLAINTEXT";

/// Everything the broker configuration depends on, read once per pass
#[derive(Debug, Clone, Default)]
pub struct BrokerInputs {
    pub broker_id: u32,
    /// This node's published address
    pub address: Option<String>,
    /// Published addresses of every peer, this node included, in peer order
    pub peer_addresses: Vec<String>,
    /// Size of the node-group, at least 1
    pub peer_count: usize,
    /// Attached log-data volumes
    pub volumes: usize,
    pub dependency: DependencyConfig,
    /// Cluster-side TLS flag
    pub tls: TlsState,
    pub sync_password: Option<String>,
    pub admin_password: Option<String>,
    /// Rendered `super.users` value
    pub superusers: String,
}

impl BrokerInputs {
    pub fn gather(
        view: &StateView,
        config: &OperatorConfig,
        dependency: DependencyConfig,
    ) -> ClusterResult<Self> {
        let cluster = view.cluster();
        let peers = view.peers().unwrap_or_default();

        let superusers = cluster.superusers().unwrap_or_else(|| {
            format_superusers(&superusers(
                &config.broker.static_super_users,
                &cluster.grants(),
            ))
        });

        Ok(Self {
            broker_id: node_ordinal(view.node_id())?,
            address: view.unit().address(),
            peer_addresses: view.peer_addresses().into_iter().map(|(_, a)| a).collect(),
            peer_count: peers.len().max(1),
            volumes: view.topology().attached_volumes(view.node_id()),
            dependency,
            tls: cluster.tls(),
            sync_password: cluster.internal_password(INTER_BROKER_USER),
            admin_password: cluster.internal_password(ADMIN_USER),
            superusers,
        })
    }
}

/// Renders the broker's artifacts from [`BrokerInputs`]
pub struct PropertiesBuilder<'a> {
    config: &'a OperatorConfig,
    inputs: &'a BrokerInputs,
}

impl<'a> PropertiesBuilder<'a> {
    pub fn new(config: &'a OperatorConfig, inputs: &'a BrokerInputs) -> Self {
        Self { config, inputs }
    }

    pub fn replication_factor(&self) -> usize {
        self.inputs.peer_count.clamp(1, 3)
    }

    pub fn min_insync_replicas(&self) -> usize {
        self.replication_factor().saturating_sub(1).max(1)
    }

    pub fn client_port(&self) -> u16 {
        if self.inputs.tls.is_enabled() {
            CLIENT_TLS_PORT
        } else {
            CLIENT_PORT
        }
    }

    fn client_listener(&self) -> &'static str {
        if self.inputs.tls.is_enabled() {
            "CLIENT_SASL_SSL"
        } else {
            "CLIENT_SASL_PLAINTEXT"
        }
    }

    fn client_protocol(&self) -> &'static str {
        if self.inputs.tls.is_enabled() {
            "SASL_SSL"
        } else {
            "SASL_PLAINTEXT"
        }
    }

    pub fn replication_properties(&self) -> Vec<String> {
        let rf = self.replication_factor();
        let min_isr = self.min_insync_replicas();
        vec![
            format!("default.replication.factor={}", rf),
            format!("num.partitions={}", rf),
            format!("transaction.state.log.replication.factor={}", rf),
            format!("offsets.topic.replication.factor={}", rf),
            format!("min.insync.replicas={}", min_isr),
            format!("transaction.state.log.min.isr={}", min_isr),
        ]
    }

    pub fn auth_properties(&self) -> Vec<String> {
        vec![
            format!("broker.id={}", self.inputs.broker_id),
            format!("zookeeper.connect={}", self.inputs.dependency.connect),
        ]
    }

    pub fn listener_properties(&self) -> Vec<String> {
        let host = self.inputs.address.as_deref().unwrap_or_default();
        let client = self.client_listener();
        let port = self.client_port();
        vec![
            format!(
                "listener.security.protocol.map={}:SASL_PLAINTEXT,{}:{}",
                INTERNAL_LISTENER,
                client,
                self.client_protocol()
            ),
            format!("listeners={}://:{},{}://:{}", INTERNAL_LISTENER, INTERNAL_PORT, client, port),
            format!(
                "advertised.listeners={}://{}:{},{}://{}:{}",
                INTERNAL_LISTENER, host, INTERNAL_PORT, client, host, port
            ),
            format!("inter.broker.listener.name={}", INTERNAL_LISTENER),
        ]
    }

    pub fn scram_properties(&self) -> Vec<String> {
        vec![
            format!("sasl.enabled.mechanisms={}", SCRAM_MECHANISM),
            format!("sasl.mechanism.inter.broker.protocol={}", SCRAM_MECHANISM),
            format!(
                "listener.name.{}.{}.sasl.jaas.config={}",
                INTERNAL_LISTENER.to_lowercase(),
                SCRAM_MECHANISM.to_lowercase(),
                scram_jaas(INTER_BROKER_USER, self.inputs.sync_password.as_deref())
            ),
            "authorizer.class.name=kafka.security.authorizer.AclAuthorizer".to_string(),
            "allow.everyone.if.no.acl.found=false".to_string(),
            format!("super.users={}", self.inputs.superusers),
        ]
    }

    /// One directory per attached volume under the data dir
    pub fn log_dirs(&self) -> String {
        let base = &self.config.paths.data_dir;
        if self.inputs.volumes <= 1 {
            return base.display().to_string();
        }
        (0..self.inputs.volumes)
            .map(|i| base.join(i.to_string()).display().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn option_properties(&self) -> Vec<String> {
        let broker = &self.config.broker;
        vec![
            format!("log.dirs={}", self.log_dirs()),
            format!("log.retention.ms={}", broker.log_retention_ms),
            format!("offsets.retention.minutes={}", broker.offsets_retention_minutes),
            format!("auto.create.topics.enable={}", broker.auto_create_topics),
            format!("compression.type={}", broker.compression_type),
        ]
    }

    /// Server-side TLS, for the client listener and the dependency connection
    pub fn server_tls_properties(&self) -> Vec<String> {
        let dir = self.config.paths.config_dir.display();
        let mut props = Vec::new();
        if self.inputs.tls.is_enabled() {
            props.push(format!("ssl.keystore.location={}/keystore.p12", dir));
            props.push("ssl.keystore.type=PKCS12".to_string());
            props.push(format!("ssl.truststore.location={}/truststore.jks", dir));
            props.push("ssl.client.auth=none".to_string());
        }
        if self.inputs.dependency.tls.is_enabled() {
            props.push("zookeeper.ssl.client.enable=true".to_string());
            props.push(
                "zookeeper.clientCnxnSocket=org.apache.zookeeper.ClientCnxnSocketNetty".to_string(),
            );
            props.push(format!("zookeeper.ssl.truststore.location={}/truststore.jks", dir));
        }
        props
    }

    /// Full `server.properties` content
    pub fn server_properties(&self) -> Vec<String> {
        let mut props = self.auth_properties();
        props.extend(self.listener_properties());
        props.extend(self.scram_properties());
        props.extend(self.replication_properties());
        props.extend(self.option_properties());
        props.extend(self.server_tls_properties());
        props
    }

    /// `host:port` for every peer that published an address
    pub fn bootstrap_servers(&self) -> Vec<String> {
        let port = self.client_port();
        self.inputs
            .peer_addresses
            .iter()
            .map(|address| format!("{}:{}", address, port))
            .collect()
    }

    /// Client-side TLS settings, also the lines hidden from admin credentials
    pub fn tls_properties(&self) -> Vec<String> {
        if !self.inputs.tls.is_enabled() {
            return Vec::new();
        }
        vec![
            "security.protocol=SASL_SSL".to_string(),
            format!(
                "ssl.truststore.location={}/truststore.jks",
                self.config.paths.config_dir.display()
            ),
            "ssl.truststore.type=JKS".to_string(),
        ]
    }

    /// Full `client.properties` content, authenticating as the admin user
    pub fn client_properties(&self) -> Vec<String> {
        let mut props = vec![
            format!(
                "sasl.jaas.config={}",
                scram_jaas(ADMIN_USER, self.inputs.admin_password.as_deref())
            ),
            format!("sasl.mechanism={}", SCRAM_MECHANISM),
            format!("bootstrap.servers={}", self.bootstrap_servers().join(",")),
        ];
        if self.inputs.tls.is_enabled() {
            props.extend(self.tls_properties());
        } else {
            props.push("security.protocol=SASL_PLAINTEXT".to_string());
        }
        props
    }

    /// JAAS file the broker uses to authenticate against the dependency
    pub fn jaas_config(&self) -> String {
        format!(
            "Client {{\n    org.apache.zookeeper.server.auth.DigestLoginModule required\n    username=\"{}\"\n    password=\"{}\";\n}};\n",
            self.inputs.dependency.username, self.inputs.dependency.password
        )
    }

    /// JVM options for the broker and its admin tools
    pub fn extra_args(&self) -> Vec<String> {
        extra_args(self.config)
    }

    /// Value of `KAFKA_OPTS`
    pub fn kafka_opts(&self) -> String {
        self.extra_args().join(" ")
    }
}

/// JVM options pointing at the JAAS file; depends on configuration only
pub fn extra_args(config: &OperatorConfig) -> Vec<String> {
    vec![format!(
        "-Djava.security.auth.login.config={}",
        config.paths.config_dir.join("zookeeper-jaas.cfg").display()
    )]
}

fn scram_jaas(username: &str, password: Option<&str>) -> String {
    format!(
        "{} required username=\"{}\" password=\"{}\";",
        SCRAM_LOGIN_MODULE,
        username,
        password.unwrap_or_default()
    )
}
