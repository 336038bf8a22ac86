//! Configuration for the broker operator

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Error, Result};

/// Compression codecs accepted by the broker's `compression.type`
const COMPRESSION_TYPES: [&str; 6] = ["gzip", "snappy", "lz4", "zstd", "uncompressed", "producer"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub workload: WorkloadConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OperatorConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_string(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("BROKER_OP_APP_NAME") {
            config.broker.app_name = name;
        }
        if let Ok(dir) = std::env::var("BROKER_OP_CONFIG_DIR") {
            config.paths.config_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("BROKER_OP_DATA_DIR") {
            config.paths.data_dir = PathBuf::from(dir);
        }
        if let Ok(min) = std::env::var("BROKER_OP_MIN_VOLUMES") {
            if let Ok(m) = min.parse() {
                config.storage.min_volumes = m;
            }
        }
        if let Ok(users) = std::env::var("BROKER_OP_SUPER_USERS") {
            config.broker.static_super_users = users
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(level) = std::env::var("BROKER_OP_LOG_LEVEL") {
            config.logging.level = level;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        if self.workload.snap_name.is_empty() {
            return Err(Error::InvalidConfig("workload.snap_name must not be empty".into()));
        }
        Ok(())
    }
}

/// Broker-facing options rendered into `server.properties`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Application name, also the requested dependency chroot
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Principals that are always superusers
    #[serde(default = "default_super_users")]
    pub static_super_users: Vec<String>,
    /// `log.retention.ms`, -1 keeps data forever
    #[serde(default = "default_log_retention_ms")]
    pub log_retention_ms: i64,
    /// `offsets.retention.minutes`
    #[serde(default = "default_offsets_retention_minutes")]
    pub offsets_retention_minutes: u32,
    /// `auto.create.topics.enable`
    #[serde(default)]
    pub auto_create_topics: bool,
    /// `compression.type`
    #[serde(default = "default_compression_type")]
    pub compression_type: String,
}

fn default_app_name() -> String {
    crate::APP_NAME.to_string()
}

fn default_super_users() -> Vec<String> {
    vec![crate::INTER_BROKER_USER.to_string()]
}

fn default_log_retention_ms() -> i64 {
    604_800_000 // 7 days
}

fn default_offsets_retention_minutes() -> u32 {
    10_080
}

fn default_compression_type() -> String {
    "producer".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            static_super_users: default_super_users(),
            log_retention_ms: default_log_retention_ms(),
            offsets_retention_minutes: default_offsets_retention_minutes(),
            auto_create_topics: false,
            compression_type: default_compression_type(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() || self.app_name.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "Invalid app name: {:?}",
                self.app_name
            )));
        }
        if self.log_retention_ms < -1 {
            return Err(Error::InvalidConfig(
                "log_retention_ms must be -1 or a positive duration".into(),
            ));
        }
        if !COMPRESSION_TYPES.contains(&self.compression_type.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "Unsupported compression type: {}",
                self.compression_type
            )));
        }
        Ok(())
    }
}

/// Filesystem locations of the workload's artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `server.properties`, `client.properties` and the JAAS file
    pub config_dir: PathBuf,
    /// Base directory for broker log data, one sub-directory per volume
    pub data_dir: PathBuf,
    /// Environment file the broker service reads `KAFKA_OPTS` from
    pub env_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/var/snap/charmed-kafka/current/etc/kafka"),
            data_dir: PathBuf::from("/var/snap/charmed-kafka/common/var/lib/kafka"),
            env_file: PathBuf::from("/etc/environment"),
        }
    }
}

/// Service-manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Package providing the broker and its admin tools
    pub snap_name: String,
    /// Service within the package running the broker
    pub service: String,
    /// Channel to install from
    pub channel: String,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            snap_name: "charmed-kafka".to_string(),
            service: "daemon".to_string(),
            channel: "latest/edge".to_string(),
        }
    }
}

/// Storage requirements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Minimum attached log-data volumes before the broker may start
    pub min_volumes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { min_volumes: 1 }
    }
}

/// Deferred-event handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Redeliveries after which a still-deferred event is logged as a warning
    pub deferral_warn_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deferral_warn_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
