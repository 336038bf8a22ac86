//! On-disk workload artifacts

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use broker_core::OperatorConfig;

use crate::error::ClusterResult;

/// Locations of the files the broker service reads
#[derive(Debug, Clone)]
pub struct ConfigFiles {
    config_dir: PathBuf,
    env_file: PathBuf,
}

impl ConfigFiles {
    pub fn new(config_dir: impl AsRef<Path>, env_file: impl AsRef<Path>) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            env_file: env_file.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &OperatorConfig) -> Self {
        Self::new(&config.paths.config_dir, &config.paths.env_file)
    }

    pub fn server_properties_path(&self) -> PathBuf {
        self.config_dir.join("server.properties")
    }

    pub fn client_properties_path(&self) -> PathBuf {
        self.config_dir.join("client.properties")
    }

    pub fn jaas_path(&self) -> PathBuf {
        self.config_dir.join("zookeeper-jaas.cfg")
    }

    /// Non-empty lines of a file, `None` if it does not exist
    pub async fn read_lines(path: &Path) -> ClusterResult<Option<Vec<String>>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).await?;
        Ok(Some(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        ))
    }

    pub async fn write(path: &Path, content: &str) -> ClusterResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        debug!("Wrote {:?} ({} bytes)", path, content.len());
        Ok(())
    }

    async fn write_lines(path: &Path, lines: &[String]) -> ClusterResult<()> {
        let mut content = lines.join("\n");
        content.push('\n');
        Self::write(path, &content).await
    }

    pub async fn server_properties(&self) -> ClusterResult<Option<Vec<String>>> {
        Self::read_lines(&self.server_properties_path()).await
    }

    pub async fn client_properties(&self) -> ClusterResult<Option<Vec<String>>> {
        Self::read_lines(&self.client_properties_path()).await
    }

    pub async fn write_server_properties(&self, lines: &[String]) -> ClusterResult<()> {
        Self::write_lines(&self.server_properties_path(), lines).await
    }

    pub async fn write_client_properties(&self, lines: &[String]) -> ClusterResult<()> {
        Self::write_lines(&self.client_properties_path(), lines).await
    }

    pub async fn write_jaas(&self, content: &str) -> ClusterResult<()> {
        Self::write(&self.jaas_path(), content).await
    }

    /// Set `key=value` in the environment file, keeping every other line
    pub async fn set_env_var(&self, key: &str, value: &str) -> ClusterResult<()> {
        let prefix = format!("{}=", key);
        let mut lines: Vec<String> = Self::read_lines(&self.env_file)
            .await?
            .unwrap_or_default()
            .into_iter()
            .filter(|l| !l.starts_with(&prefix))
            .collect();
        lines.push(format!("{}{}", prefix, value));
        Self::write_lines(&self.env_file, &lines).await
    }
}
