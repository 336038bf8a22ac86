//! Broker service management

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, error, info};

use broker_core::config::WorkloadConfig;

use crate::dependency::DependencyConfig;
use crate::error::{ClusterError, ClusterResult};

/// Install and lifecycle control of the broker process
#[async_trait]
pub trait Workload: Send + Sync {
    async fn install(&self) -> ClusterResult<()>;

    async fn start(&self) -> ClusterResult<()>;

    async fn stop(&self) -> ClusterResult<()>;

    async fn restart(&self) -> ClusterResult<()>;

    /// Disable then enable the service so it picks up new storage mounts
    async fn disable_enable(&self) -> ClusterResult<()>;

    /// Whether the broker registered itself with the dependency
    async fn broker_active(&self, broker_id: u32, dependency: &DependencyConfig) -> bool;
}

/// [`Workload`] backed by a snap package
pub struct SnapWorkload {
    config: WorkloadConfig,
    opts: Vec<String>,
}

impl SnapWorkload {
    /// `opts` become `KAFKA_OPTS` for the dependency shell used in probes
    pub fn new(config: WorkloadConfig, opts: Vec<String>) -> Self {
        Self { config, opts }
    }

    fn service(&self) -> String {
        format!("{}.{}", self.config.snap_name, self.config.service)
    }

    async fn snap(&self, args: &[&str]) -> ClusterResult<String> {
        debug!("Running snap {}", args.join(" "));
        let output = Command::new("snap")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ClusterError::Workload(format!("Failed to run snap: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("snap {} failed: {}", args.join(" "), stderr);
            Err(ClusterError::Workload(stderr))
        }
    }
}

#[async_trait]
impl Workload for SnapWorkload {
    async fn install(&self) -> ClusterResult<()> {
        let channel = format!("--channel={}", self.config.channel);
        self.snap(&["install", &self.config.snap_name, &channel]).await?;
        let plug = format!("{}:removable-media", self.config.snap_name);
        self.snap(&["connect", &plug]).await?;
        info!("Installed {} from {}", self.config.snap_name, self.config.channel);
        Ok(())
    }

    async fn start(&self) -> ClusterResult<()> {
        self.snap(&["start", &self.service()]).await.map(|_| ())
    }

    async fn stop(&self) -> ClusterResult<()> {
        self.snap(&["stop", &self.service()]).await.map(|_| ())
    }

    async fn restart(&self) -> ClusterResult<()> {
        self.snap(&["restart", &self.service()]).await.map(|_| ())
    }

    async fn disable_enable(&self) -> ClusterResult<()> {
        self.snap(&["disable", &self.config.snap_name]).await?;
        self.snap(&["enable", &self.config.snap_name]).await.map(|_| ())
    }

    async fn broker_active(&self, broker_id: u32, dependency: &DependencyConfig) -> bool {
        if !dependency.connected() {
            return false;
        }

        let program = format!("{}.zookeeper-shell", self.config.snap_name);
        let output = Command::new(&program)
            .args([dependency.connect.as_str(), "ls", "/brokers/ids"])
            .env("KAFKA_OPTS", self.opts.join(" "))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                registered_brokers(&String::from_utf8_lossy(&out.stdout)).contains(&broker_id)
            }
            Ok(out) => {
                debug!("{} exited with {}", program, out.status);
                false
            }
            Err(e) => {
                debug!("Failed to run {}: {}", program, e);
                false
            }
        }
    }
}

/// Broker ids from the `[0, 1, 2]` line printed by `ls /brokers/ids`
fn registered_brokers(output: &str) -> Vec<u32> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('[') && l.ends_with(']'))
        .map(|l| {
            l.trim_matches(|c| c == '[' || c == ']')
                .split(',')
                .filter_map(|id| id.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// [`Workload`] that only records what it was asked to do
#[derive(Debug, Default)]
pub struct MemoryWorkload {
    calls: Mutex<Vec<&'static str>>,
    running: AtomicBool,
    fail_install: AtomicBool,
    fail_start: AtomicBool,
    fail_restart: AtomicBool,
    inactive: AtomicBool,
}

impl MemoryWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn fail_install(&self, fail: bool) {
        self.fail_install.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    /// Whether the liveness probe reports the broker as registered
    pub fn set_active(&self, active: bool) {
        self.inactive.store(!active, Ordering::SeqCst);
    }

    fn record(&self, call: &'static str, fail: &AtomicBool) -> ClusterResult<()> {
        self.calls.lock().push(call);
        if fail.load(Ordering::SeqCst) {
            return Err(ClusterError::Workload(format!("{} failed", call)));
        }
        Ok(())
    }
}

#[async_trait]
impl Workload for MemoryWorkload {
    async fn install(&self) -> ClusterResult<()> {
        self.record("install", &self.fail_install)
    }

    async fn start(&self) -> ClusterResult<()> {
        self.record("start", &self.fail_start)?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        self.calls.lock().push("stop");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> ClusterResult<()> {
        self.record("restart", &self.fail_restart)?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_enable(&self) -> ClusterResult<()> {
        self.record("disable-enable", &self.fail_restart)?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn broker_active(&self, _broker_id: u32, dependency: &DependencyConfig) -> bool {
        dependency.connected() && self.is_running() && !self.inactive.load(Ordering::SeqCst)
    }
}
