//! Broker Operator - lifecycle management for a multi-node broker cluster
//!
//! Each invocation acts as one node: it loads the host snapshot, delivers a
//! single trigger or administrative action, prints the result as JSON and
//! persists the snapshot together with any deferred triggers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use broker_auth::{AuthBackend, KafkaToolsBackend, MemoryBackend, ToolsConfig};
use broker_cluster::{
    extra_args, AdminAction, DeferredEvent, Dispatcher, Disposition, EventKind, MemoryWorkload,
    Reconciler, SnapWorkload, Workload,
};
use broker_core::types::RelationId;
use broker_core::OperatorConfig;
use broker_state::{MemoryHost, StateStore, StateView, Topology};

#[derive(Parser)]
#[command(name = "broker-operator")]
#[command(version = broker_core::VERSION)]
#[command(about = "Lifecycle operator for a multi-node broker cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, env = "BROKER_OP_CONFIG")]
    config: Option<String>,

    /// Host snapshot shared by every node
    #[arg(long, global = true, env = "BROKER_OP_STATE_FILE", default_value = "broker-state.json")]
    state_file: PathBuf,

    /// Node to act as, `<app>/<ordinal>`
    #[arg(long, global = true, env = "BROKER_OP_NODE", default_value = "kafka/0")]
    node: String,

    /// Address this node publishes to its peers
    #[arg(long, global = true, env = "BROKER_OP_ADDRESS")]
    address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "BROKER_OP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Use the in-memory workload and backend instead of snap and the admin tools
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Deliver a trigger, e.g. `start` or `client-changed --relation-id 3`
    Dispatch {
        event: String,

        #[arg(long)]
        relation_id: Option<RelationId>,
    },

    /// Rotate an internal user's password
    SetPassword {
        #[arg(long, default_value = broker_core::INTER_BROKER_USER)]
        username: String,

        /// New password, generated when omitted
        #[arg(long)]
        password: Option<String>,
    },

    /// Print the admin user's credentials and client properties
    GetAdminCredentials,

    /// Queue a restart of this node behind the rolling restart lock
    RollingRestartUnit,

    /// Show this node's phase, status and the restart queue
    Status,

    /// Show version information
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::from_env(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    init_logging(&config);

    if let Commands::Version = cli.command {
        println!("broker-operator {}", broker_core::VERSION);
        return Ok(());
    }

    run(cli, config).await
}

fn init_logging(config: &OperatorConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Output goes to stdout; logs stay on stderr
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

/// Sidecar file holding deferred triggers next to the host snapshot
fn deferred_path(state_file: &Path) -> PathBuf {
    let stem = state_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "broker-state".to_string());
    state_file.with_file_name(format!("{}.deferred.json", stem))
}

fn load_deferred(path: &Path) -> anyhow::Result<Vec<DeferredEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&content)?)
}

fn save_deferred(path: &Path, deferred: &[DeferredEvent]) -> anyhow::Result<()> {
    if deferred.is_empty() {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        return Ok(());
    }
    std::fs::write(path, serde_json::to_string_pretty(deferred)?)?;
    Ok(())
}

fn build_dispatcher(
    cli: &Cli,
    config: OperatorConfig,
    host: &Arc<MemoryHost>,
    deferred: Vec<DeferredEvent>,
) -> Dispatcher {
    let view = StateView::new(
        cli.node.as_str(),
        Arc::clone(host) as Arc<dyn StateStore>,
        Arc::clone(host) as Arc<dyn Topology>,
        host.leadership_for(cli.node.as_str()),
    );

    let (workload, backend): (Arc<dyn Workload>, Arc<dyn AuthBackend>) = if cli.dry_run {
        info!("Dry run: using in-memory workload and backend");
        (Arc::new(MemoryWorkload::new()), Arc::new(MemoryBackend::new()))
    } else {
        let opts = extra_args(&config);
        let tools = ToolsConfig {
            bin_prefix: config.workload.snap_name.clone(),
            config_dir: config.paths.config_dir.clone(),
            opts: opts.clone(),
        };
        (
            Arc::new(SnapWorkload::new(config.workload.clone(), opts)),
            Arc::new(KafkaToolsBackend::new(tools)),
        )
    };

    let threshold = config.dispatch.deferral_warn_threshold;
    let mut reconciler = Reconciler::new(Arc::new(config), view, workload, backend);
    if let Some(address) = &cli.address {
        reconciler = reconciler.with_address(address.clone());
    }

    Dispatcher::new(reconciler, threshold).with_deferred(deferred)
}

async fn run(cli: Cli, config: OperatorConfig) -> anyhow::Result<()> {
    let host = Arc::new(
        MemoryHost::load(&cli.state_file)
            .with_context(|| format!("Failed to load {}", cli.state_file.display()))?,
    );
    let sidecar = deferred_path(&cli.state_file);
    let deferred = load_deferred(&sidecar)?;
    debug!("{} deferred triggers pending", deferred.len());

    let mut dispatcher = build_dispatcher(&cli, config, &host, deferred);

    let result = execute(&cli.command, &mut dispatcher).await;

    // Persist even when the command failed; earlier writes stay valid
    host.save(&cli.state_file)?;
    save_deferred(&sidecar, &dispatcher.deferred())?;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn execute(
    command: &Commands,
    dispatcher: &mut Dispatcher,
) -> anyhow::Result<serde_json::Value> {
    let output = match command {
        Commands::Dispatch { event, relation_id } => {
            let event = EventKind::parse(event, *relation_id)?;
            let name = event.to_string();
            let disposition = dispatcher.deliver(event).await?;
            let (outcome, reason) = match disposition {
                Disposition::Handled => ("handled", None),
                Disposition::Deferred(reason) => ("deferred", Some(reason)),
            };
            json!({
                "event": name,
                "disposition": outcome,
                "reason": reason,
                "status": dispatcher.reconciler().status(),
                "deferred": dispatcher.deferred().len(),
            })
        }
        Commands::SetPassword { username, password } => {
            let action = AdminAction::SetPassword {
                username: username.clone(),
                password: password.clone(),
            };
            serde_json::to_value(dispatcher.run_action(&action).await?)?
        }
        Commands::GetAdminCredentials => {
            serde_json::to_value(dispatcher.run_action(&AdminAction::GetAdminCredentials).await?)?
        }
        Commands::RollingRestartUnit => {
            serde_json::to_value(dispatcher.run_action(&AdminAction::RollingRestartUnit).await?)?
        }
        Commands::Status => serde_json::to_value(dispatcher.reconciler().report())?,
        Commands::Version => json!({ "version": broker_core::VERSION }),
    };
    Ok(output)
}
