//! edged — the EdgeGrid manager daemon.
//!
//! Single binary that wires the decision engine to live infrastructure:
//! - State store (redb)
//! - Executor with shell, AWS CLI and Docker CLI backends
//! - Host monitor and service monitor loops
//!
//! # Usage
//!
//! ```text
//! edged run --config /etc/edgegrid/edged.toml
//! edged inventory --config /etc/edgegrid/edged.toml
//! edged check-rules /etc/edgegrid/rules.toml
//! ```

mod actions;
mod bootstrap;
mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use edgegrid_autoscale::{HostMonitor, MetricSource, ServiceMonitor};
use edgegrid_executor::{
    AwsCliProvider, Backends, CloudProvider, CommandHostProbe, CommandRunner, DockerCliRuntime, DockerCliSwarm,
    ExecContext, Executor, Inventory, ShellCommandRunner,
};
use edgegrid_metrics::MetricTracker;
use edgegrid_rules::{FileRuleStore, Rule, RuleStore};
use edgegrid_state::{EntityKind, NodeRole, StateStore};

use crate::actions::{CommandMetricSource, ExecutorActions};
use crate::bootstrap::NoCloud;
use crate::config::EdgedConfig;

#[derive(Parser)]
#[command(name = "edged", about = "EdgeGrid manager daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join the manager host and run the host and service monitors.
    Run {
        #[arg(long, default_value = "/etc/edgegrid/edged.toml")]
        config: PathBuf,
    },
    /// Print the current inventory as JSON.
    Inventory {
        #[arg(long, default_value = "/etc/edgegrid/edged.toml")]
        config: PathBuf,
    },
    /// Parse and validate a rules file.
    CheckRules {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Inventory { config } => inventory(&config),
        Command::CheckRules { path } => check_rules(&path),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,edged=debug,edgegrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<EdgedConfig> {
    EdgedConfig::from_file(path).with_context(|| format!("reading config {}", path.display()))
}

fn open_state(config: &EdgedConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.manager.data_dir)?;
    let db_path = config.state_path();
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(state)
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    info!(manager = %config.manager.address, region = ?config.manager.region, "EdgeGrid manager starting");

    // ── Initialize subsystems ──────────────────────────────────

    let state = open_state(&config)?;
    bootstrap::register(&state, &config)?;

    let rules = FileRuleStore::new(&config.rules.path);
    let loaded = rules
        .load()
        .with_context(|| format!("loading rules {}", config.rules.path.display()))?;
    info!(count = loaded.len(), path = ?config.rules.path, "rules loaded");
    let rules: Arc<dyn RuleStore> = Arc::new(rules);

    let context = ExecContext::new(config.manager.address.clone());
    let runner: Arc<dyn CommandRunner> = Arc::new(
        ShellCommandRunner::new(context.clone(), config.ssh.user.clone())
            .with_identity_file(config.ssh.identity_file.clone()),
    );
    let cloud: Arc<dyn CloudProvider> = if config.cloud.enabled {
        Arc::new(AwsCliProvider::new(runner.clone(), context.clone(), config.aws_launch_config()))
    } else {
        info!("cloud provisioning disabled");
        Arc::new(NoCloud)
    };
    let backends = Backends {
        runner: runner.clone(),
        cloud,
        swarm: Arc::new(DockerCliSwarm::new(runner.clone(), context.clone())),
        runtime: Arc::new(DockerCliRuntime::new(runner.clone())),
        probe: Arc::new(CommandHostProbe::new(runner.clone())),
    };
    let executor = Arc::new(Executor::new(
        state.clone(),
        context,
        backends,
        config.executor_settings(),
    ));
    info!("executor initialized");

    let manager = executor
        .join_host(&config.manager.address, NodeRole::Manager)
        .await
        .context("joining the manager host")?;
    info!(host = %manager.address, "manager host joined");

    let tracker = MetricTracker::new(state.clone()).with_monitoring_log(config.manager.test_log);
    let metrics: Arc<dyn MetricSource> = Arc::new(CommandMetricSource::new(runner));
    let actions = Arc::new(ExecutorActions::new(executor.clone()));

    let mut host_monitor = HostMonitor::new(
        state.clone(),
        tracker.clone(),
        rules.clone(),
        metrics.clone(),
        actions.clone(),
        config.host_monitor_settings(),
    );
    let mut service_monitor = ServiceMonitor::new(
        state,
        tracker,
        rules,
        metrics,
        actions,
        config.service_monitor_settings(),
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let host_shutdown = shutdown_rx.clone();
    let service_shutdown = shutdown_rx;

    // ── Start background tasks ─────────────────────────────────

    let host_interval = Duration::from_secs(config.hosts.monitor_interval_secs);
    let host_handle = tokio::spawn(async move {
        host_monitor.run(host_interval, host_shutdown).await;
    });

    let service_interval = Duration::from_secs(config.services.monitor_interval_secs);
    let service_handle = tokio::spawn(async move {
        service_monitor.run(service_interval, service_shutdown).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Wait for background tasks.
    let _ = host_handle.await;
    let _ = service_handle.await;
    executor.shutdown().await;

    info!("EdgeGrid manager stopped");
    Ok(())
}

fn inventory(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let state = StateStore::open(&config.state_path())?;
    let snapshot = Inventory::load(&state)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn check_rules(path: &Path) -> anyhow::Result<()> {
    let rules = FileRuleStore::new(path)
        .load()
        .with_context(|| format!("invalid rules file {}", path.display()))?;
    let count = |kind: EntityKind| rules.iter().filter(|r: &&Rule| r.kind == kind).count();
    println!(
        "{}: {} rules ({} host, {} service, {} disabled)",
        path.display(),
        rules.len(),
        count(EntityKind::Host),
        count(EntityKind::Service),
        rules.iter().filter(|r| !r.enabled).count(),
    );
    Ok(())
}
