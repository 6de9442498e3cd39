//! Command-line interface for hubsync.

mod config;
mod simulator;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubsync_core::config::env_vars;
use hubsync_core::{FeedItem, SharedFeed};
use hubsync_reconcile::{
    CommandDispatcher, DesiredSnapshot, DesiredStateStore, FileSource, ReconciliationEngine,
    RuleRegistry,
};
use hubsync_stream::{MemoryHub, StreamMultiplexer};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HubSyncConfig;

/// hubsync - Keep devices in line with their desired state.
#[derive(Parser, Debug)]
#[command(name = "hubsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to ./hubsync.toml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest telemetry and reconcile devices until interrupted.
    Run {
        /// Attach simulated huzzah, rpi2 and edison boards.
        #[arg(long)]
        simulate: bool,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        exit_after: Option<u64>,
    },
    /// Validate a desired-state document and print it.
    Check {
        /// Path to the document.
        #[arg(required = true)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run {
            simulate,
            exit_after,
        } => {
            let config = HubSyncConfig::load(args.config.as_deref())?;
            run(config, simulate, exit_after.map(Duration::from_secs)).await
        }
        Command::Check { path } => check(&path),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    // JSON output for container environments
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("warn,hubsync={}", level)));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

/// Startup sequence. Only connection failures abort it; everything after
/// that is logged and absorbed.
async fn run(config: HubSyncConfig, simulate: bool, exit_after: Option<Duration>) -> Result<()> {
    let connection = config
        .connection()
        .context("cannot connect without a valid connection string")?;
    info!(
        category = "config",
        hub = %connection.hub_name(),
        key_name = %connection.shared_access_key_name,
        "Using hub {}",
        connection.host_name
    );

    let hub = MemoryHub::with_retention(
        config.simulator.partitions,
        config.event_path.clone(),
        config.simulator.retention,
    );
    let dispatcher = CommandDispatcher::new(Arc::new(hub.clone()));
    dispatcher
        .open()
        .await
        .context("failed to open the device-management channel")?;

    let store = Arc::new(DesiredStateStore::with_defaults());
    let desired = config.desired_state();
    let mut tasks: Vec<JoinHandle<()>> = vec![store.spawn_refresh_loop(
        Arc::new(FileSource::new(desired.path.clone())),
        desired.refresh_interval(),
    )];

    let registry = Arc::new(RuleRegistry::builtin());
    registry.register_configured(config.devices.clone());

    let mux = StreamMultiplexer::bind(Arc::new(hub.clone()), config.multiplexer_config())
        .await
        .context("failed to bind event stream partitions")?;

    let engine = Arc::new(ReconciliationEngine::new(store, registry, dispatcher.clone()));
    let feed = mux.feed();
    tasks.extend(engine.spawn_observers(&feed));
    tasks.push(spawn_fault_logger(&feed));
    mux.connect();

    if simulate {
        tasks.extend(simulator::spawn_all(&hub, config.simulator.publish_interval()));
    } else {
        warn!(
            category = "config",
            "No simulated devices attached; pass --simulate to generate telemetry"
        );
    }

    info!(
        category = "stream",
        partitions = mux.partitions().len(),
        devices = ?engine.registry().list(),
        "Reconciliation running"
    );

    wait_for_shutdown(exit_after).await;

    for task in tasks {
        task.abort();
    }
    mux.shutdown();

    let stats = dispatcher.stats();
    info!(
        category = "dispatch",
        sent = stats.commands_sent,
        succeeded = stats.commands_succeeded,
        failed = stats.commands_failed,
        "Stopped"
    );
    Ok(())
}

async fn wait_for_shutdown(exit_after: Option<Duration>) {
    let deadline = async {
        match exit_after {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(category = "config", error = %err, "Failed to listen for Ctrl-C");
            }
            info!(category = "config", "Shutting down");
        }
        _ = deadline => {
            info!(category = "config", "Run time elapsed, shutting down");
        }
    }
}

/// Log partition faults surfaced on the feed.
fn spawn_fault_logger(feed: &SharedFeed) -> JoinHandle<()> {
    let mut faults = feed.feed().faults();
    tokio::spawn(async move {
        while let Some(item) = faults.recv().await {
            if let FeedItem::Fault(fault) = item {
                error!(
                    category = "stream",
                    partition = %fault.partition_id,
                    error = %fault.error,
                    "Partition receiver failed"
                );
            }
        }
    })
}

fn check(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let snapshot = DesiredSnapshot::parse(&text)
        .with_context(|| format!("invalid desired-state document {}", path.display()))?;

    println!("{}: {} device(s)", path.display(), snapshot.len());
    println!("{}", serde_json::to_string_pretty(&snapshot.to_json())?);
    Ok(())
}
