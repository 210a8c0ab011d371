//! scrimd-daemon binary.
//!
//! Loads configuration, opens the per-unit state registry, wires the
//! outbox sink / roster source / renderer, then runs one automation
//! loop per unit plus the operator control socket until SIGINT or
//! SIGTERM.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use scrimd_core::config::EventConfig;
use scrimd_core::notify::{MessagingSink, NoticeRenderer, RosterSource};
use scrimd_core::store::SnapshotStore;
use scrimd_core::time::{Clock, SystemClock};
use scrimd_core::unit::UnitId;
use scrimd_daemon::automation::AutomationLoop;
use scrimd_daemon::orchestrator::Orchestrator;
use scrimd_daemon::outbox::OutboxSink;
use scrimd_daemon::protocol::OperatorService;
use scrimd_daemon::render::{CommandRenderer, DisabledRenderer};
use scrimd_daemon::roster::FileRosterSource;
use scrimd_daemon::state::UnitRegistry;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// scrimd daemon - match progression and key distribution
#[derive(Parser, Debug)]
#[command(name = "scrimd-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "scrimd.toml")]
    config: PathBuf,

    /// Override the operator socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = Arc::new(
        EventConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?,
    );
    info!(
        config = %args.config.display(),
        units = config.units.len(),
        start_time = %config.start_time,
        "configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::with_offset_hours(config.utc_offset_hours));
    let store = SnapshotStore::open(&config.daemon.state_dir)
        .with_context(|| format!("opening state dir {}", config.daemon.state_dir.display()))?;

    let unit_ids: Vec<UnitId> = config.units.iter().map(|u| u.id.clone()).collect();
    let registry = UnitRegistry::open(&store, &unit_ids).context("loading unit snapshots")?;

    let sink: Arc<dyn MessagingSink> = Arc::new(
        OutboxSink::open(&config.daemon.outbox_dir)
            .with_context(|| format!("opening outbox dir {}", config.daemon.outbox_dir.display()))?,
    );
    let roster: Arc<dyn RosterSource> = Arc::new(FileRosterSource::new(
        &config.daemon.roster_path,
        Arc::clone(&clock),
    ));
    let renderer: Arc<dyn NoticeRenderer> = match &config.daemon.render_command {
        Some(program) => Arc::new(CommandRenderer::new(
            program,
            Duration::from_secs(config.daemon.call_timeout_secs),
        )),
        None => Arc::new(DisabledRenderer),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut orchestrators = HashMap::new();
    let mut loops = Vec::new();
    for id in &unit_ids {
        let handle = registry
            .get(id)
            .context("unit handle missing from registry")?;
        let orchestrator = Arc::new(Orchestrator::new(
            handle,
            Arc::clone(&config),
            Arc::clone(&clock),
            Arc::clone(&sink),
            Arc::clone(&roster),
            Arc::clone(&renderer),
        ));
        orchestrators.insert(id.clone(), Arc::clone(&orchestrator));

        let automation = AutomationLoop::new(
            orchestrator,
            Duration::from_secs(config.daemon.tick_interval_secs),
            config.daemon.failure_alert_ticks,
        );
        loops.push(tokio::spawn(automation.run(shutdown_rx.clone())));
        info!(unit = %id, "automation loop started");
    }

    let socket_path = args
        .socket
        .unwrap_or_else(|| config.daemon.socket_path.clone());
    // A previous run's socket file blocks the bind.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "operator socket bound");

    let service = Arc::new(OperatorService::new(orchestrators));
    let server = tokio::spawn(service.serve(listener, shutdown_rx));

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received; shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received; shutting down"),
    }

    shutdown_tx.send(true).ok();
    for task in loops {
        if let Err(e) = task.await {
            warn!(error = %e, "automation loop task failed");
        }
    }
    if let Err(e) = server.await {
        warn!(error = %e, "operator server task failed");
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(error = %e, "socket cleanup failed");
    }
    info!("shutdown complete");
    Ok(())
}
