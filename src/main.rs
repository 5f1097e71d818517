//! Staleguard: operator status liveness watchdog
//!
//! Runs the challenger and staleness checker controllers plus the process
//! heartbeat under one supervisor, and offers a few inspection commands
//! against the embedded store.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use staleguard::clock::{Clock, SystemClock};
use staleguard::events::SledEventLog;
use staleguard::heartbeat::{CommandRecovery, LogOnlyRecovery, RecoveryCallback};
use staleguard::staleness::detect_phase;
use staleguard::store::run_inbox;
use staleguard::{
    Challenger, Controller, HeartbeatWatchdog, SledStatusStore, StaleguardConfig, StalenessChecker,
    StatusInbox, StatusRecord, StatusStore,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "staleguard")]
#[command(about = "Operator status liveness watchdog")]
#[command(version)]
struct CliArgs {
    /// Path to staleguard.toml (overrides STALEGUARD_CONFIG and ./staleguard.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true, env = "STALEGUARD_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the challenger, staleness checker and heartbeat (default)
    Run,

    /// List status records with their liveness phase
    Status,

    /// Show recent staleness events, newest first
    Events {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Create or replace a status record from a JSON file.
    ///
    /// Queued through the inbox when a running daemon holds the store.
    Apply {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Challenger,
    StalenessChecker,
    Heartbeat,
    Inbox,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Challenger => write!(f, "Challenger"),
            TaskName::StalenessChecker => write!(f, "StalenessChecker"),
            TaskName::Heartbeat => write!(f, "Heartbeat"),
            TaskName::Inbox => write!(f, "Inbox"),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

fn open_db(path: &Path) -> Result<sled::Db> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }
    sled::open(path).with_context(|| {
        format!(
            "Failed to open store at {} (is another staleguard process holding it?)",
            path.display()
        )
    })
}

// ============================================================================
// Task Spawning
// ============================================================================

fn spawn_controllers(
    task_set: &mut JoinSet<Result<TaskName>>,
    config: &StaleguardConfig,
    db: &sled::Db,
    cancel_token: CancellationToken,
) -> Result<()> {
    let store: Arc<dyn StatusStore> =
        Arc::new(SledStatusStore::from_db(db).context("Failed to open status records")?);
    let events = Arc::new(
        SledEventLog::from_db(db)
            .context("Failed to open event log")?
            .with_max_events(config.store.max_events),
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let challenger = Arc::new(Challenger::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.challenger_options(),
    ));
    let checker = Arc::new(StalenessChecker::new(
        Arc::clone(&store),
        clock,
        events,
        config.checker_options(),
    ));

    let options = config.controller_options();

    let challenger_controller = Controller::new(challenger, Arc::clone(&store), options);
    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[Challenger] Task starting");
        challenger_controller.run(cancel).await?;
        Ok(TaskName::Challenger)
    });

    let checker_controller = Controller::new(checker, Arc::clone(&store), options);
    let cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[StalenessChecker] Task starting");
        checker_controller.run(cancel).await?;
        Ok(TaskName::StalenessChecker)
    });

    let inbox = StatusInbox::open(&config.store.inbox_dir).context("Failed to open status inbox")?;
    let poll_interval = config.store.inbox_poll_interval();
    task_set.spawn(async move {
        info!("[Inbox] Task starting");
        run_inbox(inbox, store, poll_interval, cancel_token).await;
        Ok(TaskName::Inbox)
    });

    Ok(())
}

fn spawn_heartbeat(
    task_set: &mut JoinSet<Result<TaskName>>,
    config: &StaleguardConfig,
    cancel_token: CancellationToken,
) {
    if !config.heartbeat.enabled {
        info!("Heartbeat disabled");
        return;
    }

    let recovery: Arc<dyn RecoveryCallback> = match &config.heartbeat.recovery_command {
        Some(command) => Arc::new(CommandRecovery::new(command.clone())),
        None => Arc::new(LogOnlyRecovery),
    };
    let watchdog = HeartbeatWatchdog::new(
        config.heartbeat.to_heartbeat_config(),
        Arc::new(SystemClock),
        recovery,
    );

    task_set.spawn(async move {
        info!("[Heartbeat] Task starting");
        watchdog.run(cancel_token).await?;
        Ok(TaskName::Heartbeat)
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: task failed with error: {:#}", e);
                        cancel_token.cancel();
                        drain(task_set).await;
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        drain(task_set).await;
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    drain(task_set).await;
    Ok(())
}

/// Wait for cancelled tasks to wind down
async fn drain(task_set: &mut JoinSet<Result<TaskName>>) {
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("Supervisor: task {} stopped", task_name),
            Ok(Err(e)) => warn!("Supervisor: task failed during shutdown: {:#}", e),
            Err(e) => warn!("Supervisor: task panicked during shutdown: {}", e),
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: &StaleguardConfig) -> Result<()> {
    info!(
        challenge_interval_secs = config.staleness.challenge_interval_secs,
        response_grace_period_secs = config.staleness.response_grace_period_secs,
        protocol = %config.staleness.protocol,
        store = %config.store.path.display(),
        inbox = %config.store.inbox_dir.display(),
        "Starting staleguard"
    );

    let db = open_db(&config.store.path)?;

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    spawn_controllers(&mut task_set, config, &db, cancel_token.clone())?;
    spawn_heartbeat(&mut task_set, config, cancel_token.clone());

    let result = run_supervisor(&mut task_set, cancel_token).await;

    db.flush_async().await.context("Failed to flush store")?;
    info!("Shutdown complete");
    result
}

async fn status(config: &StaleguardConfig) -> Result<()> {
    let db = open_db(&config.store.path)?;
    let store = SledStatusStore::from_db(&db)?;
    let records = store.list().await?;

    if records.is_empty() {
        println!("No status records in {}", config.store.path.display());
        return Ok(());
    }

    for record in records {
        let phase = detect_phase(&record, config.staleness.protocol);
        println!("{}  phase={}  version={}", record.name, phase, record.resource_version);
        for c in &record.conditions {
            println!(
                "    {:<12} {:<8} {:<32} {}",
                c.condition_type.as_str(),
                c.status.to_string(),
                c.reason,
                c.message
            );
        }
    }
    Ok(())
}

fn events(config: &StaleguardConfig, limit: usize) -> Result<()> {
    let db = open_db(&config.store.path)?;
    let log = SledEventLog::from_db(&db)?;

    let recent = log.recent(limit);
    if recent.is_empty() {
        println!("No events recorded");
    }
    for event in recent {
        println!(
            "{}  {:?}  {}  {}: {}",
            event.timestamp.to_rfc3339(),
            event.kind,
            event.target,
            event.reason,
            event.message
        );
    }
    Ok(())
}

async fn apply(config: &StaleguardConfig, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let record: StatusRecord = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid status record in {}", file.display()))?;

    let db = match open_db(&config.store.path) {
        Ok(db) => db,
        Err(e) => {
            // A running daemon holds the store; hand the record to it
            warn!(error = %format!("{e:#}"), "Store unavailable, queueing through the inbox");
            let inbox = StatusInbox::open(&config.store.inbox_dir)?;
            let queued = inbox.submit(&record)?;
            println!("{} queued for the running daemon ({})", record.name, queued.display());
            return Ok(());
        }
    };
    let store = SledStatusStore::from_db(&db)?;
    let written = store.apply(record).await?;
    db.flush_async().await.context("Failed to flush store")?;

    println!("{} applied (version {})", written.name, written.resource_version);
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Config decides the log format, so its own messages go to a temporary
    // plain subscriber.
    let config = tracing::subscriber::with_default(
        tracing_subscriber::fmt().with_target(false).finish(),
        || StaleguardConfig::load(args.config.as_deref()),
    )?;

    init_logging(args.json_logs || config.logging.json);

    match args.command.unwrap_or(SubCommand::Run) {
        SubCommand::Run => run(&config).await,
        SubCommand::Status => status(&config).await,
        SubCommand::Events { limit } => events(&config, limit),
        SubCommand::Apply { file } => apply(&config, &file).await,
    }
}
