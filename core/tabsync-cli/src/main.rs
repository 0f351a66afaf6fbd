//! tabsync: operator CLI for a file-backed session store.
//!
//! ## Subcommands
//!
//! - `inspect`: Print the stored session as JSON
//! - `expire`: Clear the stored session through the lock protocol (`--force`
//!   bypasses it to recover an abandoned lock)
//! - `watch`: Host one product and drive it from stdin commands

mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use tabsync_core::config::{default_config_path, load_config};
use tabsync_core::operations::ProcessorSettings;
use tabsync_core::{
    decision, ActivityKind, Clock, OperationProcessor, Processed, SessionConfig, SessionHost,
    SessionManager, SessionOperation, SessionState, SessionStorage, StorageConfig, SystemClock,
    TimeStamp, Visibility,
};

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(about = "Inspect and drive a shared tabsync session store")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.tabsync/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stored session as JSON
    Inspect {
        /// Session file overriding the configured storage
        #[arg(long, value_name = "PATH")]
        store: Option<PathBuf>,
    },

    /// Clear the stored session for every product
    Expire {
        #[arg(long, value_name = "PATH")]
        store: Option<PathBuf>,

        /// Clear without taking the lock (recovers a lock left by a killed writer)
        #[arg(long)]
        force: bool,
    },

    /// Run a session manager and read commands from stdin
    /// (click|touch|key|scroll|visible|hidden|expire|status|quit)
    Watch {
        /// Product key the manager owns in the shared blob
        #[arg(long)]
        product: String,

        /// Percentage of new sessions to track
        #[arg(long, default_value_t = 100.0)]
        sample_rate: f64,

        #[arg(long, value_name = "PATH")]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let result = match resolve_config(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Inspect { store } => inspect(with_store(config, store)),
            Commands::Expire { store, force } => expire(with_store(config, store), force).await,
            Commands::Watch {
                product,
                sample_rate,
                store,
            } => watch(with_store(config, store), product, sample_rate).await,
        },
        Err(err) => Err(err),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "tabsync failed");
        std::process::exit(1);
    }
}

fn resolve_config(path: Option<&Path>) -> Result<SessionConfig, String> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };
    Ok(load_config(&path)?)
}

fn with_store(mut config: SessionConfig, store: Option<PathBuf>) -> SessionConfig {
    if let Some(path) = store {
        config.storage = StorageConfig::File { path: Some(path) };
    }
    config
}

// ─────────────────────────────────────────────────────────────────────────────
// inspect
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SessionReport {
    active: bool,
    /// A lock at rest means a writer died inside its critical section; every
    /// locked operation will be dropped until `expire --force` clears it.
    locked: bool,
    id: Option<String>,
    created: Option<String>,
    expire: Option<String>,
    entries: std::collections::BTreeMap<String, String>,
}

fn rfc3339(ms: Option<TimeStamp>) -> Option<String> {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|time| time.to_rfc3339())
}

fn session_report(
    session: &SessionState,
    now: TimeStamp,
    time_out_delay: Duration,
) -> SessionReport {
    SessionReport {
        active: !session.is_cleared() && session.is_active(now, time_out_delay),
        locked: session.lock().is_some(),
        id: session.id().map(str::to_string),
        created: rfc3339(session.created()),
        expire: rfc3339(session.expire()),
        entries: session
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    }
}

fn inspect(config: SessionConfig) -> Result<(), String> {
    let storage = SessionStorage::new(config.storage.build()?);
    let session = storage.retrieve_session();
    let report = session_report(&session, SystemClock.now(), config.time_out_delay);
    if report.locked {
        tracing::warn!("Session lock is held; run `tabsync expire --force` if no writer is alive");
    }

    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| format!("Failed to serialize session: {}", e))?;
    println!("{}", json);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// expire
// ─────────────────────────────────────────────────────────────────────────────

async fn expire(config: SessionConfig, force: bool) -> Result<(), String> {
    let storage = SessionStorage::new(config.storage.build()?);
    if force {
        force_clear(&storage);
        println!("Session cleared (forced)");
        return Ok(());
    }

    let (processor, _worker) = OperationProcessor::spawn(
        storage,
        ProcessorSettings::from(&config),
        Arc::new(SystemClock),
    );

    processor
        .run(SessionOperation::new(|_| Processed::Clear))
        .await
        .ok_or_else(|| {
            "Session is locked by another writer; nothing cleared (use --force if it is stale)"
                .to_string()
        })?;
    println!("Session cleared");
    Ok(())
}

/// Clears the blob without the lock protocol. Races with live writers.
fn force_clear(storage: &SessionStorage) {
    let session = storage.retrieve_session();
    if let Some(lock) = session.lock() {
        tracing::warn!(lock, "Clearing session with a lock at rest");
    }
    storage.clear_session();
}

// ─────────────────────────────────────────────────────────────────────────────
// watch
// ─────────────────────────────────────────────────────────────────────────────

enum Command {
    Activity(ActivityKind),
    Visibility(Visibility),
    Expire,
    Status,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "click" => Some(Command::Activity(ActivityKind::Click)),
        "touch" => Some(Command::Activity(ActivityKind::TouchStart)),
        "key" => Some(Command::Activity(ActivityKind::KeyDown)),
        "scroll" => Some(Command::Activity(ActivityKind::Scroll)),
        "visible" => Some(Command::Visibility(Visibility::Visible)),
        "hidden" => Some(Command::Visibility(Visibility::Hidden)),
        "expire" => Some(Command::Expire),
        "status" => Some(Command::Status),
        "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

fn print_status(manager: &SessionManager) {
    match manager.find_active_session(None) {
        Some(context) => println!(
            "[{}] active id={} tracking={}",
            manager.product_key(),
            context.id.as_deref().unwrap_or("-"),
            context.tracking_type.as_deref().unwrap_or("-")
        ),
        None => println!("[{}] no active session", manager.product_key()),
    }
}

fn forward_notifications(
    product: String,
    label: &'static str,
    mut receiver: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    println!("[{}] session {}", product, label)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn watch(config: SessionConfig, product: String, sample_rate: f64) -> Result<(), String> {
    let host = SessionHost::from_config(config)?;
    let manager = host
        .start_session_manager(product.clone(), decision::sampled(sample_rate))
        .await;

    forward_notifications(product.clone(), "renewed", manager.subscribe_renew());
    forward_notifications(product, "expired", manager.subscribe_expire());
    print_status(&manager);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| format!("Failed to read stdin: {}", e))?
    {
        match parse_command(&line) {
            Some(Command::Activity(kind)) => host.notify_activity(kind),
            Some(Command::Visibility(visibility)) => host.set_visibility(visibility),
            Some(Command::Expire) => manager.expire().await,
            Some(Command::Status) => {
                host.flush().await;
                print_status(&manager);
            }
            Some(Command::Quit) => break,
            None if line.trim().is_empty() => {}
            None => eprintln!("unknown command: {}", line.trim()),
        }
    }

    host.stop();
    Ok(())
}
