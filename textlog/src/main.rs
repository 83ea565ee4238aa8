//! `textlog`: exactly-once logger for instant-message text channels.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/textlog/config.toml`).
//!
//! ```bash
//! # Replay a JSON-lines script against the index
//! textlog replay demos/dual_path.jsonl
//!
//! # Acknowledge pending entries past the retention window
//! textlog --retention-days 5 sweep
//!
//! # List what the index still holds pending for a channel
//! textlog pending /ch/1
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

use textlog::channel::reconcile;
use textlog::config::{CliArgs, ConfigError, TextlogConfig};
use textlog::observer::Observer;
use textlog::replay::{Replay, ReplayError};
use textlog_proto::channel::ChannelPath;
use textlog_store::{AckStore, SqliteAckStore, StoreError};

#[derive(Parser, Debug)]
#[command(version, about = "Exactly-once logger for instant-message text channels")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive loopback channels from a JSON-lines script.
    Replay {
        /// Script path.
        script: PathBuf,
    },
    /// Acknowledge every pending entry older than the retention window.
    Sweep,
    /// List the tokens still pending for a channel.
    Pending {
        /// Channel path.
        channel: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open index: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match TextlogConfig::load(&cli.args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("textlog: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match build_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("textlog: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.args.log_level, cli.args.log_file.as_deref());
    tracing::info!(store = %config.store_path.display(), "textlog starting");

    match runtime.block_on(run(cli.command, &config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "textlog failed");
            eprintln!("textlog: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Sessions share one thread and interleave only at await points.
fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

/// Initialize logging.
///
/// Logs go to `file_path` when given, stderr otherwise. Returns a
/// [`WorkerGuard`] that must be held until shutdown to ensure all buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let (writer, guard) = match file_path {
        Some(path) => {
            let log_dir = path.parent()?;
            let file_name = path.file_name()?.to_str()?;
            tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &TextlogConfig) -> Result<(), AppError> {
    let store = Arc::new(SqliteAckStore::open(&config.store_path)?);

    match command {
        Command::Replay { script } => {
            let observer = Observer::new(Arc::clone(&store), config.session.clone());
            let reports = Replay::new(observer).run_file(&script).await?;
            for report in &reports {
                let reconciled = report.reconciled.as_ref();
                println!(
                    "{}  {}  {}  reconciled={} live_logged={} duplicates={} acknowledged={}{}",
                    report.id,
                    report.channel,
                    report.state,
                    reconciled.map_or(0, |r| r.logged),
                    report.live.logged,
                    report.live.duplicates,
                    report.live.acknowledged,
                    report
                        .error
                        .as_ref()
                        .map_or_else(String::new, |e| format!("  error: {e}")),
                );
            }
        }
        Command::Sweep => {
            let cutoff =
                reconcile::retention_cutoff(chrono::Utc::now().timestamp(), config.session.retention);
            let report = reconcile::sweep_stale(store.as_ref(), None, cutoff).await;
            println!(
                "candidates={} acknowledged={} failed={}",
                report.candidates, report.acknowledged, report.failed
            );
        }
        Command::Pending { channel } => {
            for token in store.pending_messages(&ChannelPath::new(channel)).await? {
                println!("{token}");
            }
        }
    }
    Ok(())
}
