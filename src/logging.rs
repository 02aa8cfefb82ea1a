//! Tracing setup for the control plane.
//!
//! The long-running server writes machine-readable JSON rows under
//! `<repo>/.mu/logs/`, line-oriented like the rest of the persisted
//! control-plane state, with a human-readable stream on stderr beside
//! them. One-shot subcommands (`check-config`, `exec`) skip the file
//! layer entirely. `RUST_LOG` overrides the `info` default in both
//! shapes.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log directory under the repository root, a sibling of
/// `.mu/control-plane/`.
const LOGS_DIR: &str = ".mu/logs";

/// File name prefix for rotated server logs.
const LOG_FILE_PREFIX: &str = "control-plane.jsonl";

/// Keeps the background log writer alive.
///
/// File rows go through a `tracing-appender` worker thread, and this
/// guard owns that thread. The server holds it until shutdown; once it
/// drops, buffered rows flush and the current log file closes.
#[must_use = "dropping the guard stops log flushing"]
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Resolve the server log directory for a repository.
pub fn logs_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(LOGS_DIR)
}

/// Server-mode tracing: daily-rotated JSON files plus stderr.
///
/// Rows land in `<repo>/.mu/logs/control-plane.jsonl.YYYY-MM-DD`, one
/// JSON object per line, so the tooling that tails the control-plane
/// journals can tail the logs too.
///
/// # Errors
///
/// Fails when the log directory cannot be created.
pub fn init_server(repo_root: &Path) -> anyhow::Result<LogGuard> {
    let dir = logs_dir(repo_root);
    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("failed to create log directory {}: {e}", dir.display()))?;

    let (file_writer, worker) = tracing_appender::non_blocking(RollingFileAppender::new(
        Rotation::DAILY,
        dir,
        LOG_FILE_PREFIX,
    ));

    tracing_subscriber::registry()
        .with(default_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LogGuard { _worker: worker })
}

/// Terminal-mode tracing for one-shot subcommands: stderr only, no
/// file layer, no guard to carry around.
pub fn init_terminal() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// `RUST_LOG` when set, `info` otherwise. Malformed directives are
/// dropped lossily rather than aborting startup.
fn default_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}
