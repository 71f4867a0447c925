//! Logging and tracing configuration
//!
//! The CLI logs compact lines to stderr. When a log directory is available,
//! a second layer writes full detail to a daily-rotated file so CI runs can
//! be inspected after the fact without rerunning with `RUST_LOG`.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// Log file prefix inside the log directory
const LOG_FILE: &str = "screenshots.log";

/// Initialize tracing for the CLI
///
/// Logs are controlled by the `RUST_LOG` environment variable. Default level
/// is INFO for this crate (DEBUG with `verbose`), WARN for dependencies.
///
/// The returned guard must be kept alive for the file writer to flush.
pub fn init_cli(verbose: bool) -> Option<WorkerGuard> {
    let default_filter = if verbose {
        "screenshots=debug,warn"
    } else {
        "screenshots=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let file = log_dir().and_then(|dir| match std::fs::create_dir_all(&dir) {
        Ok(()) => Some(tracing_appender::non_blocking(
            tracing_appender::rolling::daily(dir, LOG_FILE),
        )),
        Err(e) => {
            eprintln!("Warning: Could not create log directory: {}", e);
            None
        }
    });

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

/// Directory holding the rotated log files
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "screenshot-tests").map(|d| d.data_dir().join("logs"))
}
