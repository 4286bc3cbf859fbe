//! Tracing subscriber setup.
//!
//! [`init`] installs a global subscriber with:
//!
//! - an [`EnvFilter`] built from `RUST_LOG`, or from the configured level when
//!   `RUST_LOG` is unset
//! - a stderr fmt layer with local RFC 3339 timestamps
//! - an optional non-blocking file layer
//!
//! Keep the returned [`LoggingGuard`] alive for the lifetime of the program;
//! dropping it flushes the file writer.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Errors installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{directive}': {message}")]
    Filter { directive: String, message: String },

    #[error("failed to open log file {path}: {message}")]
    File { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Flushes buffered file output when dropped.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Filter from `RUST_LOG`, falling back to `level`.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::Filter {
        directive: level.to_string(),
        message: e.to_string(),
    })
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let filter = build_filter(&config.level)?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_timer(LocalTime::rfc_3339())
        .with_target(true);

    let (file_layer, file_guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    Ok(LoggingGuard { _file: file_guard })
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), LoggingError> {
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| LoggingError::File {
            path: path.to_path_buf(),
            message: "no file name".to_string(),
        })?;

    std::fs::create_dir_all(&directory)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(&directory)
        .map_err(|e| LoggingError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(tracing_appender::non_blocking(appender))
}
