//! Logging setup.
//!
//! Installs a global tracing subscriber filtered by `NEURONAV_LOG` (default `warn`).
//! Text and JSON modes log to stderr; the TUI owns the terminal, so it logs to a file
//! under the data directory instead.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const ENV_VAR: &str = "NEURONAV_LOG";
const DEFAULT_FILTER: &str = "warn";
const LOG_FILE_NAME: &str = "neuronav-scan.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("No suitable data directory available for logs")]
    NoDataDir,
    #[error("Failed to open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(String),
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing. Failures are returned so callers can continue without logs.
pub fn init(target: LogTarget) -> Result<(), LoggingError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter())
        .with_target(false);

    let res = match target {
        LogTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogTarget::File => {
            let path = log_file_path()?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| LoggingError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
    };
    res.map_err(|e| LoggingError::SetGlobal(e.to_string()))
}

fn log_file_path() -> Result<PathBuf, LoggingError> {
    let dir = crate::storage::data_dir().map_err(|_| LoggingError::NoDataDir)?;
    fs::create_dir_all(&dir).map_err(|source| LoggingError::OpenFile {
        path: dir.clone(),
        source,
    })?;
    Ok(dir.join(LOG_FILE_NAME))
}
