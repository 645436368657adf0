//! Tracing subscriber setup.
//!
//! Log lines go to stderr and, when a log directory is configured, to a
//! daily-rolling `patchsync.log` written from a background thread. The
//! returned [`LogGuard`] must stay alive until exit or buffered lines are
//! lost.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// File name prefix of the rolling log.
pub const LOG_FILE_NAME: &str = "patchsync.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to install subscriber: {0}")]
    Install(String),
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Directory for the rolling log file. `None` disables file logging.
    pub log_dir: Option<PathBuf>,
    /// Force `debug` level regardless of `RUST_LOG`.
    pub verbose: bool,
    /// Also write to stderr.
    pub stderr: bool,
}

impl LogConfig {
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_stderr(mut self, stderr: bool) -> Self {
        self.stderr = stderr;
        self
    }

    /// Directive used when building the filter.
    fn filter(&self) -> EnvFilter {
        if self.verbose {
            return EnvFilter::new("debug");
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps the background log writer flushing.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard, LoggingError> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = OffsetTime::new(offset, Rfc3339);

    let stderr_layer = config.stderr.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_timer(timer.clone())
            .with_target(false)
    });

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|e| LoggingError::CreateDir {
                path: dir.clone(),
                source: e,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_timer(timer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(LogGuard { _file: guard })
}
