//! CLI error type.

use patchsync::bulk::BulkError;
use patchsync::logging::LoggingError;
use patchsync::UpdateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Bulk(#[from] BulkError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("worker thread failed: {0}")]
    Worker(String),

    /// The batch ran but some files could not be installed.
    #[error("{failed} of {total} files failed to install")]
    Incomplete { failed: usize, total: usize },
}
