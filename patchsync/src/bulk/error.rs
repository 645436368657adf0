//! Errors for bulk acquisition.

use std::time::Duration;

use thiserror::Error;

use crate::error::UpdateError;

/// Result type for bulk acquisition.
pub type BulkResult<T> = Result<T, BulkError>;

#[derive(Debug, Error)]
pub enum BulkError {
    /// The peer-to-peer engine could not be started or stopped responding.
    #[error("bulk engine error: {0}")]
    Engine(String),

    #[error("invalid magnet URI: {0}")]
    InvalidMagnet(String),

    /// The engine reported a failure for the torrent.
    #[error("torrent error: {0}")]
    Torrent(String),

    #[error("no torrent metadata after {}s", .0.as_secs())]
    MetadataTimeout(Duration),

    #[error("a download is already running in this session")]
    AlreadyStarted,

    #[error("no download has been started")]
    NotStarted,

    /// The session was closed before the download finished.
    #[error("bulk session closed")]
    Closed,

    /// The finished torrent contained no archive to extract.
    #[error("downloaded content contains no archive")]
    NoArchive,

    #[error(transparent)]
    Update(#[from] UpdateError),
}
