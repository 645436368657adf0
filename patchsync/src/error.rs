//! Error types for the update engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for update, repair and transfer operations.
pub type UpdateResult<T> = Result<T, UpdateError>;

/// Errors that can occur while resolving, provisioning or transferring files.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The cached version descriptor does not exist.
    #[error("version descriptor not found: {}", .0.display())]
    ManifestMissing(PathBuf),

    /// The version descriptor could not be parsed.
    #[error("invalid version descriptor: {0}")]
    ManifestParse(String),

    /// Failed to read a file or directory.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write, move or remove a file.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// Transport failure after all retries were used.
    #[error("failed to download {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// The HTTP client could not be set up.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A single attempt exceeded the transport timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// A downloaded or decompressed file has the wrong size.
    #[error("size mismatch for {name}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// Content digest verification failed.
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// The target volume does not have enough free space.
    #[error("insufficient disk space: {available} bytes free, more than {required} bytes needed")]
    InsufficientSpace { available: u64, required: u64 },

    /// The filesystem backing the target path is mounted read-only.
    #[error("filesystem backing {} is read-only", .0.display())]
    ReadOnlyFilesystem(PathBuf),

    /// A manifest query failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An external tool could not be run or exited unsuccessfully.
    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// Archive extraction failed.
    #[error("failed to extract {}: {reason}", path.display())]
    ExtractionFailed { path: PathBuf, reason: String },

    /// A manifest entry is not usable.
    #[error("invalid manifest entry: {0}")]
    InvalidEntry(String),
}

impl UpdateError {
    /// Whether this error came from the transport layer and is worth retrying.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::DownloadFailed { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_display() {
        let err = UpdateError::ChecksumMismatch {
            name: "S1Data.dat".to_string(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(err.to_string().contains("abc123"));
        assert!(err.to_string().contains("def456"));
    }

    #[test]
    fn test_insufficient_space_display() {
        let err = UpdateError::InsufficientSpace {
            available: 500,
            required: 1100,
        };
        assert_eq!(
            err.to_string(),
            "insufficient disk space: 500 bytes free, more than 1100 bytes needed"
        );
    }

    #[test]
    fn test_transport_classification() {
        let download = UpdateError::DownloadFailed {
            url: "http://a".to_string(),
            reason: "503".to_string(),
        };
        let timeout = UpdateError::Timeout {
            url: "http://a".to_string(),
            timeout_secs: 5,
        };
        let size = UpdateError::SizeMismatch {
            name: "a".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(download.is_transport());
        assert!(timeout.is_transport());
        assert!(!size.is_transport());
    }
}
