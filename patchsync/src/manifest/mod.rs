//! Server manifest handling: the version descriptor, the manifest database
//! and the resolution of what needs to be fetched.

pub mod database;
pub mod diff;
pub mod version;

use std::path::{Path, PathBuf};

pub use database::{ManifestDatabase, ManifestRow, ManifestTotals};
pub use diff::{resolve_repair, resolve_update};
pub use version::{VersionManifest, VERSION_FILE_NAME};

/// A file queued for download and installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path relative to the install root, as listed in the manifest.
    pub relative_path: String,
    /// Where the verified file is installed.
    pub destination_path: PathBuf,
    /// Expected digest of the decompressed file, lowercase hex.
    pub content_hash: String,
    pub compressed_size: u64,
    pub decompressed_size: u64,
    pub source_url: String,
}

impl FileInfo {
    /// Build the queue entry for a manifest row.
    pub fn from_row(
        row: &ManifestRow,
        install_root: &Path,
        manifest: &VersionManifest,
        server_base_url: &str,
    ) -> Self {
        Self {
            relative_path: row.path.clone(),
            destination_path: install_path(install_root, &row.path),
            content_hash: row.hash.clone(),
            compressed_size: row.compressed_size,
            decompressed_size: row.decompressed_size,
            source_url: manifest.artifact_url(server_base_url, row.id, row.version),
        }
    }

    /// Last path component, for progress labels.
    pub fn file_name(&self) -> &str {
        display_name(&self.relative_path)
    }
}

/// Join a manifest path onto the install root. Empty, `.` and `..`
/// components are dropped so the result stays under the root.
pub fn install_path(install_root: &Path, relative: &str) -> PathBuf {
    relative
        .split(['/', '\\'])
        .filter(|part| !matches!(*part, "" | "." | ".."))
        .fold(install_root.to_path_buf(), |path, part| path.join(part))
}

/// Last component of a `/`-separated manifest path.
pub fn display_name(relative: &str) -> &str {
    relative
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or(relative)
}
