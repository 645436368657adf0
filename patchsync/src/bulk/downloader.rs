//! The peer-to-peer engine seam.

use std::path::{Path, PathBuf};

use crate::bulk::error::{BulkError, BulkResult};

/// Engine-assigned identifier of an added torrent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TorrentHandle(pub String);

impl std::fmt::Display for TorrentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a torrent is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Fetch metadata only; payload transfer must not start.
    Probe,
    /// Download the full content.
    Download,
}

/// Something the engine observed about one torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkEvent {
    /// Metadata is available and the content size is known.
    MetadataReceived {
        handle: TorrentHandle,
        total_bytes: u64,
    },
    Progress {
        handle: TorrentHandle,
        downloaded: u64,
        total: u64,
        /// Bytes per second.
        rate: u64,
    },
    /// All content is on disk.
    Finished {
        handle: TorrentHandle,
        files: Vec<PathBuf>,
    },
    Error {
        handle: TorrentHandle,
        message: String,
    },
}

impl BulkEvent {
    pub fn handle(&self) -> &TorrentHandle {
        match self {
            Self::MetadataReceived { handle, .. }
            | Self::Progress { handle, .. }
            | Self::Finished { handle, .. }
            | Self::Error { handle, .. } => handle,
        }
    }
}

/// A peer-to-peer download engine.
///
/// Implementations are driven from one thread at a time; [`pop_events`]
/// returns everything observed since the previous call.
///
/// [`pop_events`]: BulkDownloader::pop_events
pub trait BulkDownloader: Send {
    fn add_magnet(&mut self, magnet: &str, save_path: &Path, mode: AddMode)
        -> BulkResult<TorrentHandle>;

    fn pop_events(&mut self) -> BulkResult<Vec<BulkEvent>>;

    /// Stop and forget a torrent. Downloaded data is left on disk.
    fn remove(&mut self, handle: &TorrentHandle) -> BulkResult<()>;

    /// Stop the engine. Further calls may fail.
    fn shutdown(&mut self) -> BulkResult<()>;
}

/// Check that `magnet` is a BitTorrent magnet link with a usable info hash.
pub fn validate_magnet(magnet: &str) -> BulkResult<()> {
    let query = magnet
        .trim()
        .strip_prefix("magnet:?")
        .ok_or_else(|| BulkError::InvalidMagnet("missing 'magnet:?' prefix".to_string()))?;

    let hash = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| key.starts_with("xt"))
        .find_map(|(_, value)| value.strip_prefix("urn:btih:"))
        .ok_or_else(|| BulkError::InvalidMagnet("no 'xt=urn:btih:' parameter".to_string()))?;

    let valid = match hash.len() {
        40 => hash.chars().all(|c| c.is_ascii_hexdigit()),
        32 => hash
            .chars()
            .all(|c| c.is_ascii_alphabetic() || ('2'..='7').contains(&c)),
        _ => false,
    };
    if !valid {
        return Err(BulkError::InvalidMagnet(format!("bad info hash '{}'", hash)));
    }
    Ok(())
}
