//! End-to-end acquisition of the base install from a torrent.
//!
//! Download fills the overall channel from 0.0 to 0.5 and extraction from
//! 0.5 to 1.0. The result is not verified here; callers follow up with
//! [`crate::manifest::resolve_repair`] and the transfer pipeline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bulk::downloader::BulkDownloader;
use crate::bulk::error::{BulkError, BulkResult};
use crate::bulk::extract::{extract_archive, list_archive};
use crate::bulk::session::BulkSession;
use crate::context::{ensure_dir, UpdateSession};
use crate::preflight::{check_space, SpaceMargin};
use crate::progress::{Channel, ProgressSink, Reporter};

/// Where the downloaded archive is staged, relative to the install root.
/// Staging on the install volume keeps the archive on the disk the bulk
/// preflight measured.
pub const STAGING_DIR: &str = ".patchsync-bulk";

/// Summary of a completed acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireReport {
    /// Torrent content size.
    pub downloaded_bytes: u64,
    /// Entries the archiver reported while unpacking.
    pub extracted_entries: u64,
}

/// Probe, download and unpack the base install with a fresh engine.
pub fn acquire_base_files<D: BulkDownloader + 'static>(
    session: &UpdateSession,
    downloader: D,
    magnet: &str,
    sink: Arc<dyn ProgressSink>,
) -> BulkResult<AcquireReport> {
    let bulk = BulkSession::new(downloader, session.config());
    acquire_with_session(session, bulk, magnet, sink)
}

/// Like [`acquire_base_files`], for callers that need a
/// [`crate::bulk::BulkCanceller`] from the session before it starts.
///
/// The bulk session is closed before this returns.
pub fn acquire_with_session<D: BulkDownloader + 'static>(
    session: &UpdateSession,
    bulk: BulkSession<D>,
    magnet: &str,
    sink: Arc<dyn ProgressSink>,
) -> BulkResult<AcquireReport> {
    let mut bulk = bulk.with_overall_span(0.0, 0.5);
    let result = run(session, &mut bulk, magnet, Arc::clone(&sink));
    bulk.close();

    let reporter = Reporter::new(sink.as_ref());
    match &result {
        Ok(report) => {
            info!(
                bytes = report.downloaded_bytes,
                entries = report.extracted_entries,
                "Base files acquired"
            );
            reporter.overall(1.0, "Base files installed.");
            reporter.done(Channel::Overall);
        }
        Err(e) => reporter.fail(format!("Failed to acquire base files: {}", e)),
    }
    result
}

fn run<D: BulkDownloader + 'static>(
    session: &UpdateSession,
    bulk: &mut BulkSession<D>,
    magnet: &str,
    sink: Arc<dyn ProgressSink>,
) -> BulkResult<AcquireReport> {
    let reporter = Reporter::new(sink.as_ref());
    let install_root = &session.context().install_root;
    ensure_dir(install_root)?;

    let staging = install_root.join(STAGING_DIR);
    let canceller = bulk.canceller();

    reporter.overall(0.0, "Retrieving torrent metadata...");
    let total = bulk.probe_size(magnet)?;
    check_space(session.space_probe(), &staging, total, SpaceMargin::BULK)?;

    reporter.overall(0.0, "Downloading base files...");
    bulk.start_download(magnet, &staging, Arc::clone(&sink))?;
    let outcome = bulk.wait()?;
    bulk.close();

    let archive = pick_archive(&outcome.files).ok_or(BulkError::NoArchive)?;
    debug!(archive = %archive.display(), "Selected archive");

    let tools = &session.config().tools;
    let listing = list_archive(&tools.archiver, &archive)?;
    check_space(
        session.space_probe(),
        install_root,
        listing.uncompressed_bytes,
        SpaceMargin::EXTRACT,
    )?;

    if canceller.is_cancelled() {
        return Err(BulkError::Closed);
    }

    reporter.overall(0.5, "Extracting base files...");
    let extracted = extract_archive(
        &tools.archiver,
        &archive,
        install_root,
        listing.entries,
        Arc::clone(&sink),
    )?
    .wait_until(|| canceller.is_cancelled(), session.config().poll_interval)?
    .ok_or(BulkError::Closed)?;

    remove_staged(&archive, &staging);
    Ok(AcquireReport {
        downloaded_bytes: outcome.total_bytes,
        extracted_entries: extracted,
    })
}

/// The largest regular file among the downloaded paths.
fn pick_archive(files: &[PathBuf]) -> Option<PathBuf> {
    files
        .iter()
        .filter_map(|path| {
            fs::metadata(path)
                .ok()
                .filter(|m| m.is_file())
                .map(|m| (m.len(), path))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, path)| path.clone())
}

fn remove_staged(archive: &Path, staging: &Path) {
    if let Err(e) = fs::remove_file(archive) {
        warn!(path = %archive.display(), error = %e, "Failed to remove archive");
    }
    // Leftover torrent scaffolding; a non-empty directory is fine to keep.
    let _ = fs::remove_dir(staging);
}
