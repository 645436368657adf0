//! Work-list resolution.
//!
//! An update compares the installed version against the server manifest and
//! queues every file that changed since. A repair ignores versions and checks
//! every manifest file against what is on disk.
//!
//! Both return `Ok(vec![])` when there is nothing to do. Every failure is an
//! `Err`, and the progress stream always ends with an overall update at 1.0.

use std::fs;

use tracing::{debug, info, warn};

use crate::checksum::matches_manifest;
use crate::context::UpdateSession;
use crate::error::UpdateResult;
use crate::manifest::{display_name, FileInfo, ManifestDatabase, VersionManifest};
use crate::preflight::{check_space, SpaceMargin};
use crate::progress::{ratio, ProgressSink, Reporter};

/// Resolve the files changed since the installed version.
///
/// Falls back to [`resolve_repair`] when the cached `version.ini` is missing
/// or unreadable.
pub fn resolve_update(
    session: &mut UpdateSession,
    sink: &dyn ProgressSink,
) -> UpdateResult<Vec<FileInfo>> {
    let reporter = Reporter::new(sink);
    reporter.overall(0.0, "Checking for updates...");

    let installed = match VersionManifest::load_local(&session.context().version_file()) {
        Ok(local) => local.current_version,
        Err(e) => {
            warn!(error = %e, "Local version.ini unusable, running repair");
            reporter.overall(0.0, "Missing or invalid version.ini: Beginning repair...");
            return resolve_repair(session, sink);
        }
    };

    let manifest = VersionManifest::fetch_and_replace(session).inspect_err(|e| {
        reporter.fail(format!("Unable to fetch latest version.ini: {}", e));
    })?;

    let db = ManifestDatabase::acquire(session, &manifest).inspect_err(|e| {
        reporter.fail(format!("Failed to download latest update database: {}", e));
    })?;

    let files = changed_files(session, &db, &manifest, installed).inspect_err(|e| {
        reporter.fail(e.to_string());
    })?;

    info!(
        installed,
        latest = manifest.current_version,
        files = files.len(),
        "Update manifest resolved"
    );
    reporter.overall(1.0, update_label(files.len()));
    Ok(files)
}

fn changed_files(
    session: &UpdateSession,
    db: &ManifestDatabase,
    manifest: &VersionManifest,
    installed: i64,
) -> UpdateResult<Vec<FileInfo>> {
    let totals = db.update_totals(installed)?;
    if totals.files > 0 {
        check_space(
            session.space_probe(),
            &session.context().install_root,
            totals.decompressed_bytes,
            SpaceMargin::UPDATE,
        )?;
    }

    let ctx = session.context();
    Ok(db
        .update_rows(installed)?
        .iter()
        .map(|row| FileInfo::from_row(row, &ctx.install_root, manifest, &ctx.server_base_url))
        .collect())
}

fn update_label(count: usize) -> String {
    if count == 0 {
        "No updates available.".to_string()
    } else {
        "Update manifest retrieved.".to_string()
    }
}

/// Resolve every manifest file that is missing or damaged on disk.
///
/// Damaged files are deleted before they are queued; a failed delete is
/// logged and the file is queued anyway.
pub fn resolve_repair(
    session: &mut UpdateSession,
    sink: &dyn ProgressSink,
) -> UpdateResult<Vec<FileInfo>> {
    let reporter = Reporter::new(sink);
    reporter.overall(0.0, "Checking for missing or damaged files...");

    let manifest = VersionManifest::fetch_and_replace(session).inspect_err(|e| {
        reporter.fail(format!("Unable to fetch latest version.ini: {}", e));
    })?;

    let db = ManifestDatabase::acquire(session, &manifest).inspect_err(|e| {
        reporter.fail(format!("Failed to load server database: {}", e));
    })?;

    let files = damaged_files(session, &db, &manifest, &reporter).inspect_err(|e| {
        reporter.fail(e.to_string());
    })?;

    info!(files = files.len(), "Repair manifest resolved");
    reporter.overall(1.0, "Repair manifest retrieved.");
    Ok(files)
}

fn damaged_files(
    session: &UpdateSession,
    db: &ManifestDatabase,
    manifest: &VersionManifest,
    reporter: &Reporter<'_>,
) -> UpdateResult<Vec<FileInfo>> {
    let ctx = session.context();
    let total = db.full_count()?;
    let mut queued = Vec::new();
    let mut queued_bytes = 0u64;

    for (index, row) in db.full_rows()?.iter().enumerate() {
        let scanned = index as u64 + 1;
        reporter.overall(
            ratio(scanned, total),
            format!(
                "Scanning file {} of {}: {}",
                scanned,
                total,
                display_name(&row.path)
            ),
        );

        let info = FileInfo::from_row(row, &ctx.install_root, manifest, &ctx.server_base_url);
        let local = &info.destination_path;

        if local.exists() {
            if matches_manifest(local, &info.content_hash, info.decompressed_size) {
                continue;
            }
            debug!(path = %local.display(), "Local file damaged");
            if let Err(e) = fs::remove_file(local) {
                warn!(path = %local.display(), error = %e, "Unable to delete damaged file");
            }
        }

        queued_bytes = queued_bytes.saturating_add(info.decompressed_size);
        queued.push(info);
    }

    if !queued.is_empty() {
        check_space(
            session.space_probe(),
            &ctx.install_root,
            queued_bytes,
            SpaceMargin::UPDATE,
        )?;
    }

    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_label() {
        assert_eq!(update_label(0), "No updates available.");
        assert_eq!(update_label(2), "Update manifest retrieved.");
    }
}
