//! Disk-space preflight.
//!
//! Operations check free space on the volume that will receive their data
//! before they start consuming bandwidth or storage. Thresholds are exact
//! rationals and the comparison is strict: free space equal to the threshold
//! is rejected.

use std::io;
use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};

/// Required headroom as a ratio of the payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceMargin {
    pub numerator: u64,
    pub denominator: u64,
}

impl SpaceMargin {
    /// Update and repair: 1.1 × aggregate decompressed size.
    pub const UPDATE: SpaceMargin = SpaceMargin::new(11, 10);

    /// Bulk acquisition: 2.5 × torrent content size, so the packed archive
    /// and its unpacked copy can coexist.
    pub const BULK: SpaceMargin = SpaceMargin::new(5, 2);

    /// Archive extraction once the archive is already on disk.
    pub const EXTRACT: SpaceMargin = SpaceMargin::new(11, 10);

    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Whether `free` is strictly greater than `payload × margin`.
    pub fn allows(&self, free: u64, payload: u64) -> bool {
        u128::from(free) * u128::from(self.denominator)
            > u128::from(payload) * u128::from(self.numerator)
    }

    /// `payload × margin`, rounded up, for messages.
    pub fn threshold(&self, payload: u64) -> u64 {
        let den = u128::from(self.denominator.max(1));
        let scaled = (u128::from(payload) * u128::from(self.numerator) + den - 1) / den;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}

/// Reject the operation unless `free` exceeds the margin-scaled payload.
pub fn ensure_free_space(free: u64, payload: u64, margin: SpaceMargin) -> UpdateResult<()> {
    if margin.allows(free, payload) {
        Ok(())
    } else {
        Err(UpdateError::InsufficientSpace {
            available: free,
            required: margin.threshold(payload),
        })
    }
}

/// Source of free-space figures.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to an unprivileged writer on the volume backing `path`.
    fn free_bytes(&self, path: &Path) -> UpdateResult<u64>;
}

/// Queries the mounted disks through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskProbe;

impl SpaceProbe for DiskProbe {
    fn free_bytes(&self, path: &Path) -> UpdateResult<u64> {
        free_bytes(path)
    }
}

/// Check free space under `path` against a margin-scaled payload.
pub fn check_space(
    probe: &dyn SpaceProbe,
    path: &Path,
    payload: u64,
    margin: SpaceMargin,
) -> UpdateResult<()> {
    let free = probe.free_bytes(path)?;
    debug!(
        path = %path.display(),
        free,
        payload,
        threshold = margin.threshold(payload),
        "Disk space preflight"
    );
    ensure_free_space(free, payload, margin).inspect_err(|_| {
        warn!(
            path = %path.display(),
            free,
            payload,
            "Insufficient disk space"
        );
    })
}

/// Resolve the directory whose filesystem will actually receive writes to
/// `path`: the nearest existing ancestor with symlinks resolved.
pub fn backing_path(path: &Path) -> UpdateResult<PathBuf> {
    let mut candidate = path;
    loop {
        if candidate.exists() {
            return candidate
                .canonicalize()
                .map_err(|e| UpdateError::ReadFailed {
                    path: candidate.to_path_buf(),
                    source: e,
                });
        }
        match candidate.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => candidate = parent,
            _ => {
                return Err(UpdateError::ReadFailed {
                    path: path.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"),
                })
            }
        }
    }
}

/// A mounted filesystem as reported by the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub available: u64,
    pub read_only: bool,
}

/// Every mounted disk the system reports.
pub fn mounted_disks() -> Vec<MountInfo> {
    Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|disk| MountInfo {
            mount_point: disk.mount_point().to_path_buf(),
            available: disk.available_space(),
            read_only: disk.is_read_only(),
        })
        .collect()
}

/// The mount whose mount point is the longest prefix of `target`.
pub fn mount_for<'a>(target: &Path, mounts: &'a [MountInfo]) -> Option<&'a MountInfo> {
    mounts
        .iter()
        .filter(|mount| target.starts_with(&mount.mount_point))
        .max_by_key(|mount| mount.mount_point.as_os_str().len())
}

/// Free bytes on the filesystem backing `path`.
pub fn free_bytes(path: &Path) -> UpdateResult<u64> {
    let target = backing_path(path)?;
    free_on(&target, &mounted_disks())
}

/// Free bytes for `target` among `mounts`. A read-only mount is an error.
fn free_on(target: &Path, mounts: &[MountInfo]) -> UpdateResult<u64> {
    let mount = mount_for(target, mounts).ok_or_else(|| UpdateError::ReadFailed {
        path: target.to_path_buf(),
        source: io::Error::new(io::ErrorKind::NotFound, "no mounted disk contains this path"),
    })?;

    if mount.read_only {
        return Err(UpdateError::ReadOnlyFilesystem(target.to_path_buf()));
    }
    debug!(
        path = %target.display(),
        mount = %mount.mount_point.display(),
        available = mount.available,
        "Resolved backing disk"
    );
    Ok(mount.available)
}
