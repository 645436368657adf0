//! The server's manifest database.
//!
//! The server publishes a compressed single-file SQLite snapshot. It is
//! downloaded and decompressed into the state directory, opened read-only,
//! queried and closed again within one call.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, Row};
use tracing::{debug, info};

use crate::context::{ensure_dir, UpdateSession};
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::VersionManifest;

const UPDATE_MANIFEST: &str = include_str!("../../sql/update_manifest.sql");
const UPDATE_MANIFEST_SIZE: &str = include_str!("../../sql/update_manifest_size.sql");
const FULL_MANIFEST: &str = include_str!("../../sql/full_manifest.sql");
const FULL_MANIFEST_COUNT: &str = include_str!("../../sql/full_manifest_count.sql");
const DIRECTORIES: &str = include_str!("../../sql/directories.sql");
const DIRECTORIES_COUNT: &str = include_str!("../../sql/directories_count.sql");

/// One row of the `file_version` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRow {
    pub id: i64,
    pub path: String,
    pub version: i64,
    pub compressed_size: u64,
    pub decompressed_size: u64,
    pub hash: String,
}

impl ManifestRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            version: row.get(2)?,
            compressed_size: size_column(row, 3)?,
            decompressed_size: size_column(row, 4)?,
            hash: row.get::<_, String>(5)?.trim().to_ascii_lowercase(),
        })
    }
}

fn size_column(row: &Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(index)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(index, value))
}

/// Count and aggregate decompressed size of a query's result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManifestTotals {
    pub files: u64,
    pub decompressed_bytes: u64,
}

/// Read-only handle on a decompressed manifest database.
pub struct ManifestDatabase {
    conn: Connection,
    path: PathBuf,
}

impl ManifestDatabase {
    /// Open a database file read-only.
    pub fn open(path: &Path) -> UpdateResult<Self> {
        if !path.is_file() {
            return Err(UpdateError::ReadFailed {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "database not found"),
            });
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        debug!(path = %path.display(), "Opened manifest database");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Download and decompress the current database, then open it.
    pub fn acquire(session: &UpdateSession, manifest: &VersionManifest) -> UpdateResult<Self> {
        let url = session.context().server_url(&manifest.db_relative_path);
        let dest = session.database_path(manifest);
        let compressed = session.temp_download("db-")?;

        let bytes = session
            .fetcher()
            .fetch(&url, &compressed, &manifest.retry_policy(), &mut |_, _| {})?;
        debug!(url = %url, bytes, "Downloaded manifest database");

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let staged = tempfile::Builder::new()
            .prefix(".db-")
            .tempfile_in(parent)
            .map_err(|e| UpdateError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?
            .into_temp_path();

        session.decompressor().decompress(&compressed, &staged)?;
        staged.persist(&dest).map_err(|e| UpdateError::WriteFailed {
            path: dest.clone(),
            source: e.error,
        })?;

        info!(
            path = %dest.display(),
            version = manifest.current_version,
            "Manifest database ready"
        );
        Self::open(&dest)
    }

    /// Open the cached database, downloading it first unless `skip_download`
    /// is set and a cached copy exists.
    pub fn open_cached(session: &mut UpdateSession, skip_download: bool) -> UpdateResult<Self> {
        let manifest = session.current_manifest()?.clone();
        let path = session.database_path(&manifest);
        if skip_download && path.is_file() {
            return Self::open(&path);
        }
        Self::acquire(session, &manifest)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest version of every file newer than `since`, ordered by id.
    pub fn update_rows(&self, since: i64) -> UpdateResult<Vec<ManifestRow>> {
        let mut stmt = self.conn.prepare(UPDATE_MANIFEST)?;
        let rows = stmt.query_map(params![since], ManifestRow::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Count and decompressed size of [`update_rows`](Self::update_rows).
    pub fn update_totals(&self, since: i64) -> UpdateResult<ManifestTotals> {
        Ok(self
            .conn
            .query_row(UPDATE_MANIFEST_SIZE, params![since], |row| {
                Ok(ManifestTotals {
                    files: size_column(row, 0)?,
                    decompressed_bytes: size_column(row, 1)?,
                })
            })?)
    }

    /// Latest version of every file, ordered by id.
    pub fn full_rows(&self) -> UpdateResult<Vec<ManifestRow>> {
        let mut stmt = self.conn.prepare(FULL_MANIFEST)?;
        let rows = stmt.query_map([], ManifestRow::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn full_count(&self) -> UpdateResult<u64> {
        Ok(self
            .conn
            .query_row(FULL_MANIFEST_COUNT, [], |row| size_column(row, 0))?)
    }

    /// Every directory the install tree must contain, parents first.
    pub fn directories(&self) -> UpdateResult<Vec<String>> {
        let mut stmt = self.conn.prepare(DIRECTORIES)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn directory_count(&self) -> UpdateResult<u64> {
        Ok(self
            .conn
            .query_row(DIRECTORIES_COUNT, [], |row| size_column(row, 0))?)
    }
}
