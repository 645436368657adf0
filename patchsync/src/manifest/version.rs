//! The `version.ini` descriptor.
//!
//! ```ini
//! [Download]
//! Version=5
//! Retry=3
//! Wait=1000
//! DB file=db/server.db.5.cab
//! DL root=patch
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use ini::{Ini, Properties};
use tracing::{debug, info};

use crate::context::{ensure_dir, UpdateSession};
use crate::error::{UpdateError, UpdateResult};
use crate::transfer::http::RetryPolicy;

/// File name of the descriptor, both on the server and locally.
pub const VERSION_FILE_NAME: &str = "version.ini";

const SECTION: &str = "Download";

/// Parsed `version.ini`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionManifest {
    pub current_version: i64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Server-relative path of the compressed manifest database.
    pub db_relative_path: String,
    /// Server-relative directory holding the per-file artifacts.
    pub artifact_root: String,
    /// Local file name of the decompressed database.
    pub db_local_name: String,
}

impl VersionManifest {
    /// Parse descriptor text.
    pub fn parse(text: &str) -> UpdateResult<Self> {
        let ini = Ini::load_from_str(text)
            .map_err(|e| UpdateError::ManifestParse(format!("invalid ini: {}", e)))?;
        let section = ini
            .section(Some(SECTION))
            .ok_or_else(|| UpdateError::ManifestParse(format!("missing [{}] section", SECTION)))?;

        let current_version = integer(section, "Version")?;
        let max_retries = u32::try_from(non_negative(section, "Retry")?)
            .map_err(|_| UpdateError::ManifestParse("key 'Retry' is out of range".to_string()))?;
        let retry_delay = Duration::from_millis(non_negative(section, "Wait")?);
        let db_relative_path = string(section, "DB file")?.to_string();
        let artifact_root = string(section, "DL root")?.trim_matches('/').to_string();
        let db_local_name = local_db_name(&db_relative_path, current_version);

        Ok(Self {
            current_version,
            max_retries,
            retry_delay,
            db_relative_path,
            artifact_root,
            db_local_name,
        })
    }

    /// Load the cached descriptor.
    ///
    /// A missing file is [`UpdateError::ManifestMissing`]; callers treat both
    /// that and a parse error as "run a full repair".
    pub fn load_local(path: &Path) -> UpdateResult<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(UpdateError::ManifestMissing(path.to_path_buf()))
            }
            Err(e) => {
                return Err(UpdateError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&text)
    }

    /// Download the server's descriptor, replace the cached copy with it and
    /// make it the session's current manifest.
    pub fn fetch_and_replace(session: &mut UpdateSession) -> UpdateResult<Self> {
        let url = session.context().server_url(VERSION_FILE_NAME);
        let dest = session.context().version_file();
        let temp = session.temp_download("version-")?;

        session
            .fetcher()
            .fetch(&url, &temp, &session.retry_policy(), &mut |_, _| {})?;

        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        match fs::remove_file(&dest) {
            Ok(()) => debug!(path = %dest.display(), "Removed cached version.ini"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(UpdateError::WriteFailed {
                    path: dest,
                    source: e,
                })
            }
        }

        if let Err(e) = temp.persist(&dest) {
            // Rename fails across filesystems; copy instead.
            debug!(error = %e.error, "Rename failed, copying version.ini");
            fs::copy(&e.path, &dest).map_err(|source| UpdateError::WriteFailed {
                path: dest.clone(),
                source,
            })?;
        }

        let manifest = Self::load_local(&dest)?;
        info!(
            version = manifest.current_version,
            retries = manifest.max_retries,
            "Fetched version.ini"
        );
        session.set_manifest(manifest.clone());
        Ok(manifest)
    }

    /// Retry policy advertised by the server.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    /// `{server}/{DL root}/{id}-{version}.cab`.
    pub fn artifact_url(&self, server_base_url: &str, id: i64, version: i64) -> String {
        format!(
            "{}/{}/{}-{}.cab",
            server_base_url.trim_end_matches('/'),
            self.artifact_root,
            id,
            version
        )
    }
}

fn string<'a>(section: &'a Properties, key: &str) -> UpdateResult<&'a str> {
    section
        .get(key)
        .map(str::trim)
        .ok_or_else(|| UpdateError::ManifestParse(format!("missing key '{}'", key)))
}

fn integer(section: &Properties, key: &str) -> UpdateResult<i64> {
    let raw = string(section, key)?;
    raw.parse::<i64>().map_err(|_| {
        UpdateError::ManifestParse(format!("key '{}' is not an integer: '{}'", key, raw))
    })
}

fn non_negative(section: &Properties, key: &str) -> UpdateResult<u64> {
    let value = integer(section, key)?;
    u64::try_from(value)
        .map_err(|_| UpdateError::ManifestParse(format!("key '{}' must not be negative", key)))
}

/// Basename of the database path with a trailing `.{version}.cab` removed.
fn local_db_name(db_relative_path: &str, version: i64) -> String {
    let basename = db_relative_path
        .rsplit('/')
        .next()
        .unwrap_or(db_relative_path);
    let suffix = format!(".{}.cab", version);
    match basename.strip_suffix(&suffix) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => basename.to_string(),
    }
}
