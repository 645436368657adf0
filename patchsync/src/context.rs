//! Per-cycle update session.
//!
//! An [`UpdateSession`] is built once per update cycle from the caller's
//! [`UpdateContext`] and passed to every engine call. It owns the HTTP
//! client, the external-tool adapters and the most recently loaded version
//! manifest, so nothing is shared between cycles.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use crate::config::EngineConfig;
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{VersionManifest, VERSION_FILE_NAME};
use crate::preflight::{SpaceProbe, DiskProbe};
use crate::tools::{Decompressor, ToolDecompressor};
use crate::transfer::http::{ArtifactFetcher, HttpFetcher, RetryPolicy};

/// What the caller supplies for an update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateContext {
    /// Root URL of the patch server, without a trailing slash.
    pub server_base_url: String,

    /// Root of the installed file tree.
    pub install_root: PathBuf,

    /// Where the cached `version.ini` and manifest database live.
    pub state_dir: PathBuf,
}

impl UpdateContext {
    /// Create a context that keeps its state files in the install root.
    pub fn new(server_base_url: impl Into<String>, install_root: impl Into<PathBuf>) -> Self {
        let install_root = install_root.into();
        Self {
            server_base_url: server_base_url.into().trim_end_matches('/').to_string(),
            state_dir: install_root.clone(),
            install_root,
        }
    }

    /// Keep state files somewhere other than the install root.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    /// `{server}/{relative}`.
    pub fn server_url(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.server_base_url,
            relative.trim_start_matches('/')
        )
    }

    /// Local path of the cached version descriptor.
    pub fn version_file(&self) -> PathBuf {
        self.state_dir.join(VERSION_FILE_NAME)
    }
}

/// Engine state for one update cycle.
pub struct UpdateSession {
    context: UpdateContext,
    config: EngineConfig,
    fetcher: Box<dyn ArtifactFetcher>,
    decompressor: Box<dyn Decompressor>,
    space_probe: Box<dyn SpaceProbe>,
    manifest: Option<VersionManifest>,
}

impl UpdateSession {
    /// Create a session with the production HTTP client, tools and free-space
    /// probe.
    pub fn new(context: UpdateContext, config: EngineConfig) -> UpdateResult<Self> {
        let fetcher = HttpFetcher::new(config.timeout)?;
        let decompressor = ToolDecompressor::new(config.tools.decompressor.clone());
        Ok(Self {
            context,
            config,
            fetcher: Box::new(fetcher),
            decompressor: Box::new(decompressor),
            space_probe: Box::new(DiskProbe),
            manifest: None,
        })
    }

    /// Replace the artifact fetcher.
    pub fn with_fetcher(mut self, fetcher: impl ArtifactFetcher + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    /// Replace the decompressor.
    pub fn with_decompressor(mut self, decompressor: impl Decompressor + 'static) -> Self {
        self.decompressor = Box::new(decompressor);
        self
    }

    /// Replace the free-space probe.
    pub fn with_space_probe(mut self, probe: impl SpaceProbe + 'static) -> Self {
        self.space_probe = Box::new(probe);
        self
    }

    pub fn context(&self) -> &UpdateContext {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &dyn ArtifactFetcher {
        self.fetcher.as_ref()
    }

    pub fn decompressor(&self) -> &dyn Decompressor {
        self.decompressor.as_ref()
    }

    pub fn space_probe(&self) -> &dyn SpaceProbe {
        self.space_probe.as_ref()
    }

    /// The manifest loaded in this cycle, if any.
    pub fn manifest(&self) -> Option<&VersionManifest> {
        self.manifest.as_ref()
    }

    pub(crate) fn set_manifest(&mut self, manifest: VersionManifest) {
        self.manifest = Some(manifest);
    }

    /// The manifest for this cycle, loading the cached descriptor if none was
    /// fetched yet.
    pub fn current_manifest(&mut self) -> UpdateResult<&VersionManifest> {
        if self.manifest.is_none() {
            let loaded = VersionManifest::load_local(&self.context.version_file())?;
            self.manifest = Some(loaded);
        }
        self.manifest
            .as_ref()
            .ok_or_else(|| UpdateError::ManifestMissing(self.context.version_file()))
    }

    /// Retry policy from the current manifest, or the defaults before one is
    /// known.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.manifest
            .as_ref()
            .map(VersionManifest::retry_policy)
            .unwrap_or_default()
    }

    /// Directory for private temporary downloads, created on demand.
    pub fn temp_dir(&self) -> UpdateResult<&Path> {
        let dir = self.config.temp_dir.as_path();
        ensure_dir(dir)?;
        Ok(dir)
    }

    /// Allocate a private temporary file for a download.
    pub fn temp_download(&self, prefix: &str) -> UpdateResult<TempPath> {
        let dir = self.temp_dir()?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(dir)
            .map(|file| file.into_temp_path())
            .map_err(|e| UpdateError::WriteFailed {
                path: dir.to_path_buf(),
                source: e,
            })
    }

    /// Local path of the decompressed manifest database.
    pub fn database_path(&self, manifest: &VersionManifest) -> PathBuf {
        self.context.state_dir.join(&manifest.db_local_name)
    }
}

/// Create a directory (and parents) if it is missing.
pub(crate) fn ensure_dir(dir: &Path) -> UpdateResult<()> {
    fs::create_dir_all(dir).map_err(|e| UpdateError::CreateDirFailed {
        path: dir.to_path_buf(),
        source: e,
    })
}
