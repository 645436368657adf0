//! Engine configuration.
//!
//! The retry policy is server-driven (see [`crate::manifest::VersionManifest`]);
//! everything here is local tuning.

use std::path::PathBuf;
use std::time::Duration;

use crate::progress::DEFAULT_SAMPLE_INTERVAL;
use crate::tools::ToolPaths;

/// Default per-attempt HTTP timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between bulk-session event drains.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default time to wait for torrent metadata when probing a size.
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for an update cycle.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for a single HTTP attempt. There is no deadline across retries.
    pub timeout: Duration,

    /// Directory for private temporary downloads.
    pub temp_dir: PathBuf,

    /// External decompression and archive tools.
    pub tools: ToolPaths,

    /// Cadence of live transfer samples.
    pub sample_interval: Duration,

    /// Cadence of bulk-session event drains.
    pub poll_interval: Duration,

    /// How long a size probe waits for torrent metadata.
    pub metadata_timeout: Duration,

    /// Path to the `aria2c` binary used for bulk acquisition.
    pub aria2_binary: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            temp_dir: std::env::temp_dir().join("patchsync"),
            tools: ToolPaths::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            aria2_binary: PathBuf::from("aria2c"),
        }
    }
}

impl EngineConfig {
    /// Set the per-attempt HTTP timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the temporary download directory.
    pub fn with_temp_dir(mut self, path: PathBuf) -> Self {
        self.temp_dir = path;
        self
    }

    /// Set the external tool paths.
    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools = tools;
        self
    }

    /// Set the transfer sample interval.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Set the bulk-session poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the metadata probe timeout.
    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    /// Set the `aria2c` binary.
    pub fn with_aria2_binary(mut self, path: PathBuf) -> Self {
        self.aria2_binary = path;
        self
    }
}
