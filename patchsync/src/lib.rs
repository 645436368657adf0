//! patchsync - keeps an installed file tree in sync with a server manifest.
//!
//! A server publishes a `version.ini` and a compressed SQLite database that
//! lists every file, its version, sizes and digest. An update cycle:
//!
//! 1. [`manifest::resolve_update`] or [`manifest::resolve_repair`] computes
//!    the work list, with a disk-space preflight.
//! 2. [`transfer::TransferPipeline::run`] creates the directory tree, then
//!    downloads, decompresses, verifies and atomically installs each file.
//!
//! Fresh installs can first pull a packed base tree over BitTorrent with
//! [`bulk::acquire_base_files`] and then run a repair.
//!
//! All entry points block; run them on a worker thread and consume
//! [`progress::ProgressEvent`]s from a [`progress::ProgressSink`].

pub mod bulk;
pub mod checksum;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod preflight;
pub mod progress;
pub mod provision;
pub mod tools;
pub mod transfer;

pub use config::EngineConfig;
pub use context::{UpdateContext, UpdateSession};
pub use error::{UpdateError, UpdateResult};
pub use manifest::{resolve_repair, resolve_update, FileInfo};
pub use progress::{Channel, ProgressEvent, ProgressSink, ProgressUpdate};
pub use provision::provision_directories;
pub use transfer::{TransferPipeline, TransferReport};
