//! Bulk acquisition of the base install over BitTorrent.
//!
//! A [`BulkSession`] drives any [`BulkDownloader`]; [`Aria2Downloader`] is
//! the production engine. [`acquire_base_files`] chains probe, download and
//! extraction with disk-space checks in between.

pub mod acquire;
pub mod aria2;
pub mod downloader;
pub mod error;
pub mod extract;
pub mod session;

pub use acquire::{acquire_base_files, acquire_with_session, AcquireReport};
pub use aria2::Aria2Downloader;
pub use downloader::{validate_magnet, AddMode, BulkDownloader, BulkEvent, TorrentHandle};
pub use error::{BulkError, BulkResult};
pub use extract::{extract_archive, list_archive, parse_listing, ArchiveListing, ExtractionHandle};
pub use session::{BulkCanceller, BulkOutcome, BulkSession};
