//! Per-file download, decompression, verification and installation.
//!
//! Files are processed serially in list order. A file reaches its destination
//! only after its compressed size, decompressed size and digest all match the
//! manifest; the final step is a rename of a temp file that lives in the
//! destination directory. A failing file is recorded and the batch moves on.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::checksum::verify_digest_as;
use crate::context::{ensure_dir, UpdateSession};
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::FileInfo;
use crate::progress::{ratio, Channel, ProgressSink, Reporter, TransferSampler};
use crate::provision::provision_directories;
use crate::transfer::http::RetryPolicy;

/// A file that could not be installed.
#[derive(Debug)]
pub struct FileFailure {
    pub relative_path: String,
    pub destination_path: PathBuf,
    pub error: UpdateError,
}

/// Outcome of a transfer batch.
#[derive(Debug, Default)]
pub struct TransferReport {
    pub installed: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
}

impl TransferReport {
    /// True when every queued file was installed.
    pub fn overall_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Installs a resolved work list.
pub struct TransferPipeline<'a> {
    session: &'a UpdateSession,
    reporter: Reporter<'a>,
    retry: RetryPolicy,
}

impl<'a> TransferPipeline<'a> {
    /// Provision the directory tree, then fetch and install every file.
    ///
    /// Only a provisioning failure is returned as `Err`; per-file failures
    /// land in the report.
    pub fn run(
        session: &mut UpdateSession,
        files: &[FileInfo],
        sink: &dyn ProgressSink,
    ) -> UpdateResult<TransferReport> {
        provision_directories(session, sink, true)?;

        let pipeline = TransferPipeline {
            retry: session.retry_policy(),
            session,
            reporter: Reporter::new(sink),
        };
        Ok(pipeline.install_all(files))
    }

    fn install_all(&self, files: &[FileInfo]) -> TransferReport {
        let total = files.len() as u64;
        let mut report = TransferReport::default();

        self.reporter.overall(0.0, "Downloading files...");
        info!(files = total, "Starting transfer batch");

        for (index, file) in files.iter().enumerate() {
            let position = index as u64 + 1;
            match self.install_one(file, position, total) {
                Ok(()) => {
                    debug!(path = %file.destination_path.display(), "Installed");
                    report.installed.push(file.destination_path.clone());
                }
                Err(e) => {
                    warn!(
                        file = %file.relative_path,
                        url = %file.source_url,
                        error = %e,
                        "File transfer failed"
                    );
                    self.reporter
                        .error(Channel::Transfer, format!("{}: {}", file.file_name(), e));
                    report.failures.push(FileFailure {
                        relative_path: file.relative_path.clone(),
                        destination_path: file.destination_path.clone(),
                        error: e,
                    });
                }
            }
        }

        info!(
            installed = report.installed.len(),
            failed = report.failures.len(),
            "Transfer batch finished"
        );
        self.reporter.overall(1.0, "All downloads processed.");
        self.reporter.done(Channel::Overall);
        self.reporter.done(Channel::Transfer);
        report
    }

    fn install_one(&self, file: &FileInfo, position: u64, total: u64) -> UpdateResult<()> {
        let fraction = ratio(position, total);
        let name = file.file_name();

        self.reporter.overall(
            fraction,
            format!("Downloading file {} of {}: {}", position, total, name),
        );
        let compressed = self.download(file)?;

        self.reporter.overall(
            fraction,
            format!("Extracting file {} of {}: {}", position, total, name),
        );
        self.reporter.transfer(1.0, "Progress: Done!");

        let staged = self.decompress(file, compressed)?;
        verify_size(&staged, &file.relative_path, file.decompressed_size)?;
        verify_digest_as(&staged, &file.content_hash, &file.relative_path)?;
        set_install_mode(&staged, &file.destination_path)?;

        staged
            .persist(&file.destination_path)
            .map_err(|e| UpdateError::WriteFailed {
                path: file.destination_path.clone(),
                source: e.error,
            })
    }

    /// Fetch the compressed artifact into a private temp file.
    fn download(&self, file: &FileInfo) -> UpdateResult<TempPath> {
        let temp = self.session.temp_download("artifact-")?;
        let mut sampler = TransferSampler::new(self.session.config().sample_interval);
        let expected = file.compressed_size;

        let received = self.session.fetcher().fetch(
            &file.source_url,
            &temp,
            &self.retry,
            &mut |now, announced| {
                let total = if announced > 0 { announced } else { expected };
                if let Some(sample) = sampler.sample(Instant::now(), now, total) {
                    self.reporter.transfer(sample.fraction(), sample.label);
                }
            },
        )?;

        if received != expected {
            return Err(UpdateError::SizeMismatch {
                name: file.relative_path.clone(),
                expected,
                actual: received,
            });
        }
        Ok(temp)
    }

    /// Decompress next to the destination so the final rename stays on one
    /// filesystem. The compressed input is removed on every path.
    fn decompress(&self, file: &FileInfo, compressed: TempPath) -> UpdateResult<TempPath> {
        let parent = file
            .destination_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;

        let staged = tempfile::Builder::new()
            .prefix(".patchsync-")
            .tempfile_in(parent)
            .map_err(|e| UpdateError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?
            .into_temp_path();

        self.session.decompressor().decompress(&compressed, &staged)?;
        drop(compressed);
        Ok(staged)
    }
}

/// Mode for installed files that do not replace an existing one.
#[cfg(unix)]
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Give the staged file the mode of the file it replaces, or
/// [`DEFAULT_FILE_MODE`]. Temp files are created owner-only.
#[cfg(unix)]
fn set_install_mode(staged: &Path, destination: &Path) -> UpdateResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(destination)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(DEFAULT_FILE_MODE);
    fs::set_permissions(staged, fs::Permissions::from_mode(mode)).map_err(|e| {
        UpdateError::WriteFailed {
            path: staged.to_path_buf(),
            source: e,
        }
    })
}

#[cfg(not(unix))]
fn set_install_mode(_staged: &Path, _destination: &Path) -> UpdateResult<()> {
    Ok(())
}

fn verify_size(path: &Path, name: &str, expected: u64) -> UpdateResult<()> {
    let actual = fs::metadata(path)
        .map_err(|e| UpdateError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?
        .len();
    if actual != expected {
        return Err(UpdateError::SizeMismatch {
            name: name.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}
