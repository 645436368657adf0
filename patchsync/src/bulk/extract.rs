//! Listing and unpacking the bulk archive with `bsdtar`.

use std::ffi::OsStr;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::progress::{ratio, ProgressSink, Reporter};
use crate::tools::{exit_reason, run_tool, tool_name};

/// Summary of an archive's table of contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveListing {
    pub entries: u64,
    pub uncompressed_bytes: u64,
}

/// List `archive` with `tool -tvf`.
pub fn list_archive(tool: &Path, archive: &Path) -> UpdateResult<ArchiveListing> {
    let output = run_tool(tool, [OsStr::new("-tvf"), archive.as_os_str()])?;
    if !output.status.success() {
        return Err(UpdateError::ExtractionFailed {
            path: archive.to_path_buf(),
            reason: exit_reason(output.status, &output.stderr),
        });
    }
    let listing = parse_listing(&output.stdout);
    debug!(
        archive = %archive.display(),
        entries = listing.entries,
        bytes = listing.uncompressed_bytes,
        "Listed archive"
    );
    Ok(listing)
}

/// Count entries and sum sizes in verbose tar listing output.
pub fn parse_listing(text: &str) -> ArchiveListing {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .fold(ArchiveListing::default(), |acc, line| ArchiveListing {
            entries: acc.entries + 1,
            uncompressed_bytes: acc.uncompressed_bytes + parse_listing_size(line).unwrap_or(0),
        })
}

/// Size column of one verbose listing line.
///
/// bsdtar: `-rw-r--r--  0 user group  1234 Jan  1 12:00 path`
/// GNU tar: `-rw-r--r-- user/group 1234 2024-01-01 12:00 path`
fn parse_listing_size(line: &str) -> Option<u64> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let index = if fields.get(1).is_some_and(|f| f.contains('/')) {
        2
    } else {
        4
    };
    fields.get(index)?.parse().ok()
}

/// A running extraction.
pub struct ExtractionHandle {
    child: Child,
    reader: Option<JoinHandle<ReaderOutput>>,
    archive: PathBuf,
    tool: String,
}

#[derive(Default)]
struct ReaderOutput {
    entries_seen: u64,
    diagnostics: Vec<String>,
}

/// Start unpacking `archive` into `dest`, dropping the archive's top-level
/// directory.
///
/// Each extracted entry reports "Extracting: path" on the transfer channel
/// and moves the overall channel from 0.5 towards 1.0.
pub fn extract_archive(
    tool: &Path,
    archive: &Path,
    dest: &Path,
    entries: u64,
    sink: Arc<dyn ProgressSink>,
) -> UpdateResult<ExtractionHandle> {
    info!(
        archive = %archive.display(),
        dest = %dest.display(),
        entries,
        "Extracting archive"
    );

    let mut child = Command::new(tool)
        .arg("-xvf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .arg("--strip-components=1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| UpdateError::ToolFailed {
            tool: tool_name(tool),
            reason: format!("failed to launch: {}", e),
        })?;

    let reader = child.stderr.take().map(|stderr| {
        thread::spawn(move || {
            let reporter = Reporter::new(sink.as_ref());
            let mut output = ReaderOutput::default();
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                match line.strip_prefix("x ") {
                    Some(entry) => {
                        output.entries_seen += 1;
                        let seen = output.entries_seen;
                        reporter.transfer(1.0, format!("Extracting: {}", entry));
                        reporter.overall(
                            0.5 + 0.5 * ratio(seen, entries),
                            format!("Extracting file {} of {}", seen, entries),
                        );
                    }
                    None => output.diagnostics.push(line),
                }
            }
            output
        })
    });

    Ok(ExtractionHandle {
        child,
        reader,
        archive: archive.to_path_buf(),
        tool: tool_name(tool),
    })
}

impl ExtractionHandle {
    /// Wait for the archiver to exit. Returns the number of entries it
    /// reported.
    pub fn wait(mut self) -> UpdateResult<u64> {
        let status = self.child.wait().map_err(|e| self.wait_error(e))?;
        self.finish(status)
    }

    /// Like [`ExtractionHandle::wait`], but kill the archiver as soon as
    /// `stop` returns true. Returns `Ok(None)` when stopped.
    pub fn wait_until(
        mut self,
        stop: impl Fn() -> bool,
        poll: Duration,
    ) -> UpdateResult<Option<u64>> {
        loop {
            if let Some(status) = self.child.try_wait().map_err(|e| self.wait_error(e))? {
                return self.finish(status).map(Some);
            }
            if stop() {
                warn!(archive = %self.archive.display(), "Extraction interrupted");
                self.kill();
                return Ok(None);
            }
            thread::sleep(poll);
        }
    }

    /// Terminate the archiver and reap it.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "Archiver already exited");
        }
        let _ = self.child.wait();
        self.join_reader();
    }

    fn wait_error(&self, e: std::io::Error) -> UpdateError {
        UpdateError::ToolFailed {
            tool: self.tool.clone(),
            reason: format!("failed to wait: {}", e),
        }
    }

    fn join_reader(&mut self) -> ReaderOutput {
        match self.reader.take().map(JoinHandle::join) {
            Some(Ok(output)) => output,
            Some(Err(_)) => {
                warn!("Extraction output reader panicked");
                ReaderOutput::default()
            }
            None => ReaderOutput::default(),
        }
    }

    fn finish(mut self, status: ExitStatus) -> UpdateResult<u64> {
        let output = self.join_reader();
        if !status.success() {
            return Err(UpdateError::ExtractionFailed {
                path: self.archive.clone(),
                reason: exit_reason(status, &output.diagnostics.join("\n")),
            });
        }
        info!(entries = output.entries_seen, "Extraction finished");
        Ok(output.entries_seen)
    }
}

impl Drop for ExtractionHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.kill();
        }
    }
}
