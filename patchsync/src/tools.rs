//! External tool invocation.
//!
//! Artifacts and the bulk archive are unpacked by the same tools the server
//! side packs them with:
//!
//! - a single-purpose decompressor invoked as `tool <input> <output>`, which
//!   removes its input on success
//! - `bsdtar` for listing and extracting the bulk archive

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tracing::debug;

use crate::error::{UpdateError, UpdateResult};

/// Default decompressor program name.
pub const DEFAULT_DECOMPRESSOR: &str = "unelzma";

/// Default archiver program name.
pub const DEFAULT_ARCHIVER: &str = "bsdtar";

/// Locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub decompressor: PathBuf,
    pub archiver: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            decompressor: resolve_tool(DEFAULT_DECOMPRESSOR),
            archiver: resolve_tool(DEFAULT_ARCHIVER),
        }
    }
}

/// Prefer a tool bundled next to the running executable, then fall back to
/// `PATH` lookup by name.
pub fn resolve_tool(name: &str) -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Captured result of a finished tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run a tool to completion, capturing both output streams.
///
/// Only a failure to launch is an error here; callers decide what a non-zero
/// exit status means.
pub fn run_tool<I, S>(program: &Path, args: I) -> UpdateResult<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| UpdateError::ToolFailed {
            tool: tool_name(program),
            reason: format!("failed to launch: {}", e),
        })?;

    Ok(ToolOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Display name for a tool path.
pub fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// Decompresses a single downloaded artifact.
pub trait Decompressor: Send + Sync {
    /// Decompress `input` into `output`. On success the input may have been
    /// consumed.
    fn decompress(&self, input: &Path, output: &Path) -> UpdateResult<()>;
}

/// Decompressor backed by an external `tool <input> <output>` program.
#[derive(Debug, Clone)]
pub struct ToolDecompressor {
    program: PathBuf,
}

impl ToolDecompressor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Decompressor for ToolDecompressor {
    fn decompress(&self, input: &Path, output: &Path) -> UpdateResult<()> {
        debug!(
            tool = %self.program.display(),
            input = %input.display(),
            output = %output.display(),
            "Decompressing artifact"
        );

        let result = run_tool(&self.program, [input.as_os_str(), output.as_os_str()])?;
        if !result.status.success() {
            return Err(UpdateError::ToolFailed {
                tool: tool_name(&self.program),
                reason: exit_reason(result.status, &result.stderr),
            });
        }
        Ok(())
    }
}

/// Describe a non-zero exit for error messages.
pub fn exit_reason(status: ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    match (status.code(), stderr.is_empty()) {
        (Some(code), true) => format!("exited with status {}", code),
        (Some(code), false) => format!("exited with status {}: {}", code, stderr),
        (None, true) => "terminated by signal".to_string(),
        (None, false) => format!("terminated by signal: {}", stderr),
    }
}
