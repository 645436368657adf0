//! Settings shared by every subcommand.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use console::style;
use patchsync::tools::ToolPaths;
use patchsync::{EngineConfig, TransferReport, UpdateContext, UpdateSession};

use crate::error::CliError;

/// Fallback for `--server`.
pub const ENV_SERVER: &str = "PATCHSYNC_SERVER";

/// Fallback for `--install-dir`.
pub const ENV_INSTALL_DIR: &str = "PATCHSYNC_INSTALL_DIR";

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Patch server base URL [env: PATCHSYNC_SERVER]
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Root of the installed file tree [env: PATCHSYNC_INSTALL_DIR]
    #[arg(long, global = true)]
    pub install_dir: Option<PathBuf>,

    /// Where version.ini and the manifest database are cached
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Directory for temporary downloads
    #[arg(long, global = true)]
    pub temp_dir: Option<PathBuf>,

    /// Write a daily-rolling log file into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Per-attempt HTTP timeout in seconds
    #[arg(long, global = true, default_value_t = 300)]
    pub timeout: u64,

    /// Decompressor program (default: unelzma)
    #[arg(long, global = true)]
    pub decompressor: Option<PathBuf>,

    /// Archiver program (default: bsdtar)
    #[arg(long, global = true)]
    pub archiver: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Resolved inputs for an update cycle.
#[derive(Debug, Clone)]
pub struct Settings {
    pub context: UpdateContext,
    pub config: EngineConfig,
}

impl Settings {
    pub fn session(&self) -> Result<UpdateSession, CliError> {
        Ok(UpdateSession::new(self.context.clone(), self.config.clone())?)
    }
}

impl GlobalArgs {
    pub fn settings(&self) -> Result<Settings, CliError> {
        let server = self
            .server
            .clone()
            .or_else(|| env::var(ENV_SERVER).ok())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                CliError::Config(format!("no server URL: pass --server or set {}", ENV_SERVER))
            })?;
        let install_dir = self
            .install_dir
            .clone()
            .or_else(|| env::var_os(ENV_INSTALL_DIR).map(PathBuf::from))
            .ok_or_else(|| {
                CliError::Config(format!(
                    "no install directory: pass --install-dir or set {}",
                    ENV_INSTALL_DIR
                ))
            })?;
        let state_dir = self
            .state_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join("patchsync")))
            .unwrap_or_else(|| install_dir.clone());

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            decompressor: self.decompressor.clone().unwrap_or(defaults.decompressor),
            archiver: self.archiver.clone().unwrap_or(defaults.archiver),
        };

        let mut config = EngineConfig::default()
            .with_timeout(Duration::from_secs(self.timeout))
            .with_tools(tools);
        if let Some(temp_dir) = &self.temp_dir {
            config = config.with_temp_dir(temp_dir.clone());
        }

        Ok(Settings {
            context: UpdateContext::new(server, install_dir).with_state_dir(state_dir),
            config,
        })
    }
}

/// Print a transfer report; a partial failure becomes an error.
pub fn print_report(report: &TransferReport) -> Result<(), CliError> {
    let total = report.installed.len() + report.failures.len();
    println!(
        "{} {} of {} files",
        style("Installed").green().bold(),
        report.installed.len(),
        total
    );
    for failure in &report.failures {
        println!(
            "  {} {}: {}",
            style("failed").red(),
            failure.relative_path,
            failure.error
        );
    }
    if report.overall_success() {
        Ok(())
    } else {
        Err(CliError::Incomplete {
            failed: report.failures.len(),
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> GlobalArgs {
        GlobalArgs {
            server: Some("http://patch.example.com/".to_string()),
            install_dir: Some(PathBuf::from("/games/app")),
            state_dir: Some(PathBuf::from("/var/lib/patchsync")),
            temp_dir: Some(PathBuf::from("/var/tmp/patchsync")),
            log_dir: None,
            timeout: 30,
            decompressor: Some(PathBuf::from("/opt/unelzma")),
            archiver: None,
            verbose: false,
        }
    }

    #[test]
    fn test_settings_from_flags() {
        let settings = args().settings().unwrap();
        assert_eq!(settings.context.server_base_url, "http://patch.example.com");
        assert_eq!(settings.context.install_root, PathBuf::from("/games/app"));
        assert_eq!(settings.context.state_dir, PathBuf::from("/var/lib/patchsync"));
        assert_eq!(settings.config.timeout, Duration::from_secs(30));
        assert_eq!(settings.config.temp_dir, PathBuf::from("/var/tmp/patchsync"));
        assert_eq!(
            settings.config.tools.decompressor,
            PathBuf::from("/opt/unelzma")
        );
    }

    #[test]
    fn test_blank_server_is_rejected() {
        let mut args = args();
        args.server = Some("  ".to_string());
        assert!(matches!(args.settings(), Err(CliError::Config(_))));
    }
}
