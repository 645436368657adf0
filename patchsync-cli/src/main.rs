//! patchsync CLI - update, repair or bulk-install a file tree from a patch
//! server.

mod commands;
mod error;
mod progress;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;
use patchsync::logging::{init_logging, LogConfig};

use commands::bulk::BulkArgs;
use commands::common::GlobalArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "patchsync", version, about)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install files changed since the cached version
    Update,
    /// Check every file and re-fetch the missing or damaged ones
    Repair,
    /// Download and unpack the base install from a torrent
    Bulk(BulkArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut log_config = LogConfig::default()
        .with_verbose(cli.global.verbose)
        .with_stderr(cli.global.verbose);
    if let Some(dir) = &cli.global.log_dir {
        log_config = log_config.with_log_dir(dir);
    }
    let _guard = init_logging(&log_config)?;

    let settings = cli.global.settings()?;
    match cli.command {
        Command::Update => commands::update::run(settings),
        Command::Repair => commands::repair::run(settings),
        Command::Bulk(args) => commands::bulk::run(settings, args),
    }
}
