//! `patchsync bulk`: fetch the base install over BitTorrent, then repair.
//!
//! A failed acquisition falls back to a per-file repair. Ctrl-C during the
//! torrent or extraction phase stops the bulk session; a second Ctrl-C, or
//! one after the bulk phase, exits the process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use clap::Args;
use console::style;
use patchsync::bulk::{
    acquire_with_session, AcquireReport, Aria2Downloader, BulkCanceller, BulkError, BulkSession,
};
use tracing::{info, warn};

use crate::commands::common::Settings;
use crate::commands::repair;
use crate::error::CliError;
use crate::progress::drive;

/// Exit status after an interrupt that ends the process.
const INTERRUPTED_EXIT: i32 = 130;

#[derive(Debug, Args)]
pub struct BulkArgs {
    /// Magnet URI of the base archive
    #[arg(long)]
    pub magnet: String,

    /// aria2c binary
    #[arg(long, default_value = "aria2c")]
    pub aria2c: PathBuf,

    /// Stop after extraction instead of verifying with a repair
    #[arg(long)]
    pub no_repair: bool,
}

/// Ctrl-C bookkeeping shared with the signal handler.
#[derive(Debug, Default)]
struct Interrupts {
    bulk_active: AtomicBool,
    received: AtomicU32,
}

#[derive(Debug, PartialEq, Eq)]
enum SignalAction {
    CancelBulk,
    Exit,
}

fn signal_action(bulk_active: bool, received: u32) -> SignalAction {
    if bulk_active && received == 1 {
        SignalAction::CancelBulk
    } else {
        SignalAction::Exit
    }
}

#[derive(Debug, PartialEq, Eq)]
enum NextStep {
    Verify,
    Stop,
}

pub fn run(settings: Settings, args: BulkArgs) -> Result<(), CliError> {
    let mut settings = settings;
    settings.config = settings.config.with_aria2_binary(args.aria2c);

    let interrupts = Arc::new(Interrupts::default());
    let result = acquire(&settings, &args.magnet, &interrupts);
    interrupts.bulk_active.store(false, Ordering::SeqCst);

    match after_acquire(result, args.no_repair)? {
        NextStep::Verify => {
            println!("Verifying installed files...");
            repair::run(settings)
        }
        NextStep::Stop => Ok(()),
    }
}

fn acquire(
    settings: &Settings,
    magnet: &str,
    interrupts: &Arc<Interrupts>,
) -> Result<AcquireReport, CliError> {
    let engine = Aria2Downloader::spawn(&settings.config.aria2_binary)?;
    let bulk = BulkSession::new(engine, &settings.config);
    install_handler(bulk.canceller(), Arc::clone(interrupts))?;

    let magnet = magnet.to_string();
    let worker_settings = settings.clone();
    drive(move |tx| -> Result<_, CliError> {
        let session = worker_settings.session()?;
        Ok(acquire_with_session(&session, bulk, &magnet, Arc::new(tx))?)
    })?
}

fn install_handler(canceller: BulkCanceller, interrupts: Arc<Interrupts>) -> Result<(), CliError> {
    interrupts.bulk_active.store(true, Ordering::SeqCst);

    ctrlc::set_handler(move || {
        let received = interrupts.received.fetch_add(1, Ordering::SeqCst) + 1;
        let bulk_active = interrupts.bulk_active.load(Ordering::SeqCst);
        match signal_action(bulk_active, received) {
            SignalAction::CancelBulk => {
                println!();
                println!("Received interrupt, stopping bulk download...");
                canceller.cancel();
            }
            SignalAction::Exit => {
                eprintln!("Interrupted.");
                std::process::exit(INTERRUPTED_EXIT);
            }
        }
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))
}

/// Decide how to continue once the bulk phase has ended. Any bulk failure
/// other than an interrupt falls back to a per-file repair.
fn after_acquire(
    result: Result<AcquireReport, CliError>,
    no_repair: bool,
) -> Result<NextStep, CliError> {
    match result {
        Ok(report) => {
            info!(
                bytes = report.downloaded_bytes,
                entries = report.extracted_entries,
                "Bulk acquisition finished"
            );
            println!(
                "{} {} entries",
                style("Extracted").green().bold(),
                report.extracted_entries
            );
            Ok(if no_repair {
                NextStep::Stop
            } else {
                NextStep::Verify
            })
        }
        Err(CliError::Bulk(BulkError::Closed)) => Err(CliError::Bulk(BulkError::Closed)),
        Err(CliError::Bulk(e)) if !no_repair => {
            warn!(error = %e, "Bulk acquisition failed, falling back to per-file repair");
            println!(
                "{} bulk download failed ({}), downloading files individually",
                style("Warning:").yellow().bold(),
                e
            );
            Ok(NextStep::Verify)
        }
        Err(e) => Err(e),
    }
}
