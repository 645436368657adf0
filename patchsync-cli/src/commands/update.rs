//! `patchsync update`: install everything changed since the cached version.

use console::style;
use patchsync::{resolve_update, TransferPipeline, TransferReport};
use tracing::info;

use crate::commands::common::{print_report, Settings};
use crate::error::CliError;
use crate::progress::drive;

pub fn run(settings: Settings) -> Result<(), CliError> {
    let outcome = drive(move |tx| -> Result<Option<TransferReport>, CliError> {
        let mut session = settings.session()?;
        let files = resolve_update(&mut session, &tx)?;
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(TransferPipeline::run(&mut session, &files, &tx)?))
    })??;

    match outcome {
        Some(report) => print_report(&report),
        None => {
            info!("Install is up to date");
            println!("{}", style("Already up to date.").green());
            Ok(())
        }
    }
}
