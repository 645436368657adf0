//! `patchsync repair`: re-fetch every missing or damaged file.

use console::style;
use patchsync::{resolve_repair, TransferPipeline, TransferReport};

use crate::commands::common::{print_report, Settings};
use crate::error::CliError;
use crate::progress::drive;

pub fn run(settings: Settings) -> Result<(), CliError> {
    let report = drive(move |tx| -> Result<Option<TransferReport>, CliError> {
        let mut session = settings.session()?;
        let files = resolve_repair(&mut session, &tx)?;
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(TransferPipeline::run(&mut session, &files, &tx)?))
    })??;

    match report {
        Some(report) => print_report(&report),
        None => {
            println!("{}", style("All files verified.").green());
            Ok(())
        }
    }
}
