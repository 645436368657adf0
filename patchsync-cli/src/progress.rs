//! Terminal rendering of engine progress.
//!
//! The engine runs on a worker thread and reports through an mpsc channel;
//! the main thread owns the bars and drains the channel until every sender
//! is gone.

use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use patchsync::{Channel, ProgressEvent, ProgressUpdate};

use crate::error::CliError;

/// Bar resolution; fractions are mapped onto `0..=SCALE`.
const SCALE: u64 = 1000;

pub struct ProgressDisplay {
    multi: MultiProgress,
    overall: ProgressBar,
    transfer: ProgressBar,
}

impl ProgressDisplay {
    fn new() -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(bar("{spinner:.green} [{bar:30.green/white}] {percent:>3}% {wide_msg}"));
        let transfer = multi.add(bar("  [{bar:30.cyan/blue}] {wide_msg}"));
        overall.enable_steady_tick(Duration::from_millis(100));
        Self {
            multi,
            overall,
            transfer,
        }
    }

    fn target(&self, channel: Channel) -> &ProgressBar {
        match channel {
            Channel::Overall => &self.overall,
            Channel::Transfer => &self.transfer,
        }
    }

    pub fn apply(&self, event: ProgressEvent) {
        let target = self.target(event.channel);
        match event.update {
            ProgressUpdate::Progress { fraction, label } => {
                target.set_position((fraction * SCALE as f64).round() as u64);
                target.set_message(label);
            }
            ProgressUpdate::Error { message } => {
                let _ = self
                    .multi
                    .println(format!("{} {}", style("error:").red().bold(), message));
            }
            ProgressUpdate::Done => target.set_position(SCALE),
        }
    }

    pub fn finish(&self) {
        self.transfer.finish_and_clear();
        self.overall.finish();
    }
}

fn bar(template: &str) -> ProgressBar {
    let bar = ProgressBar::new(SCALE);
    let style = ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    bar.set_style(style);
    bar
}

/// Run `work` on a worker thread, rendering its progress until it finishes.
pub fn drive<T, F>(work: F) -> Result<T, CliError>
where
    T: Send + 'static,
    F: FnOnce(Sender<ProgressEvent>) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("patchsync-worker".to_string())
        .spawn(move || work(tx))
        .map_err(|e| CliError::Worker(e.to_string()))?;

    let display = ProgressDisplay::new();
    for event in rx {
        display.apply(event);
    }
    display.finish();

    worker
        .join()
        .map_err(|_| CliError::Worker("panicked".to_string()))
}
