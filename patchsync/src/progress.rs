//! Progress reporting for update cycles.
//!
//! Progress flows to the caller as tagged [`ProgressEvent`]s on two channels:
//!
//! - [`Channel::Overall`]: batch/stage progress ("Downloading file 3 of 10: ...")
//! - [`Channel::Transfer`]: live byte counts and rates for the current transfer
//!
//! Errors travel as [`ProgressUpdate::Error`] rather than as a magic fraction,
//! so a caller never has to tell "0% done" apart from "failed".

use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

/// Default cadence for live transfer samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(150);

/// Which progress display an event is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Batch/stage progress.
    Overall,
    /// Fine-grained transfer progress for the current item.
    Transfer,
}

/// A single progress update.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Normal progress; `fraction` is always within `0.0..=1.0`.
    Progress { fraction: f64, label: String },
    /// The operation failed; `message` is human-readable.
    Error { message: String },
    /// The operation finished.
    Done,
}

/// A progress update addressed to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub channel: Channel,
    pub update: ProgressUpdate,
}

/// Receiver of progress events.
///
/// Implementations must be cheap; events are sent from the worker thread
/// (and, for bulk acquisition, from the polling thread).
pub trait ProgressSink: Send + Sync {
    fn send(&self, event: ProgressEvent);
}

impl ProgressSink for Sender<ProgressEvent> {
    fn send(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is watching any more.
        let _ = Sender::send(self, event);
    }
}

/// Adapts a closure into a [`ProgressSink`].
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn send(&self, event: ProgressEvent) {
        (self.0)(event)
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn send(&self, _event: ProgressEvent) {}
}

/// Convenience wrapper used by the engine to emit events.
#[derive(Clone, Copy)]
pub struct Reporter<'a> {
    sink: &'a dyn ProgressSink,
}

impl<'a> Reporter<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self { sink }
    }

    /// Report overall progress.
    pub fn overall(&self, fraction: f64, label: impl Into<String>) {
        self.progress(Channel::Overall, fraction, label);
    }

    /// Report transfer progress.
    pub fn transfer(&self, fraction: f64, label: impl Into<String>) {
        self.progress(Channel::Transfer, fraction, label);
    }

    /// Report progress on an explicit channel.
    pub fn progress(&self, channel: Channel, fraction: f64, label: impl Into<String>) {
        self.sink.send(ProgressEvent {
            channel,
            update: ProgressUpdate::Progress {
                fraction: clamp_fraction(fraction),
                label: label.into(),
            },
        });
    }

    /// Report an error on a channel without ending the operation.
    pub fn error(&self, channel: Channel, message: impl Into<String>) {
        self.sink.send(ProgressEvent {
            channel,
            update: ProgressUpdate::Error {
                message: message.into(),
            },
        });
    }

    /// Report a terminal failure: an error event followed by a final 1.0
    /// overall update carrying the same message.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.error(Channel::Overall, message.clone());
        self.overall(1.0, message);
    }

    /// Report completion on a channel.
    pub fn done(&self, channel: Channel) {
        self.sink.send(ProgressEvent {
            channel,
            update: ProgressUpdate::Done,
        });
    }
}

/// Clamp a fraction into `0.0..=1.0`, mapping NaN to zero.
pub fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

/// `done / total` as a fraction. A zero total counts as complete.
pub fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    clamp_fraction(done as f64 / total as f64)
}

/// Format a byte count as KB below one megabyte, MB above.
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    }
}

/// Format a byte rate as kilobits or megabits per second.
pub fn format_rate(bytes_per_second: u64) -> String {
    let bits = bytes_per_second as f64 * 8.0;
    if bits < 1024.0 * 1024.0 {
        format!("{:.2} kb/s", bits / 1024.0)
    } else {
        format!("{:.2} Mb/s", bits / (1024.0 * 1024.0))
    }
}

/// A point-in-time view of one file's transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub bytes_now: u64,
    pub bytes_total: u64,
    pub rate_bps: u64,
    pub label: String,
}

impl TransferProgress {
    pub fn new(bytes_now: u64, bytes_total: u64, rate_bps: u64) -> Self {
        let label = format!(
            "Progress: ( {} / {} ) {}",
            format_size(bytes_now),
            format_size(bytes_total),
            format_rate(rate_bps)
        );
        Self {
            bytes_now,
            bytes_total,
            rate_bps,
            label,
        }
    }

    /// Fraction of the transfer completed.
    pub fn fraction(&self) -> f64 {
        ratio(self.bytes_now, self.bytes_total)
    }
}

/// Rate-limits transfer progress to a fixed cadence.
///
/// The first sample is produced once `interval` has elapsed since the
/// transfer started, then at most once per `interval`.
#[derive(Debug)]
pub struct TransferSampler {
    started: Instant,
    last: Instant,
    interval: Duration,
}

impl TransferSampler {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub fn starting_at(started: Instant, interval: Duration) -> Self {
        Self {
            started,
            last: started,
            interval,
        }
    }

    /// Produce a sample if the cadence allows one at `now`.
    pub fn sample(&mut self, now: Instant, bytes_now: u64, bytes_total: u64) -> Option<TransferProgress> {
        if now.saturating_duration_since(self.last) < self.interval {
            return None;
        }
        self.last = now;

        let elapsed_ms = now.saturating_duration_since(self.started).as_millis();
        let rate = if elapsed_ms > 0 {
            (u128::from(bytes_now) * 1000 / elapsed_ms) as u64
        } else {
            0
        };
        Some(TransferProgress::new(bytes_now, bytes_total, rate))
    }
}
