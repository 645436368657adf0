//! Bulk acquisition session.
//!
//! A session wraps one [`BulkDownloader`] and walks it through
//! probe → download → poll → close. Polling runs on a dedicated thread that
//! drains engine events at a fixed interval and turns them into progress
//! updates. [`BulkSession::close`] joins that thread before it returns, so no
//! progress is reported after a session is closed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::bulk::downloader::{validate_magnet, AddMode, BulkDownloader, BulkEvent, TorrentHandle};
use crate::bulk::error::{BulkError, BulkResult};
use crate::config::EngineConfig;
use crate::context::ensure_dir;
use crate::progress::{format_rate, format_size, ratio, Channel, ProgressSink, Reporter};

/// What a finished download produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOutcome {
    pub files: Vec<PathBuf>,
    pub total_bytes: u64,
}

#[derive(Debug, Default)]
struct BulkState {
    active: Option<TorrentHandle>,
    done: bool,
    success: bool,
    cancelled: bool,
    error_message: Option<String>,
    downloaded: u64,
    total: u64,
    files: Vec<PathBuf>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BulkState>,
    changed: Condvar,
    stop: AtomicBool,
    /// Set only by a [`BulkCanceller`]; closing a session does not set it.
    interrupted: AtomicBool,
}

impl Shared {
    fn cancel(&self) {
        self.stop.store(true, Ordering::Release);
        self.state.lock().cancelled = true;
        self.changed.notify_all();
    }
}

/// Stops a running session from another thread (for example a Ctrl-C
/// handler). The owner still calls [`BulkSession::close`].
#[derive(Clone)]
pub struct BulkCanceller {
    shared: Arc<Shared>,
}

impl BulkCanceller {
    pub fn cancel(&self) {
        self.shared.interrupted.store(true, Ordering::Release);
        self.shared.cancel();
    }

    /// Whether [`BulkCanceller::cancel`] has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.shared.interrupted.load(Ordering::Acquire)
    }
}

/// Overall-channel range covered by the download, for callers that chain
/// further stages after it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Span {
    start: f64,
    end: f64,
}

impl Span {
    fn scale(&self, fraction: f64) -> f64 {
        self.start + (self.end - self.start) * fraction
    }
}

pub struct BulkSession<D: BulkDownloader + 'static> {
    downloader: Arc<Mutex<D>>,
    shared: Arc<Shared>,
    poller: Option<JoinHandle<()>>,
    poll_interval: Duration,
    metadata_timeout: Duration,
    probe_dir: PathBuf,
    span: Span,
    closed: bool,
}

impl<D: BulkDownloader + 'static> BulkSession<D> {
    pub fn new(downloader: D, config: &EngineConfig) -> Self {
        Self {
            downloader: Arc::new(Mutex::new(downloader)),
            shared: Arc::new(Shared::default()),
            poller: None,
            poll_interval: config.poll_interval,
            metadata_timeout: config.metadata_timeout,
            probe_dir: config.temp_dir.join("probe"),
            span: Span {
                start: 0.0,
                end: 1.0,
            },
            closed: false,
        }
    }

    /// Report overall progress within `start..=end` instead of `0..=1`.
    pub fn with_overall_span(mut self, start: f64, end: f64) -> Self {
        self.span = Span { start, end };
        self
    }

    pub fn canceller(&self) -> BulkCanceller {
        BulkCanceller {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fetch only the torrent metadata and return the content size.
    ///
    /// The probe handle is removed again whatever the outcome.
    pub fn probe_size(&mut self, magnet: &str) -> BulkResult<u64> {
        self.ensure_idle()?;
        validate_magnet(magnet)?;
        ensure_dir(&self.probe_dir)?;

        let handle = self
            .downloader
            .lock()
            .add_magnet(magnet, &self.probe_dir, AddMode::Probe)?;
        debug!(handle = %handle, "Probing torrent size");

        let result = self.await_metadata(&handle);
        if let Err(e) = self.downloader.lock().remove(&handle) {
            warn!(handle = %handle, error = %e, "Failed to remove probe torrent");
        }

        if let Ok(total) = result {
            info!(total_bytes = total, "Torrent size probed");
        }
        result
    }

    fn await_metadata(&self, handle: &TorrentHandle) -> BulkResult<u64> {
        let deadline = Instant::now() + self.metadata_timeout;
        loop {
            let events = self.downloader.lock().pop_events()?;
            for event in events.into_iter().filter(|e| e.handle() == handle) {
                match event {
                    BulkEvent::MetadataReceived { total_bytes, .. } => return Ok(total_bytes),
                    BulkEvent::Error { message, .. } => return Err(BulkError::Torrent(message)),
                    _ => {}
                }
            }

            if self.shared.stop.load(Ordering::Acquire) {
                return Err(BulkError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BulkError::MetadataTimeout(self.metadata_timeout));
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Start the real download into `dest` and begin polling.
    pub fn start_download(
        &mut self,
        magnet: &str,
        dest: &Path,
        sink: Arc<dyn ProgressSink>,
    ) -> BulkResult<()> {
        self.ensure_idle()?;
        validate_magnet(magnet)?;
        ensure_dir(dest)?;

        let handle = self
            .downloader
            .lock()
            .add_magnet(magnet, dest, AddMode::Download)?;
        self.shared.state.lock().active = Some(handle.clone());
        info!(handle = %handle, dest = %dest.display(), "Bulk download started");

        let poller = Poller {
            downloader: Arc::clone(&self.downloader),
            shared: Arc::clone(&self.shared),
            handle,
            sink,
            interval: self.poll_interval,
            span: self.span,
        };
        let thread = thread::Builder::new()
            .name("patchsync-bulk-poll".to_string())
            .spawn(move || poller.run())
            .map_err(|e| BulkError::Engine(format!("failed to spawn polling thread: {}", e)))?;
        self.poller = Some(thread);
        Ok(())
    }

    /// Block until the download finishes, fails or the session is cancelled.
    pub fn wait(&self) -> BulkResult<BulkOutcome> {
        if self.closed {
            return Err(BulkError::Closed);
        }
        if self.poller.is_none() {
            return Err(BulkError::NotStarted);
        }

        let mut state = self.shared.state.lock();
        while !state.done && !state.cancelled {
            self.shared.changed.wait(&mut state);
        }

        if state.success {
            Ok(BulkOutcome {
                files: state.files.clone(),
                total_bytes: state.total,
            })
        } else if let Some(message) = &state.error_message {
            Err(BulkError::Torrent(message.clone()))
        } else {
            Err(BulkError::Closed)
        }
    }

    /// Whether the download has finished or failed.
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    /// Bytes downloaded and expected so far.
    pub fn progress(&self) -> (u64, u64) {
        let state = self.shared.state.lock();
        (state.downloaded, state.total)
    }

    /// The last error reported by the engine.
    pub fn error_message(&self) -> Option<String> {
        self.shared.state.lock().error_message.clone()
    }

    /// Stop polling, remove any active torrent and shut the engine down.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.cancel();

        if let Some(poller) = self.poller.take() {
            poller.thread().unpark();
            if poller.join().is_err() {
                warn!("Bulk polling thread panicked");
            }
        }

        let active = self.shared.state.lock().active.take();
        let mut downloader = self.downloader.lock();
        if let Some(handle) = active {
            if let Err(e) = downloader.remove(&handle) {
                warn!(handle = %handle, error = %e, "Failed to remove torrent");
            }
        }
        if let Err(e) = downloader.shutdown() {
            warn!(error = %e, "Failed to shut down bulk engine");
        }
        debug!("Bulk session closed");
    }

    fn ensure_idle(&self) -> BulkResult<()> {
        if self.closed {
            return Err(BulkError::Closed);
        }
        if self.poller.is_some() {
            return Err(BulkError::AlreadyStarted);
        }
        Ok(())
    }
}

impl<D: BulkDownloader + 'static> Drop for BulkSession<D> {
    fn drop(&mut self) {
        self.close();
    }
}

struct Poller<D: BulkDownloader> {
    downloader: Arc<Mutex<D>>,
    shared: Arc<Shared>,
    handle: TorrentHandle,
    sink: Arc<dyn ProgressSink>,
    interval: Duration,
    span: Span,
}

impl<D: BulkDownloader> Poller<D> {
    fn run(self) {
        let reporter = Reporter::new(self.sink.as_ref());

        while !self.shared.stop.load(Ordering::Acquire) {
            let events = self.downloader.lock().pop_events();
            match events {
                Ok(events) => {
                    for event in events.into_iter().filter(|e| e.handle() == &self.handle) {
                        self.apply(event, &reporter);
                    }
                }
                Err(e) => self.fail(e.to_string(), &reporter),
            }

            if self.shared.state.lock().done {
                break;
            }
            thread::park_timeout(self.interval);
        }
    }

    fn apply(&self, event: BulkEvent, reporter: &Reporter<'_>) {
        match event {
            BulkEvent::MetadataReceived { total_bytes, .. } => {
                debug!(total_bytes, "Torrent metadata received");
                self.shared.state.lock().total = total_bytes;
            }
            BulkEvent::Progress {
                downloaded,
                total,
                rate,
                ..
            } => {
                {
                    let mut state = self.shared.state.lock();
                    state.downloaded = downloaded;
                    state.total = total;
                }
                let fraction = ratio(downloaded, total);
                let label = format!(
                    "Downloading: {:.2}% ( {} / {} ) {}",
                    fraction * 100.0,
                    format_size(downloaded),
                    format_size(total),
                    format_rate(rate)
                );
                reporter.transfer(fraction, label.clone());
                reporter.overall(self.span.scale(fraction), label);
            }
            BulkEvent::Finished { files, .. } => {
                info!(files = files.len(), "Bulk download finished");
                {
                    let mut state = self.shared.state.lock();
                    state.downloaded = state.total;
                    state.files = files;
                    state.success = true;
                    state.done = true;
                }
                self.shared.changed.notify_all();
                reporter.overall(self.span.end, "Download complete.");
                reporter.done(Channel::Transfer);
            }
            BulkEvent::Error { message, .. } => {
                if let Err(e) = self.downloader.lock().remove(&self.handle) {
                    warn!(handle = %self.handle, error = %e, "Failed to remove failed torrent");
                }
                self.shared.state.lock().active = None;
                self.fail(message, reporter);
            }
        }
    }

    fn fail(&self, message: String, reporter: &Reporter<'_>) {
        warn!(handle = %self.handle, error = %message, "Bulk download failed");
        {
            let mut state = self.shared.state.lock();
            state.error_message = Some(message.clone());
            state.done = true;
        }
        self.shared.changed.notify_all();
        reporter.error(Channel::Overall, message);
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::{handle_for, ScriptedDownloader};
    use super::*;
    use crate::progress::{ProgressEvent, ProgressUpdate};
    use std::sync::mpsc;
    use tempfile::TempDir;

    const MAGNET: &str = "magnet:?xt=urn:btih:c9e15763f722f23e98a29decdfae341b98d53056";

    fn config(temp: &TempDir) -> EngineConfig {
        EngineConfig::default()
            .with_temp_dir(temp.path().join("tmp"))
            .with_poll_interval(Duration::from_millis(5))
            .with_metadata_timeout(Duration::from_millis(100))
    }

    fn download() -> TorrentHandle {
        handle_for(AddMode::Download)
    }

    fn progress(downloaded: u64, total: u64) -> BulkEvent {
        BulkEvent::Progress {
            handle: download(),
            downloaded,
            total,
            rate: 1024,
        }
    }

    #[test]
    fn test_probe_returns_size_and_removes_handle() {
        let temp = TempDir::new().unwrap();
        let (downloader, calls) = ScriptedDownloader::new(vec![
            vec![],
            vec![BulkEvent::MetadataReceived {
                handle: handle_for(AddMode::Probe),
                total_bytes: 4096,
            }],
        ]);
        let mut session = BulkSession::new(downloader, &config(&temp));

        assert_eq!(session.probe_size(MAGNET).unwrap(), 4096);
        assert_eq!(*calls.lock(), vec!["add probe", "remove probe"]);
    }

    #[test]
    fn test_probe_times_out() {
        let temp = TempDir::new().unwrap();
        let (downloader, calls) = ScriptedDownloader::new(vec![]);
        let mut session = BulkSession::new(downloader, &config(&temp));

        let result = session.probe_size(MAGNET);
        assert!(matches!(result, Err(BulkError::MetadataTimeout(_))));
        assert!(calls.lock().contains(&"remove probe".to_string()));
    }

    #[test]
    fn test_invalid_magnet_is_rejected_before_engine_call() {
        let temp = TempDir::new().unwrap();
        let (downloader, calls) = ScriptedDownloader::new(vec![]);
        let mut session = BulkSession::new(downloader, &config(&temp));

        let result = session.start_download("not-a-magnet", temp.path(), Arc::new(crate::progress::NullSink));
        assert!(matches!(result, Err(BulkError::InvalidMagnet(_))));
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_download_to_completion() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("dl/client.tar");
        let (downloader, calls) = ScriptedDownloader::new(vec![
            vec![BulkEvent::MetadataReceived {
                handle: download(),
                total_bytes: 200,
            }],
            vec![progress(100, 200)],
            vec![BulkEvent::Finished {
                handle: download(),
                files: vec![archive.clone()],
            }],
        ]);
        let mut session = BulkSession::new(downloader, &config(&temp));
        let (tx, rx) = mpsc::channel::<ProgressEvent>();

        session
            .start_download(MAGNET, &temp.path().join("dl"), Arc::new(tx))
            .unwrap();
        let outcome = session.wait().unwrap();
        session.close();

        assert_eq!(outcome.files, vec![archive]);
        assert_eq!(outcome.total_bytes, 200);
        assert!(session.error_message().is_none());
        assert_eq!(
            *calls.lock(),
            vec!["add download", "remove download", "shutdown"]
        );

        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            &e.update,
            ProgressUpdate::Progress { fraction, label }
                if e.channel == Channel::Transfer && *fraction == 0.5 && label.starts_with("Downloading: 50.00%")
        )));
        assert!(events
            .iter()
            .any(|e| e.channel == Channel::Transfer && e.update == ProgressUpdate::Done));
    }

    #[test]
    fn test_engine_error_is_recorded_and_torrent_removed() {
        let temp = TempDir::new().unwrap();
        let (downloader, calls) = ScriptedDownloader::new(vec![
            vec![progress(10, 200)],
            vec![BulkEvent::Error {
                handle: download(),
                message: "tracker unreachable".to_string(),
            }],
        ]);
        let mut session = BulkSession::new(downloader, &config(&temp));

        session
            .start_download(MAGNET, temp.path(), Arc::new(crate::progress::NullSink))
            .unwrap();
        let result = session.wait();
        session.close();

        assert!(matches!(result, Err(BulkError::Torrent(ref m)) if m == "tracker unreachable"));
        assert_eq!(session.error_message().as_deref(), Some("tracker unreachable"));
        // Removed once by the poller; close has nothing left to remove.
        assert_eq!(
            *calls.lock(),
            vec!["add download", "remove download", "shutdown"]
        );
    }

    #[test]
    fn test_close_is_idempotent_and_silences_progress() {
        let temp = TempDir::new().unwrap();
        let script = (0..10_000).map(|n| vec![progress(n, 20_000)]).collect();
        let (downloader, calls) = ScriptedDownloader::new(script);
        let mut session = BulkSession::new(downloader, &config(&temp));
        let (tx, rx) = mpsc::channel::<ProgressEvent>();

        session
            .start_download(MAGNET, temp.path(), Arc::new(tx))
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        session.close();
        let seen = rx.try_iter().count();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(rx.try_iter().count(), 0, "progress after close ({} before)", seen);

        session.close();
        let shutdowns = calls.lock().iter().filter(|c| *c == "shutdown").count();
        assert_eq!(shutdowns, 1);
        assert!(matches!(session.wait(), Err(BulkError::Closed)));
    }

    #[test]
    fn test_wait_before_start_and_after_close() {
        let temp = TempDir::new().unwrap();
        let (downloader, _calls) = ScriptedDownloader::new(vec![]);
        let mut session = BulkSession::new(downloader, &config(&temp));

        assert!(matches!(session.wait(), Err(BulkError::NotStarted)));
        session.close();
        assert!(matches!(session.wait(), Err(BulkError::Closed)));
        assert!(!session.canceller().is_cancelled());
    }

    #[test]
    fn test_progress_and_done_track_the_poller() {
        let temp = TempDir::new().unwrap();
        let (downloader, _calls) = ScriptedDownloader::new(vec![
            vec![progress(50, 200)],
            vec![BulkEvent::Finished {
                handle: download(),
                files: vec![],
            }],
        ]);
        let mut session = BulkSession::new(downloader, &config(&temp));
        assert!(!session.is_done());
        assert_eq!(session.progress(), (0, 0));

        session
            .start_download(MAGNET, temp.path(), Arc::new(crate::progress::NullSink))
            .unwrap();
        session.wait().unwrap();

        assert!(session.is_done());
        // A finished download counts as fully downloaded.
        assert_eq!(session.progress(), (200, 200));
    }

    #[test]
    fn test_second_start_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (downloader, _calls) = ScriptedDownloader::new(vec![]);
        let mut session = BulkSession::new(downloader, &config(&temp));

        session
            .start_download(MAGNET, temp.path(), Arc::new(crate::progress::NullSink))
            .unwrap();
        let again = session.start_download(MAGNET, temp.path(), Arc::new(crate::progress::NullSink));
        assert!(matches!(again, Err(BulkError::AlreadyStarted)));
    }

    #[test]
    fn test_canceller_wakes_waiter() {
        let temp = TempDir::new().unwrap();
        let (downloader, _calls) = ScriptedDownloader::new(vec![]);
        let mut session = BulkSession::new(downloader, &config(&temp));
        session
            .start_download(MAGNET, temp.path(), Arc::new(crate::progress::NullSink))
            .unwrap();

        let canceller = session.canceller();
        let cancel = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert!(matches!(session.wait(), Err(BulkError::Closed)));
        cancel.join().unwrap();
        assert!(session.canceller().is_cancelled());
    }
}
