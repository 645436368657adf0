//! Integration tests for bulk acquisition with an in-process engine and a
//! shell-script archiver.
//!
//! Run with: `cargo test --test bulk_acquire`

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use patchsync::bulk::acquire::STAGING_DIR;
use patchsync::bulk::{
    acquire_base_files, acquire_with_session, AddMode, BulkDownloader, BulkError, BulkEvent,
    BulkResult, BulkSession, TorrentHandle,
};
use patchsync::error::{UpdateError, UpdateResult};
use patchsync::preflight::SpaceProbe;
use patchsync::tools::ToolPaths;
use patchsync::progress::FnSink;
use patchsync::{Channel, EngineConfig, ProgressEvent, ProgressUpdate, UpdateContext, UpdateSession};

const MAGNET: &str = "magnet:?xt=urn:btih:c9e15763f722f23e98a29decdfae341b98d53056&dn=client.tar";

const CONTENT_BYTES: u64 = 1_000;

/// Answers a probe with metadata and completes a download immediately,
/// leaving a placeholder archive in the save path.
struct InstantEngine {
    pending: Vec<BulkEvent>,
    calls: Arc<Mutex<Vec<String>>>,
    downloads: Arc<Mutex<Vec<PathBuf>>>,
}

impl InstantEngine {
    fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                pending: Vec::new(),
                calls: Arc::clone(&calls),
                downloads: Arc::default(),
            },
            calls,
        )
    }

    /// Save paths of every download added so far.
    fn downloads(&self) -> Arc<Mutex<Vec<PathBuf>>> {
        Arc::clone(&self.downloads)
    }
}

impl BulkDownloader for InstantEngine {
    fn add_magnet(&mut self, _magnet: &str, save_path: &Path, mode: AddMode) -> BulkResult<TorrentHandle> {
        match mode {
            AddMode::Probe => {
                let handle = TorrentHandle("probe".to_string());
                self.calls.lock().push("add probe".to_string());
                self.pending.push(BulkEvent::MetadataReceived {
                    handle: handle.clone(),
                    total_bytes: CONTENT_BYTES,
                });
                Ok(handle)
            }
            AddMode::Download => {
                let handle = TorrentHandle("download".to_string());
                self.calls.lock().push("add download".to_string());
                self.downloads.lock().push(save_path.to_path_buf());
                let archive = save_path.join("client.tar");
                fs::write(&archive, b"packed").unwrap();
                self.pending.push(BulkEvent::Progress {
                    handle: handle.clone(),
                    downloaded: CONTENT_BYTES,
                    total: CONTENT_BYTES,
                    rate: 4096,
                });
                self.pending.push(BulkEvent::Finished {
                    handle: handle.clone(),
                    files: vec![archive],
                });
                Ok(handle)
            }
        }
    }

    fn pop_events(&mut self) -> BulkResult<Vec<BulkEvent>> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn remove(&mut self, handle: &TorrentHandle) -> BulkResult<()> {
        self.calls.lock().push(format!("remove {}", handle));
        Ok(())
    }

    fn shutdown(&mut self) -> BulkResult<()> {
        self.calls.lock().push("shutdown".to_string());
        Ok(())
    }
}

struct FixedProbe(u64);

impl SpaceProbe for FixedProbe {
    fn free_bytes(&self, _path: &Path) -> UpdateResult<u64> {
        Ok(self.0)
    }
}

/// Plenty of space; remembers every path it was asked about.
#[derive(Clone, Default)]
struct RecordingProbe {
    asked: Arc<Mutex<Vec<PathBuf>>>,
}

impl SpaceProbe for RecordingProbe {
    fn free_bytes(&self, path: &Path) -> UpdateResult<u64> {
        self.asked.lock().push(path.to_path_buf());
        Ok(u64::MAX / 4)
    }
}

/// A fake bsdtar: lists two entries and "extracts" them into `-C <dest>`.
fn fake_archiver(dir: &Path) -> PathBuf {
    let path = dir.join("fake-bsdtar");
    let script = r#"#!/bin/sh
case "$1" in
  -tvf)
    printf '%s\n' \
      '-rw-r--r--  0 u g  400 Mar  3 10:00 client/S1Game/S1Engine.ini' \
      '-rw-r--r--  0 u g  600 Mar  3 10:00 client/Binaries/app.exe'
    ;;
  -xvf)
    mkdir -p "$4/S1Game" "$4/Binaries"
    printf 'ini' > "$4/S1Game/S1Engine.ini"
    echo 'x client/S1Game/S1Engine.ini' >&2
    printf 'exe' > "$4/Binaries/app.exe"
    echo 'x client/Binaries/app.exe' >&2
    ;;
esac
"#;
    install_script(&path, script);
    path
}

/// A fake bsdtar whose extraction reports one entry and then hangs.
fn stalling_archiver(dir: &Path) -> PathBuf {
    let path = dir.join("stalling-bsdtar");
    let script = r#"#!/bin/sh
case "$1" in
  -tvf)
    printf '%s\n' '-rw-r--r--  0 u g  400 Mar  3 10:00 client/S1Game/S1Engine.ini'
    ;;
  -xvf)
    echo 'x client/S1Game/S1Engine.ini' >&2
    exec sleep 30
    ;;
esac
"#;
    install_script(&path, script);
    path
}

fn install_script(path: &Path, script: &str) {
    fs::write(path, script).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn session_with(
    temp: &TempDir,
    probe: impl SpaceProbe + 'static,
    archiver: PathBuf,
) -> UpdateSession {
    let tools = ToolPaths {
        decompressor: PathBuf::from("unelzma"),
        archiver,
    };
    let config = EngineConfig::default()
        .with_temp_dir(temp.path().join("tmp"))
        .with_tools(tools)
        .with_poll_interval(Duration::from_millis(5))
        .with_metadata_timeout(Duration::from_secs(5));
    let ctx = UpdateContext::new("http://patch.test", temp.path().join("install"));
    UpdateSession::new(ctx, config)
        .unwrap()
        .with_space_probe(probe)
}

fn session(temp: &TempDir, free: u64) -> UpdateSession {
    session_with(temp, FixedProbe(free), fake_archiver(temp.path()))
}

#[test]
fn test_acquire_downloads_and_extracts_into_install_root() {
    let temp = TempDir::new().unwrap();
    let session = session(&temp, u64::MAX / 4);
    let (engine, calls) = InstantEngine::new();
    let (tx, rx) = mpsc::channel::<ProgressEvent>();

    let report = acquire_base_files(&session, engine, MAGNET, Arc::new(tx)).unwrap();

    assert_eq!(report.downloaded_bytes, CONTENT_BYTES);
    assert_eq!(report.extracted_entries, 2);
    let install = temp.path().join("install");
    assert_eq!(fs::read(install.join("Binaries/app.exe")).unwrap(), b"exe");
    assert!(!install.join(STAGING_DIR).join("client.tar").exists());
    assert!(!install.join(STAGING_DIR).exists());
    assert_eq!(
        *calls.lock(),
        vec![
            "add probe",
            "remove probe",
            "add download",
            "remove download",
            "shutdown"
        ]
    );

    let overall: Vec<f64> = rx
        .try_iter()
        .filter(|e| e.channel == Channel::Overall)
        .filter_map(|e| match e.update {
            ProgressUpdate::Progress { fraction, .. } => Some(fraction),
            _ => None,
        })
        .collect();
    assert!(overall.contains(&0.5));
    assert!(overall.contains(&0.75));
    assert_eq!(overall.last(), Some(&1.0));
    assert!(overall.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_acquire_rejects_when_bulk_margin_not_met() {
    let temp = TempDir::new().unwrap();
    // 2.5 x 1000 = 2500 required; exactly 2500 free is not enough.
    let session = session(&temp, 2_500);
    let (engine, calls) = InstantEngine::new();
    let (tx, rx) = mpsc::channel::<ProgressEvent>();

    let result = acquire_base_files(&session, engine, MAGNET, Arc::new(tx));

    assert!(matches!(
        result,
        Err(BulkError::Update(UpdateError::InsufficientSpace { required: 2_500, .. }))
    ));
    assert!(!calls.lock().contains(&"add download".to_string()));
    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e.update, ProgressUpdate::Error { .. })));
}

#[test]
fn test_acquire_with_invalid_magnet_never_reaches_engine() {
    let temp = TempDir::new().unwrap();
    let session = session(&temp, u64::MAX / 4);
    let (engine, calls) = InstantEngine::new();
    let bulk = BulkSession::new(engine, session.config());

    let result = acquire_with_session(
        &session,
        bulk,
        "http://example.com/client.torrent",
        Arc::new(patchsync::progress::NullSink),
    );

    assert!(matches!(result, Err(BulkError::InvalidMagnet(_))));
    assert_eq!(*calls.lock(), vec!["shutdown"]);
}

/// The archive is written under the install root, and the bulk preflight
/// asks about that same location.
#[test]
fn test_bulk_preflight_covers_the_volume_receiving_the_archive() {
    let temp = TempDir::new().unwrap();
    let probe = RecordingProbe::default();
    let session = session_with(&temp, probe.clone(), fake_archiver(temp.path()));
    let (engine, _calls) = InstantEngine::new();
    let downloads = engine.downloads();

    acquire_base_files(&session, engine, MAGNET, Arc::new(patchsync::progress::NullSink)).unwrap();

    let staging = temp.path().join("install").join(STAGING_DIR);
    assert_eq!(*downloads.lock(), vec![staging.clone()]);
    assert!(!staging.starts_with(temp.path().join("tmp")));
    assert_eq!(probe.asked.lock().first(), Some(&staging));
}

#[test]
fn test_cancel_during_extraction_stops_the_archiver() {
    let temp = TempDir::new().unwrap();
    let session = session_with(&temp, FixedProbe(u64::MAX / 4), stalling_archiver(temp.path()));
    let (engine, _calls) = InstantEngine::new();
    let bulk = BulkSession::new(engine, session.config());
    let canceller = bulk.canceller();
    let sink = FnSink(move |event: ProgressEvent| {
        if let ProgressUpdate::Progress { label, .. } = &event.update {
            if label.starts_with("Extracting file") {
                canceller.cancel();
            }
        }
    });
    let started = Instant::now();

    let result = acquire_with_session(&session, bulk, MAGNET, Arc::new(sink));

    assert!(matches!(result, Err(BulkError::Closed)));
    assert!(started.elapsed() < Duration::from_secs(20));
}
