//! [`BulkDownloader`] backed by an `aria2c` child process.
//!
//! The engine is started with its JSON-RPC interface bound to a free
//! localhost port, guarded by a per-launch secret, and driven over the
//! blocking HTTP client. Adding a magnet
//! first creates a metadata download; once that completes, aria2 reports
//! the real download through `followedBy`, and the handle tracks it from
//! then on.

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use rand::distr::{Alphanumeric, SampleString};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bulk::downloader::{AddMode, BulkDownloader, BulkEvent, TorrentHandle};
use crate::bulk::error::{BulkError, BulkResult};

/// How long to wait for the RPC interface after spawning the engine.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Launches tried before giving up; another process can take the chosen
/// port between picking it and aria2c binding it.
const SPAWN_ATTEMPTS: u32 = 3;

const SECRET_LEN: usize = 32;

/// aria2 names the metadata pseudo-file of a magnet download like this.
const METADATA_PREFIX: &str = "[METADATA]";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// The subset of `aria2.tellStatus` this engine uses.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DownloadStatus {
    status: String,
    total_length: String,
    completed_length: String,
    download_speed: String,
    followed_by: Vec<String>,
    error_message: String,
    error_code: String,
    files: Vec<StatusFile>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
struct StatusFile {
    path: String,
}

impl DownloadStatus {
    fn number(field: &str) -> u64 {
        field.parse().unwrap_or(0)
    }

    fn is_metadata(&self) -> bool {
        self.files
            .first()
            .is_some_and(|f| f.path.starts_with(METADATA_PREFIX))
    }
}

/// Per-handle tracking state.
#[derive(Debug, Clone)]
struct Tracked {
    /// Every gid this handle has followed, oldest first.
    gids: Vec<String>,
    metadata_sent: bool,
    /// Reached a terminal state; kept until removed so its gids can be purged.
    finished: bool,
}

impl Tracked {
    fn new(gid: String) -> Self {
        Self {
            gids: vec![gid],
            metadata_sent: false,
            finished: false,
        }
    }

    fn current(&self) -> &str {
        self.gids.last().map(String::as_str).unwrap_or_default()
    }
}

/// What one status snapshot means for a handle.
#[derive(Debug, PartialEq)]
enum Step {
    /// Switch to the gid that replaced the finished metadata download.
    Follow(String),
    Events(Vec<BulkEvent>),
    /// Emit these events and stop tracking the handle.
    Finish(Vec<BulkEvent>),
}

fn translate(handle: &TorrentHandle, tracked: &mut Tracked, status: &DownloadStatus) -> Step {
    let metadata = status.is_metadata();
    let total = DownloadStatus::number(&status.total_length);

    match status.status.as_str() {
        "complete" if metadata => match status.followed_by.first() {
            Some(next) => Step::Follow(next.clone()),
            None => Step::Finish(vec![BulkEvent::Error {
                handle: handle.clone(),
                message: "metadata download finished without content".to_string(),
            }]),
        },
        "complete" => {
            let files = status
                .files
                .iter()
                .filter(|f| !f.path.is_empty())
                .map(|f| PathBuf::from(&f.path))
                .collect();
            let mut events = metadata_event(handle, tracked, total, metadata);
            events.push(BulkEvent::Finished {
                handle: handle.clone(),
                files,
            });
            Step::Finish(events)
        }
        "error" => {
            let message = if status.error_message.is_empty() {
                format!("aria2 error code {}", status.error_code)
            } else {
                status.error_message.clone()
            };
            Step::Finish(vec![BulkEvent::Error {
                handle: handle.clone(),
                message,
            }])
        }
        "removed" => Step::Finish(vec![BulkEvent::Error {
            handle: handle.clone(),
            message: "download was removed".to_string(),
        }]),
        _ => {
            let mut events = metadata_event(handle, tracked, total, metadata);
            if !metadata {
                events.push(BulkEvent::Progress {
                    handle: handle.clone(),
                    downloaded: DownloadStatus::number(&status.completed_length),
                    total,
                    rate: DownloadStatus::number(&status.download_speed),
                });
            }
            Step::Events(events)
        }
    }
}

fn metadata_event(
    handle: &TorrentHandle,
    tracked: &mut Tracked,
    total: u64,
    metadata: bool,
) -> Vec<BulkEvent> {
    if tracked.metadata_sent || metadata || total == 0 {
        return Vec::new();
    }
    tracked.metadata_sent = true;
    vec![BulkEvent::MetadataReceived {
        handle: handle.clone(),
        total_bytes: total,
    }]
}

/// Request body for one JSON-RPC call. The secret goes first in `params`.
fn rpc_request(secret: &str, method: &str, params: Value) -> Value {
    let mut authorized = vec![json!(format!("token:{}", secret))];
    match params {
        Value::Array(values) => authorized.extend(values),
        Value::Null => {}
        other => authorized.push(other),
    }
    let params = Value::Array(authorized);
    json!({
        "jsonrpc": "2.0",
        "id": "patchsync",
        "method": method,
        "params": params,
    })
}

fn add_options(save_path: &Path, mode: AddMode) -> Value {
    let mut options = json!({
        "dir": save_path.to_string_lossy(),
        "follow-torrent": "mem",
        "seed-time": "0",
        "bt-save-metadata": "false",
    });
    if mode == AddMode::Probe {
        options["pause-metadata"] = json!("true");
    }
    options
}

pub struct Aria2Downloader {
    child: Child,
    client: Client,
    endpoint: String,
    secret: String,
    tracked: HashMap<TorrentHandle, Tracked>,
    stopped: bool,
}

impl Aria2Downloader {
    /// Start `aria2c` and wait for its RPC interface.
    ///
    /// A launch whose RPC interface never comes up is retried on a fresh
    /// port; a binary that cannot be executed fails at once.
    pub fn spawn(binary: &Path) -> BulkResult<Self> {
        let mut attempt = 1;
        loop {
            let mut downloader = Self::launch(binary)?;
            match downloader.await_ready() {
                Ok(()) => {
                    info!(endpoint = %downloader.endpoint, "aria2 engine started");
                    return Ok(downloader);
                }
                Err(e) if attempt < SPAWN_ATTEMPTS => {
                    warn!(attempt, error = %e, "aria2 RPC unavailable, relaunching");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn launch(binary: &Path) -> BulkResult<Self> {
        let port = free_port()?;
        let secret = Alphanumeric.sample_string(&mut rand::rng(), SECRET_LEN);
        let child = Command::new(binary)
            .arg("--enable-rpc")
            .arg("--rpc-listen-all=false")
            .arg(format!("--rpc-listen-port={}", port))
            .arg(format!("--rpc-secret={}", secret))
            .arg("--quiet=true")
            .arg("--seed-time=0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                BulkError::Engine(format!("failed to launch {}: {}", binary.display(), e))
            })?;

        let client = Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| BulkError::Engine(format!("failed to create RPC client: {}", e)))?;

        Ok(Self {
            child,
            client,
            endpoint: format!("http://127.0.0.1:{}/jsonrpc", port),
            secret,
            tracked: HashMap::new(),
            stopped: false,
        })
    }

    fn await_ready(&mut self) -> BulkResult<()> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            match self.call("aria2.getVersion", json!([])) {
                Ok(version) => {
                    debug!(version = %version["version"], "aria2 RPC ready");
                    return Ok(());
                }
                Err(e) => {
                    if let Ok(Some(status)) = self.child.try_wait() {
                        return Err(BulkError::Engine(format!("aria2c exited early: {}", status)));
                    }
                    if Instant::now() >= deadline {
                        return Err(BulkError::Engine(format!("aria2 RPC not reachable: {}", e)));
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn call(&self, method: &str, params: Value) -> BulkResult<Value> {
        let response: RpcResponse = self
            .client
            .post(&self.endpoint)
            .json(&rpc_request(&self.secret, method, params))
            .send()
            .and_then(|r| r.json())
            .map_err(|e| BulkError::Engine(format!("{} failed: {}", method, e)))?;

        if let Some(error) = response.error {
            return Err(BulkError::Engine(format!(
                "{} returned error {}: {}",
                method, error.code, error.message
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    fn tell_status(&self, gid: &str) -> BulkResult<DownloadStatus> {
        let value = self.call("aria2.tellStatus", json!([gid]))?;
        serde_json::from_value(value)
            .map_err(|e| BulkError::Engine(format!("unexpected tellStatus reply: {}", e)))
    }

    /// Poll one handle, following metadata downloads to their successor.
    fn poll(&self, handle: &TorrentHandle, tracked: &mut Tracked) -> BulkResult<(Vec<BulkEvent>, bool)> {
        loop {
            let status = self.tell_status(tracked.current())?;
            match translate(handle, tracked, &status) {
                Step::Follow(next) => {
                    debug!(handle = %handle, gid = %next, "Following metadata download");
                    tracked.gids.push(next);
                }
                Step::Events(events) => return Ok((events, false)),
                Step::Finish(events) => return Ok((events, true)),
            }
        }
    }
}

impl BulkDownloader for Aria2Downloader {
    fn add_magnet(
        &mut self,
        magnet: &str,
        save_path: &Path,
        mode: AddMode,
    ) -> BulkResult<TorrentHandle> {
        let result = self.call(
            "aria2.addUri",
            json!([[magnet], add_options(save_path, mode)]),
        )?;
        let gid = result
            .as_str()
            .ok_or_else(|| BulkError::Engine("aria2.addUri returned no gid".to_string()))?
            .to_string();

        let handle = TorrentHandle(gid.clone());
        self.tracked.insert(handle.clone(), Tracked::new(gid));
        Ok(handle)
    }

    fn pop_events(&mut self) -> BulkResult<Vec<BulkEvent>> {
        let mut tracked = std::mem::take(&mut self.tracked);
        let mut events = Vec::new();
        let mut result = Ok(());

        for (handle, state) in tracked.iter_mut().filter(|(_, s)| !s.finished) {
            match self.poll(handle, state) {
                Ok((mut batch, finished)) => {
                    events.append(&mut batch);
                    state.finished = finished;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.tracked = tracked;
        result.map(|_| events)
    }

    fn remove(&mut self, handle: &TorrentHandle) -> BulkResult<()> {
        let Some(state) = self.tracked.remove(handle) else {
            return Ok(());
        };
        for gid in state.gids.iter().rev() {
            if let Err(e) = self.call("aria2.forceRemove", json!([gid])) {
                debug!(gid = %gid, error = %e, "forceRemove failed");
            }
            if let Err(e) = self.call("aria2.removeDownloadResult", json!([gid])) {
                debug!(gid = %gid, error = %e, "removeDownloadResult failed");
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> BulkResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        if let Err(e) = self.call("aria2.shutdown", json!([])) {
            warn!(error = %e, "aria2.shutdown failed, killing engine");
            let _ = self.child.kill();
        }
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                Ok(None) => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    return Ok(());
                }
                Err(e) => return Err(BulkError::Engine(format!("failed to reap aria2c: {}", e))),
            }
        }
    }
}

impl Drop for Aria2Downloader {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn free_port() -> BulkResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| BulkError::Engine(format!("no free local port: {}", e)))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| BulkError::Engine(format!("no free local port: {}", e)))
}
