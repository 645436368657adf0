//! HTTP artifact fetching with a fixed-delay retry policy.
//!
//! Each attempt starts the download over into a truncated destination file.
//! Only transport failures (connect errors, bad status, timeouts, read
//! errors) are retried; local write failures are returned immediately.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};

/// Buffer size for streaming downloads (128KB).
const BUFFER_SIZE: usize = 128 * 1024;

/// Server-driven retry policy.
///
/// `max_attempts` bounds the total number of attempts; `delay` is slept
/// between attempts and never grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Attempts actually made; a zero policy still tries once.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Byte-level progress: `(bytes_received, bytes_expected)`, where the
/// expected count is zero when the server did not announce a length.
pub type FetchProgress<'a> = &'a mut dyn FnMut(u64, u64);

/// Fetches a remote resource into a local file.
pub trait ArtifactFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        retry: &RetryPolicy,
        on_progress: FetchProgress<'_>,
    ) -> UpdateResult<u64>;
}

/// Run `attempt` under a retry policy, sleeping a fixed delay between
/// transport failures.
pub fn with_retries<T>(
    url: &str,
    retry: &RetryPolicy,
    mut attempt: impl FnMut(u32) -> UpdateResult<T>,
) -> UpdateResult<T> {
    let attempts = retry.attempts();
    let mut number = 1;
    loop {
        match attempt(number) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transport() && number < attempts => {
                warn!(
                    url = %url,
                    error = %e,
                    retry = number,
                    max_retries = attempts,
                    delay_ms = retry.delay.as_millis() as u64,
                    "Download attempt failed, retrying"
                );
                thread::sleep(retry.delay);
                number += 1;
            }
            Err(e) => {
                if e.is_transport() {
                    warn!(url = %url, error = %e, "Max retries reached");
                }
                return Err(e);
            }
        }
    }
}

/// Blocking HTTP fetcher. One client is reused for every request in a
/// session; requests are issued serially.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher with a per-attempt timeout.
    pub fn new(timeout: Duration) -> UpdateResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpdateError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> UpdateError {
        if e.is_timeout() {
            UpdateError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            UpdateError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// A single download attempt.
    fn fetch_once(&self, url: &str, dest: &Path, on_progress: FetchProgress<'_>) -> UpdateResult<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| self.transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::DownloadFailed {
                url: url.to_string(),
                reason: format!("GET request failed with status {}", status),
            });
        }

        let expected = response.content_length().unwrap_or(0);

        let file = File::create(dest).map_err(|e| UpdateError::WriteFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut downloaded = 0u64;

        loop {
            let bytes_read = response.read(&mut buffer).map_err(|e| {
                UpdateError::DownloadFailed {
                    url: url.to_string(),
                    reason: format!("Read error: {}", e),
                }
            })?;

            if bytes_read == 0 {
                break;
            }

            writer
                .write_all(&buffer[..bytes_read])
                .map_err(|e| UpdateError::WriteFailed {
                    path: dest.to_path_buf(),
                    source: e,
                })?;

            downloaded += bytes_read as u64;
            on_progress(downloaded, expected);
        }

        writer.flush().map_err(|e| UpdateError::WriteFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;

        Ok(downloaded)
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        retry: &RetryPolicy,
        on_progress: FetchProgress<'_>,
    ) -> UpdateResult<u64> {
        debug!(url = %url, dest = %dest.display(), "Fetching");
        with_retries(url, retry, |_| self.fetch_once(url, dest, &mut *on_progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Serve one scripted response per connection, counting requests.
    fn serve(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });

        (format!("http://{}/artifact.cab", addr), hits)
    }

    const UNAVAILABLE: &str = "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const HELLO: &str = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts(), 1);
    }

    #[test]
    fn test_with_retries_uses_fixed_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(20));
        let mut stamps = Vec::new();

        let result: UpdateResult<()> = with_retries("http://x", &policy, |_| {
            stamps.push(Instant::now());
            Err(UpdateError::DownloadFailed {
                url: "http://x".to_string(),
                reason: "down".to_string(),
            })
        });

        assert!(result.is_err());
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(20));
            // Fixed, not exponential: the gap never approaches double the delay.
            assert!(gap < Duration::from_millis(200));
        }
    }

    #[test]
    fn test_with_retries_does_not_retry_local_errors() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;

        let result: UpdateResult<()> = with_retries("http://x", &policy, |_| {
            calls += 1;
            Err(UpdateError::SizeMismatch {
                name: "x".to_string(),
                expected: 1,
                actual: 2,
            })
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_fetch_retries_then_succeeds() {
        let (url, hits) = serve(vec![UNAVAILABLE, HELLO]);
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("artifact.cab");
        let fetcher = HttpFetcher::new(Duration::from_secs(10)).unwrap();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let mut last = (0, 0);
        let bytes = fetcher
            .fetch(&url, &dest, &policy, &mut |now, total| last = (now, total))
            .unwrap();

        assert_eq!(bytes, 5);
        assert_eq!(last, (5, 5));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fetch_gives_up_after_max_attempts() {
        let (url, hits) = serve(vec![UNAVAILABLE, UNAVAILABLE, HELLO]);
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("artifact.cab");
        let fetcher = HttpFetcher::new(Duration::from_secs(10)).unwrap();
        let policy = RetryPolicy::new(2, Duration::from_millis(10));

        let result = fetcher.fetch(&url, &dest, &policy, &mut |_, _| {});

        assert!(matches!(result, Err(UpdateError::DownloadFailed { .. })));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
