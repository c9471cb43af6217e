// src/download.rs

//! Artifact downloading with retry and verification
//!
//! This module provides:
//! - The [`Fetcher`] seam between cmam and the network, with HTTP and
//!   `file://` implementations
//! - Bounded exponential backoff for transient failures
//! - [`Downloader`], which turns an [`ArtifactDescriptor`] into a verified
//!   [`CacheEntry`]

use crate::cache::{CacheEntry, CacheStore};
use crate::error::{Error, Result};
use crate::hash::HashingWriter;
use crate::package::ArtifactDescriptor;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound for a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Why a single fetch attempt failed
#[derive(Debug)]
pub enum FetchError {
    /// Worth retrying: connection problems, timeouts, 5xx, truncated bodies
    Transient(String),
    /// The resource does not exist (HTTP 404, missing file)
    NotFound(String),
    /// Retrying will not help
    Fatal(Error),
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => Error::Network(msg),
            FetchError::NotFound(url) => Error::Network(format!("{} not found", url)),
            FetchError::Fatal(e) => e,
        }
    }
}

/// Streams the body behind a URL into a sink
pub trait Fetcher: Send + Sync {
    /// Returns the number of bytes written
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> std::result::Result<u64, FetchError>;
}

/// HTTP(S) via blocking reqwest
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("cmam/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> std::result::Result<u64, FetchError> {
        let mut response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "*/*")
            .send()
            .map_err(|e| classify_send_error(url, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient(format!("HTTP {} from {}", status, url)));
        }
        if !status.is_success() {
            return Err(FetchError::Fatal(Error::Network(format!(
                "HTTP {} from {}",
                status, url
            ))));
        }

        response
            .copy_to(sink)
            .map_err(|e| FetchError::Transient(format!("Failed reading body of {}: {}", url, e)))
    }
}

/// Only connection failures and timeouts are worth another attempt
fn classify_send_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_connect() || err.is_timeout() {
        FetchError::Transient(format!("{}: {}", url, err))
    } else {
        FetchError::Fatal(Error::Network(format!("{}: {}", url, err)))
    }
}

/// `file://` URLs, for local mirrors and tests
pub struct FileFetcher;

impl FileFetcher {
    fn path_of(url: &str) -> Option<PathBuf> {
        let rest = url.strip_prefix("file://")?;
        // file:///C:/dir on Windows
        let rest = match rest.as_bytes() {
            [b'/', drive, b':', ..] if cfg!(windows) && drive.is_ascii_alphabetic() => &rest[1..],
            _ => rest,
        };
        Some(PathBuf::from(rest))
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> std::result::Result<u64, FetchError> {
        let path = Self::path_of(url).ok_or_else(|| {
            FetchError::Fatal(Error::Network(format!("not a file:// URL: {}", url)))
        })?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(url.to_string()));
            }
            Err(e) => {
                return Err(FetchError::Fatal(Error::io(
                    format!("Failed to open {}", path.display()),
                    e,
                )));
            }
        };
        io::copy(&mut file, sink)
            .map_err(|e| FetchError::Transient(format!("Failed to copy {}: {}", path.display(), e)))
    }
}

/// Dispatches on the URL scheme
pub struct DefaultFetcher {
    http: HttpFetcher,
}

impl DefaultFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(timeout)?,
        })
    }
}

impl Fetcher for DefaultFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> std::result::Result<u64, FetchError> {
        if url.starts_with("file://") {
            FileFetcher.fetch(url, sink)
        } else {
            self.http.fetch(url, sink)
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> std::result::Result<T, FetchError>,
    ) -> std::result::Result<T, FetchError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Err(FetchError::Transient(msg)) if attempt < attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{} attempt {} failed: {}, retrying in {:?}",
                        what, attempt, msg, delay
                    );
                    thread::sleep(delay);
                }
                Err(FetchError::Transient(msg)) => {
                    return Err(FetchError::Transient(format!(
                        "{} failed after {} attempts: {}",
                        what, attempt, msg
                    )));
                }
                other => return other,
            }
        }
    }
}

/// Fetch a small document into memory; `None` when it does not exist
pub fn fetch_bytes(
    fetcher: &dyn Fetcher,
    policy: &RetryPolicy,
    url: &str,
) -> Result<Option<Vec<u8>>> {
    debug!("Fetching {}", url);
    match policy.run(url, || {
        let mut body = Vec::new();
        fetcher.fetch(url, &mut body).map(|_| body)
    }) {
        Ok(body) => Ok(Some(body)),
        Err(FetchError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Downloads artifacts into the cache
pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    cache: CacheStore,
    policy: RetryPolicy,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn Fetcher>, cache: CacheStore, policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            cache,
            policy,
        }
    }

    /// Produce a verified cache entry for `descriptor`
    ///
    /// A cache hit skips the network. A digest mismatch is never retried.
    pub fn fetch(&self, descriptor: &ArtifactDescriptor) -> Result<CacheEntry> {
        if let Some(entry) = self.cache.lookup(&descriptor.expected_digest)? {
            info!(
                "Using cached {} {} ({})",
                descriptor.name,
                descriptor.version,
                descriptor.expected_digest.short()
            );
            return Ok(entry);
        }

        info!(
            "Downloading {} {} from {}",
            descriptor.name, descriptor.version, descriptor.download_url
        );

        let fetched = self.policy.run(&descriptor.download_url, || {
            // Each attempt starts from an empty file
            let mut temp = self.cache.temp_file().map_err(FetchError::Fatal)?;
            let mut writer = HashingWriter::new(temp.as_file_mut());
            self.fetcher.fetch(&descriptor.download_url, &mut writer)?;
            let (_, digest, size) = writer.finish();
            debug!("Received {} bytes ({})", size, digest.short());
            Ok((temp, digest))
        });

        let (temp, actual) = match fetched {
            Ok(temp) => temp,
            Err(FetchError::NotFound(url)) => {
                return Err(Error::Network(format!(
                    "artifact for {} {} not found at {}",
                    descriptor.name, descriptor.version, url
                )));
            }
            Err(e) => return Err(e.into()),
        };

        self.cache.admit(temp, &actual, &descriptor.expected_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::layout::Layout;
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails transiently a fixed number of times, then serves `body`
    struct FlakyFetcher {
        failures: u32,
        calls: AtomicU32,
        body: Vec<u8>,
    }

    impl Fetcher for FlakyFetcher {
        fn fetch(&self, url: &str, sink: &mut dyn Write) -> std::result::Result<u64, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                sink.write_all(b"partial").unwrap();
                return Err(FetchError::Transient(format!("reset fetching {}", url)));
            }
            sink.write_all(&self.body).unwrap();
            Ok(self.body.len() as u64)
        }
    }

    struct RecordingFetcher {
        urls: Mutex<Vec<String>>,
    }

    impl Fetcher for RecordingFetcher {
        fn fetch(&self, url: &str, _sink: &mut dyn Write) -> std::result::Result<u64, FetchError> {
            self.urls.lock().unwrap().push(url.to_string());
            Err(FetchError::NotFound(url.to_string()))
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn setup() -> (tempfile::TempDir, CacheStore) {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path());
        layout.ensure().unwrap();
        (temp, CacheStore::new(&layout))
    }

    fn descriptor(body: &[u8]) -> ArtifactDescriptor {
        ArtifactDescriptor {
            name: "tool".to_string(),
            version: "1.0.0".to_string(),
            download_url: "https://example.invalid/tool".to_string(),
            expected_digest: hash::digest(body),
            entry_point: "tool".to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(20), MAX_BACKOFF);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let (_temp, cache) = setup();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 2,
            calls: AtomicU32::new(0),
            body: b"binary".to_vec(),
        });
        let downloader = Downloader::new(fetcher.clone(), cache, quick());

        let entry = downloader.fetch(&descriptor(b"binary")).unwrap();
        assert_eq!(fs::read(&entry.path).unwrap(), b"binary");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retries_are_bounded() {
        let (_temp, cache) = setup();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 10,
            calls: AtomicU32::new(0),
            body: Vec::new(),
        });
        let downloader = Downloader::new(fetcher.clone(), cache, quick());

        let err = downloader.fetch(&descriptor(b"binary")).unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_checksum_mismatch_is_not_retried() {
        let (_temp, cache) = setup();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 0,
            calls: AtomicU32::new(0),
            body: b"evil".to_vec(),
        });
        let downloader = Downloader::new(fetcher.clone(), cache.clone(), quick());

        let wanted = descriptor(b"good");
        let err = downloader.fetch(&wanted).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(cache.lookup(&wanted.expected_digest).unwrap().is_none());
    }

    #[test]
    fn test_mismatch_reports_digest_of_streamed_body() {
        let (_temp, cache) = setup();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 1,
            calls: AtomicU32::new(0),
            body: b"evil".to_vec(),
        });
        let downloader = Downloader::new(fetcher, cache, quick());

        // The failed attempt's partial bytes must not leak into the digest
        match downloader.fetch(&descriptor(b"good")).unwrap_err() {
            Error::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, hash::digest(b"good").to_string());
                assert_eq!(actual, hash::digest(b"evil").to_string());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_malformed_url_is_not_retried() {
        let err = Client::new().get("not a url").send().unwrap_err();
        assert!(matches!(
            classify_send_error("not a url", err),
            FetchError::Fatal(Error::Network(_))
        ));
    }

    #[test]
    fn test_cache_hit_skips_network() {
        let (_temp, cache) = setup();
        let fetcher = Arc::new(FlakyFetcher {
            failures: 0,
            calls: AtomicU32::new(0),
            body: b"binary".to_vec(),
        });
        let downloader = Downloader::new(fetcher.clone(), cache, quick());

        downloader.fetch(&descriptor(b"binary")).unwrap();
        downloader.fetch(&descriptor(b"binary")).unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fetch_bytes_maps_not_found_to_none() {
        let fetcher = RecordingFetcher {
            urls: Mutex::new(Vec::new()),
        };
        let body = fetch_bytes(&fetcher, &quick(), "https://example.invalid/x").unwrap();
        assert!(body.is_none());
        assert_eq!(fetcher.urls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_file_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        fs::write(&path, b"local").unwrap();

        let mut body = Vec::new();
        let url = format!("file://{}", path.display());
        assert_eq!(FileFetcher.fetch(&url, &mut body).unwrap(), 5);
        assert_eq!(body, b"local");

        let missing = format!("file://{}", dir.path().join("nope").display());
        assert!(matches!(
            FileFetcher.fetch(&missing, &mut body),
            Err(FetchError::NotFound(_))
        ));
    }
}
