/// Verified artifact downloads.
///
/// Order of operations for one [`ArtifactRequest`]:
/// stop check, cache lookup, streaming GET with retry, SHA-256 verification,
/// cache population. Content that fails verification is deleted and never
/// reaches the cache or the installer.
use crate::cache::{link_or_copy, sha256_file, ContentCache};
use crate::config::DownloadConfig;
use crate::retry::{AttemptFailure, RetryDecision, RetryPolicy};
use crate::signals::StopFlag;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const MB: u64 = 1024 * 1024;

/// SHA-256 of known upstream installers, keyed by filename.
static KNOWN_CHECKSUMS: LazyLock<HashMap<String, String>> = LazyLock::new(|| {
    [
        (
            "wine-mono-8.0.0-x86.msi",
            "3f7b1cd6b7842c09142082e50ece97abe848a033a0838f029c35ce973926c275",
        ),
        (
            "python-3.9.0.exe",
            "fd2e4c52fb5a0f6c0d7f8c31131a21c57b0728d9e8b3ed7c207ceea8f1078918",
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
});

/// One download call.
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub url: String,
    pub destination: PathBuf,
    pub expected_checksum: Option<String>,
}

impl ArtifactRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            expected_checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }
}

/// Non-error results of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Fresh download, verified and cached.
    Downloaded { bytes: u64 },
    /// Served from the content cache; no network traffic.
    CacheHit,
    /// A stop was requested. The destination, if it exists, is partial.
    Cancelled,
}

impl FetchOutcome {
    /// Whether the destination now holds trusted content.
    pub fn is_success(&self) -> bool {
        !matches!(self, FetchOutcome::Cancelled)
    }
}

/// Result of comparing a file against an expected checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { checksum: String },
    /// No known checksum to compare against. Accepted with a warning.
    Unverified { checksum: String },
    Mismatch { expected: String, actual: String },
}

impl Verification {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, Verification::Mismatch { .. })
    }

    pub fn checksum(&self) -> &str {
        match self {
            Verification::Verified { checksum } | Verification::Unverified { checksum } => checksum,
            Verification::Mismatch { actual, .. } => actual,
        }
    }
}

/// Hash `path` and compare it with `expected` (case-insensitive hex).
pub fn verify_checksum(path: &Path, expected: Option<&str>) -> std::io::Result<Verification> {
    let actual = sha256_file(path)?;
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    match expected {
        None => {
            tracing::warn!(file = %name, "no known checksum, integrity not verified");
            Ok(Verification::Unverified { checksum: actual })
        }
        Some(expected) if expected.eq_ignore_ascii_case(&actual) => {
            tracing::info!(file = %name, "checksum verified");
            Ok(Verification::Verified { checksum: actual })
        }
        Some(expected) => {
            tracing::error!(file = %name, expected, actual = %actual, "checksum mismatch");
            Ok(Verification::Mismatch {
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

#[derive(Debug)]
pub enum DownloadError {
    Client(reqwest::Error),
    /// The request could not complete (after retries, for transport errors).
    Request { url: String, source: reqwest::Error },
    Status { url: String, status: u16 },
    Io { path: PathBuf, source: std::io::Error },
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    NoFileName { path: PathBuf },
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::Client(e) => write!(f, "failed to build HTTP client: {e}"),
            DownloadError::Request { url, source } => {
                write!(f, "request to {url} failed: {source}")
            }
            DownloadError::Status { url, status } => {
                write!(f, "request to {url} returned HTTP {status}")
            }
            DownloadError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            DownloadError::ChecksumMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch for {}: expected {expected}, got {actual}",
                path.display()
            ),
            DownloadError::NoFileName { path } => {
                write!(f, "destination {} has no file name", path.display())
            }
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DownloadError::Client(e) => Some(e),
            DownloadError::Request { source, .. } => Some(source),
            DownloadError::Io { source, .. } => Some(source),
            DownloadError::Status { .. }
            | DownloadError::ChecksumMismatch { .. }
            | DownloadError::NoFileName { .. } => None,
        }
    }
}

/// Anything that can materialise an artifact at a destination path.
#[allow(async_fn_in_trait)]
pub trait Fetch {
    async fn fetch(&self, request: &ArtifactRequest) -> Result<FetchOutcome, DownloadError>;
}

enum Attempted {
    Response(reqwest::Response),
    Cancelled,
}

/// Streams artifacts over HTTP with retry, verification, and caching.
pub struct Downloader {
    client: reqwest::Client,
    cache: ContentCache,
    stop: StopFlag,
    max_retries: u32,
    backoff: Duration,
    chunk_size: usize,
    known_checksums: HashMap<String, String>,
}

impl Downloader {
    pub fn new(
        config: &DownloadConfig,
        cache: ContentCache,
        stop: StopFlag,
    ) -> Result<Self, DownloadError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(DownloadError::Client)?;
        tracing::debug!(
            cache_dir = %cache.dir().display(),
            enabled = cache.is_enabled(),
            "download cache"
        );
        Ok(Self {
            client,
            cache,
            stop,
            max_retries: config.max_retries,
            backoff: Duration::from_secs_f64(config.backoff_secs.max(0.0)),
            chunk_size: config.chunk_size.max(1),
            known_checksums: KNOWN_CHECKSUMS.clone(),
        })
    }

    /// Replace the built-in known-checksum table.
    #[cfg(test)]
    pub fn with_known_checksums(mut self, table: HashMap<String, String>) -> Self {
        self.known_checksums = table;
        self
    }

    /// Explicit checksum, else the table entry for the destination filename,
    /// else the entry for the URL's last path segment.
    fn expected_checksum(&self, request: &ArtifactRequest, file_name: &str) -> Option<String> {
        if let Some(c) = &request.expected_checksum {
            return Some(c.clone());
        }
        let url_name = request
            .url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .unwrap_or_default();
        self.known_checksums
            .get(file_name)
            .or_else(|| self.known_checksums.get(url_name))
            .cloned()
    }

    /// Try the cache. Returns `true` if the destination was served from it.
    fn serve_from_cache(&self, url: &str, file_name: &str, destination: &Path) -> bool {
        let Some(entry) = self.cache.lookup(url, file_name) else {
            return false;
        };
        match sha256_file(&entry.artifact_path) {
            Ok(actual) if actual.eq_ignore_ascii_case(&entry.checksum) => {}
            Ok(actual) => {
                tracing::warn!(
                    url,
                    expected = %entry.checksum,
                    actual = %actual,
                    "cached artifact does not match its recorded checksum, downloading again"
                );
                return false;
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "failed to read cached artifact, downloading again");
                return false;
            }
        }
        match link_or_copy(&entry.artifact_path, destination) {
            Ok(()) => {
                tracing::info!(url, file = file_name, "using cached artifact");
                true
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "failed to materialise cached artifact, downloading again");
                false
            }
        }
    }

    async fn get_with_retry(&self, url: &str) -> Result<Attempted, DownloadError> {
        let mut policy = RetryPolicy::new(self.max_retries, self.backoff);
        loop {
            if self.stop.should_stop() {
                return Ok(Attempted::Cancelled);
            }
            let (failure, error) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(Attempted::Response(resp)),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    (
                        AttemptFailure::Status(status),
                        DownloadError::Status {
                            url: url.to_string(),
                            status,
                        },
                    )
                }
                Err(e) => (
                    AttemptFailure::Transport,
                    DownloadError::Request {
                        url: url.to_string(),
                        source: e,
                    },
                ),
            };
            match policy.evaluate(&failure) {
                RetryDecision::Retry { delay, .. } => {
                    if !self.stop.sleep(delay).await {
                        return Ok(Attempted::Cancelled);
                    }
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }

    /// Write the response body to `destination` in `chunk_size` blocks.
    ///
    /// Returns `None` if a stop was observed between chunks; the partial
    /// file is left where it is.
    async fn write_body(
        &self,
        url: &str,
        mut response: reqwest::Response,
        destination: &Path,
    ) -> Result<Option<u64>, DownloadError> {
        let io_err = |e| DownloadError::Io {
            path: destination.to_path_buf(),
            source: e,
        };

        // Never write through a hard link into the cache.
        match tokio::fs::remove_file(destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
        let mut file = tokio::fs::File::create(destination).await.map_err(io_err)?;

        let total = response.content_length().unwrap_or(0);
        let mut pending: Vec<u8> = Vec::with_capacity(self.chunk_size * 2);
        let mut written: u64 = 0;
        let mut last_mb: u64 = 0;
        let mut finished = false;

        while !finished {
            match response.chunk().await {
                Ok(Some(bytes)) => pending.extend_from_slice(&bytes),
                Ok(None) => finished = true,
                Err(e) => {
                    return Err(DownloadError::Request {
                        url: url.to_string(),
                        source: e,
                    })
                }
            }

            while pending.len() >= self.chunk_size || (finished && !pending.is_empty()) {
                if self.stop.should_stop() {
                    tracing::info!(url, written, "download interrupted by stop request");
                    if let Err(e) = file.flush().await {
                        tracing::debug!(path = %destination.display(), error = %e, "failed to flush partial download");
                    }
                    return Ok(None);
                }
                let n = pending.len().min(self.chunk_size);
                file.write_all(&pending[..n]).await.map_err(io_err)?;
                pending.drain(..n);
                written += n as u64;

                if written / MB > last_mb {
                    last_mb = written / MB;
                    if total > 0 {
                        tracing::info!(
                            url,
                            progress = %format!("{:.1}%", written as f64 * 100.0 / total as f64),
                            downloaded_mb = %format!("{:.1}", written as f64 / MB as f64),
                            total_mb = %format!("{:.1}", total as f64 / MB as f64),
                            "download progress"
                        );
                    } else {
                        tracing::info!(url, downloaded_mb = last_mb, "download progress");
                    }
                }
            }
        }

        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(Some(written))
    }
}

impl Fetch for Downloader {
    async fn fetch(&self, request: &ArtifactRequest) -> Result<FetchOutcome, DownloadError> {
        let url = request.url.as_str();
        let destination = request.destination.as_path();

        if self.stop.should_stop() {
            tracing::info!(url, "stop requested, skipping download");
            return Ok(FetchOutcome::Cancelled);
        }

        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DownloadError::NoFileName {
                path: destination.to_path_buf(),
            })?;

        if self.serve_from_cache(url, &file_name, destination) {
            return Ok(FetchOutcome::CacheHit);
        }

        tracing::info!(url, destination = %destination.display(), "downloading");
        let response = match self.get_with_retry(url).await? {
            Attempted::Response(r) => r,
            Attempted::Cancelled => {
                tracing::info!(url, "download cancelled before transfer");
                return Ok(FetchOutcome::Cancelled);
            }
        };

        let Some(bytes) = self.write_body(url, response, destination).await? else {
            return Ok(FetchOutcome::Cancelled);
        };

        let expected = self.expected_checksum(request, &file_name);
        let verification =
            verify_checksum(destination, expected.as_deref()).map_err(|e| DownloadError::Io {
                path: destination.to_path_buf(),
                source: e,
            })?;
        if let Verification::Mismatch { expected, actual } = verification {
            if let Err(e) = std::fs::remove_file(destination) {
                tracing::error!(path = %destination.display(), error = %e, "failed to delete unverified download");
            }
            return Err(DownloadError::ChecksumMismatch {
                path: destination.to_path_buf(),
                expected,
                actual,
            });
        }

        if let Err(e) = self.cache.store(url, destination, Some(verification.checksum())) {
            tracing::warn!(url, error = %e, "failed to cache verified artifact");
        }

        tracing::info!(url, bytes, destination = %destination.display(), "download complete");
        Ok(FetchOutcome::Downloaded { bytes })
    }
}
