/// Content cache for downloaded artifacts.
///
/// Layout under the cache directory:
///
/// ```text
/// .cache/
///   mt5setup.exe                 artifact, stored under its destination filename
///   <sha256-of-url>.meta         {"timestamp": "<ISO-8601>", "checksum": "<hex>"}
/// ```
///
/// Entries are only ever written after the artifact passed checksum
/// verification. Nothing is evicted; an entry older than the TTL is simply
/// treated as absent and gets replaced by the next verified download.
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A fresh, verified cache record for one source URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub url_hash: String,
    pub artifact_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
}

/// On-disk shape of a `.meta` file.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    timestamp: String,
    checksum: String,
}

#[derive(Debug)]
pub enum CacheError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Checksum {
        path: PathBuf,
        source: std::io::Error,
    },
    Link {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    WriteMetadata {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::CreateDir { path, source } => {
                write!(f, "failed to create cache dir {}: {}", path.display(), source)
            }
            CacheError::Checksum { path, source } => {
                write!(f, "failed to checksum {}: {}", path.display(), source)
            }
            CacheError::Link { from, to, source } => write!(
                f,
                "failed to place {} into cache as {}: {}",
                from.display(),
                to.display(),
                source
            ),
            CacheError::WriteMetadata { path, source } => {
                write!(f, "failed to write cache metadata {}: {}", path.display(), source)
            }
            CacheError::Serialize { source } => {
                write!(f, "failed to serialize cache metadata: {source}")
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::CreateDir { source, .. } => Some(source),
            CacheError::Checksum { source, .. } => Some(source),
            CacheError::Link { source, .. } => Some(source),
            CacheError::WriteMetadata { source, .. } => Some(source),
            CacheError::Serialize { source } => Some(source),
        }
    }
}

/// Maps source URLs to verified artifacts on disk.
#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
    ttl: Duration,
    enabled: bool,
}

impl ContentCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            enabled,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stable key for a URL: hex SHA-256 of its bytes.
    pub fn url_hash(url: &str) -> String {
        format!("{:x}", Sha256::digest(url.as_bytes()))
    }

    pub fn metadata_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.meta", Self::url_hash(url)))
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Look up a fresh entry for `url` whose artifact is stored as `file_name`.
    pub fn lookup(&self, url: &str, file_name: &str) -> Option<CacheEntry> {
        self.lookup_at(url, file_name, Utc::now())
    }

    /// Like [`lookup`](Self::lookup) with an explicit clock.
    ///
    /// Absent when caching is disabled, the artifact or metadata is missing,
    /// the metadata does not parse, or `now - timestamp >= ttl`.
    pub fn lookup_at(&self, url: &str, file_name: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let artifact_path = self.artifact_path(file_name);
        if !artifact_path.is_file() {
            return None;
        }

        let meta_path = self.metadata_path(url);
        let text = std::fs::read_to_string(&meta_path).ok()?;
        let meta: CacheMetadata = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %meta_path.display(), error = %e, "unparsable cache metadata, ignoring entry");
                return None;
            }
        };
        let Some(timestamp) = parse_timestamp(&meta.timestamp) else {
            tracing::warn!(path = %meta_path.display(), timestamp = %meta.timestamp, "bad cache timestamp, ignoring entry");
            return None;
        };

        let age = now.signed_duration_since(timestamp);
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        if age >= ttl {
            tracing::debug!(url, age_hours = age.num_hours(), "cache entry expired");
            return None;
        }

        Some(CacheEntry {
            url_hash: Self::url_hash(url),
            artifact_path,
            timestamp,
            checksum: meta.checksum,
        })
    }

    /// Record a verified artifact for `url`.
    ///
    /// The artifact is hard-linked (or copied, across filesystems) into the
    /// cache directory under its own filename, then the metadata is written
    /// atomically. When `checksum` is `None` the SHA-256 is computed here.
    /// Returns `Ok(None)` when caching is disabled.
    pub fn store(
        &self,
        url: &str,
        artifact: &Path,
        checksum: Option<&str>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| CacheError::CreateDir {
            path: self.dir.clone(),
            source: e,
        })?;

        let checksum = match checksum {
            Some(c) => c.to_ascii_lowercase(),
            None => sha256_file(artifact).map_err(|e| CacheError::Checksum {
                path: artifact.to_path_buf(),
                source: e,
            })?,
        };

        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| Self::url_hash(url));
        let cached = self.artifact_path(&file_name);
        link_or_copy(artifact, &cached).map_err(|e| CacheError::Link {
            from: artifact.to_path_buf(),
            to: cached.clone(),
            source: e,
        })?;

        let timestamp = Utc::now();
        let meta = CacheMetadata {
            timestamp: timestamp.to_rfc3339(),
            checksum: checksum.clone(),
        };
        let json = serde_json::to_string(&meta).map_err(|e| CacheError::Serialize { source: e })?;
        let meta_path = self.metadata_path(url);
        write_atomic(&self.dir, &meta_path, json.as_bytes()).map_err(|e| {
            CacheError::WriteMetadata {
                path: meta_path.clone(),
                source: e,
            }
        })?;

        tracing::debug!(url, path = %cached.display(), "artifact cached");
        Ok(Some(CacheEntry {
            url_hash: Self::url_hash(url),
            artifact_path: cached,
            timestamp,
            checksum,
        }))
    }
}

/// Hex SHA-256 of a file's contents, read in 8 KiB blocks.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Place `from` at `to`, replacing whatever is there.
pub(crate) fn link_or_copy(from: &Path, to: &Path) -> std::io::Result<()> {
    if from == to {
        return Ok(());
    }
    match std::fs::remove_file(to) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if std::fs::hard_link(from, to).is_err() {
        std::fs::copy(from, to)?;
    }
    Ok(())
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Accepts RFC 3339 and offset-less ISO-8601 (taken as UTC).
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
