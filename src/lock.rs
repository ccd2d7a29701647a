/// Single-instance guard: an advisory exclusive lock on `provisioner.lock`.
///
/// Two provisioners sharing a prefix would race on the cache directory and
/// the Wine prefix, so the second one refuses to start.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held for the lifetime of the process. Dropping it releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock, creating the file and its parent directory if needed.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    holder,
                });
            }
            Err(e) => {
                return Err(LockError::Lock {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }

        // Record our pid for the error message a second instance prints.
        if let Err(e) = file.set_len(0).and_then(|()| writeln!(file, "{}", std::process::id())) {
            tracing::debug!(path = %path.display(), error = %e, "failed to record pid in lock file");
        }

        tracing::debug!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match FileExt::unlock(&self.file) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "instance lock released"),
            Err(e) => tracing::debug!(path = %self.path.display(), error = %e, "failed to release instance lock"),
        }
    }
}

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another instance holds the lock.
    Held {
        path: PathBuf,
        holder: Option<u32>,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            LockError::Held { path, holder } => {
                write!(f, "another provisioner is running (lock {}", path.display())?;
                if let Some(pid) = holder {
                    write!(f, ", pid {pid}")?;
                }
                write!(f, ")")
            }
            LockError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } | LockError::Lock { source, .. } => Some(source),
            LockError::Held { .. } => None,
        }
    }
}
