/// Status file: writes `provisioner.status` as JSON on every state transition.
///
/// Uses atomic write pattern: write to temp file then rename. External
/// health checks read this instead of scraping logs.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Provisioner states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Starting,
    RunningStep,
    /// Every step has run; waiting for a termination signal.
    Idle,
    /// A stop was requested before all steps ran.
    Stopped,
    ShuttingDown,
    Failed,
}

/// The JSON payload written to `provisioner.status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: ProvisionState,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".provisioner.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Which bucket a finished step lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRecord {
    Completed,
    Skipped,
    Failed,
}

/// Mutable state tracker that builds StatusData for each update.
pub struct StatusTracker {
    file: Option<StatusFile>,
    pid: u32,
    current_step: Option<String>,
    completed_steps: Vec<String>,
    skipped_steps: Vec<String>,
    failed_steps: Vec<String>,
    started_at: DateTime<Utc>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf) -> Self {
        Self {
            file: Some(StatusFile::new(status_path)),
            ..Self::disabled()
        }
    }

    /// A tracker that records in memory but never touches disk.
    pub fn disabled() -> Self {
        Self {
            file: None,
            pid: std::process::id(),
            current_step: None,
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            failed_steps: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn snapshot(&self, state: ProvisionState) -> StatusData {
        StatusData {
            pid: self.pid,
            state,
            current_step: self.current_step.clone(),
            completed_steps: self.completed_steps.clone(),
            skipped_steps: self.skipped_steps.clone(),
            failed_steps: self.failed_steps.clone(),
            started_at: self.started_at,
            last_update: Utc::now(),
        }
    }

    /// Update and write the status file with the given state.
    pub fn update(&self, state: ProvisionState) {
        let Some(file) = &self.file else {
            return;
        };
        if let Err(e) = file.write(&self.snapshot(state)) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_current_step(&mut self, step: &str) {
        self.current_step = Some(step.to_string());
    }

    /// Record a finished step and clear the current step.
    pub fn record(&mut self, step: &str, record: StepRecord) {
        let bucket = match record {
            StepRecord::Completed => &mut self.completed_steps,
            StepRecord::Skipped => &mut self.skipped_steps,
            StepRecord::Failed => &mut self.failed_steps,
        };
        bucket.push(step.to_string());
        self.current_step = None;
    }

    pub fn failed_steps(&self) -> &[String] {
        &self.failed_steps
    }

    /// Remove the status file.
    pub fn remove(&self) {
        if let Some(file) = &self.file {
            file.remove();
        }
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
