/// External command execution: captured foreground runs, supervised
/// background launches, bounded installer waits, and version probes.
use crate::signals::StopFlag;
use crate::supervisor::{deadline_after, terminate_child, ProcessSupervisor};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// How often a bounded wait re-checks the stop flag.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Fail with [`CommandError::Failed`] on a non-zero exit.
    pub check: bool,
    /// Launch, hand to the supervisor, and return without waiting.
    pub background: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            check: true,
            background: false,
        }
    }
}

impl RunOptions {
    pub fn unchecked() -> Self {
        Self {
            check: false,
            background: false,
        }
    }

    pub fn background() -> Self {
        Self {
            check: false,
            background: true,
        }
    }
}

/// Captured result of a foreground command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub argv: Vec<String>,
    /// Exit code (None if killed by signal).
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(CommandOutput),
    /// Background process registered with the supervisor.
    Spawned { pid: u32 },
    /// Not launched because a stop was requested.
    Skipped,
}

/// How a bounded wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundedOutcome {
    Exited { code: Option<i32> },
    /// Ran past its limit and was terminated.
    TimedOut,
    /// Stop requested mid-wait; the process was terminated.
    Cancelled,
}

/// Result of a "is this already installed" probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The probe succeeded; carries its trimmed output.
    Found(String),
    /// The probe ran and reported absence (non-zero exit).
    NotFound,
    /// The probe itself could not run.
    Error(String),
}

#[derive(Debug)]
pub enum CommandError {
    Empty,
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Wait {
        program: String,
        source: std::io::Error,
    },
    Failed {
        argv: Vec<String>,
        code: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Empty => write!(f, "empty command line"),
            CommandError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            CommandError::Wait { program, source } => {
                write!(f, "failed waiting on {program}: {source}")
            }
            CommandError::Failed { argv, code, stderr } => {
                write!(f, "command `{}` exited with {:?}", argv.join(" "), code)?;
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Spawn { source, .. } | CommandError::Wait { source, .. } => Some(source),
            CommandError::Empty | CommandError::Failed { .. } => None,
        }
    }
}

/// Runs external commands. Every background launch goes through the
/// supervisor.
pub struct CommandRunner {
    stop: StopFlag,
    supervisor: Arc<ProcessSupervisor>,
    /// Grace period used when terminating a bounded process.
    grace_period: Duration,
}

impl CommandRunner {
    pub fn new(stop: StopFlag, supervisor: Arc<ProcessSupervisor>, grace_period: Duration) -> Self {
        Self {
            stop,
            supervisor,
            grace_period,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Run `argv`. Foreground runs block until exit and capture output;
    /// background runs are registered with the supervisor under the full
    /// command line as label.
    pub async fn run<S: AsRef<str>>(
        &self,
        argv: &[S],
        options: RunOptions,
    ) -> Result<RunOutcome, CommandError> {
        if options.background {
            let label = join(argv);
            return self.spawn_managed(&label, argv).await;
        }
        let argv = to_vec(argv)?;
        if self.stop.should_stop() {
            tracing::info!(command = %argv.join(" "), "stop requested, not running command");
            return Ok(RunOutcome::Skipped);
        }

        tracing::info!(command = %argv.join(" "), "running");
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CommandError::Spawn {
                program: argv[0].clone(),
                source: e,
            })?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            argv,
        };
        if !result.stdout.is_empty() {
            tracing::debug!(stdout = %result.stdout.trim_end(), "command stdout");
        }
        if !result.stderr.is_empty() {
            tracing::debug!(stderr = %result.stderr.trim_end(), "command stderr");
        }

        if options.check && !result.success() {
            tracing::error!(command = %result.argv.join(" "), code = ?result.code, "command failed");
            return Err(CommandError::Failed {
                argv: result.argv,
                code: result.code,
                stderr: result.stderr,
            });
        }
        if !result.success() {
            tracing::debug!(command = %result.argv.join(" "), code = ?result.code, "command exited non-zero (tolerated)");
        }
        Ok(RunOutcome::Completed(result))
    }

    /// Start a long-running process and hand it to the supervisor.
    ///
    /// The process gets its own process group; stdout and stderr are
    /// forwarded to the log at debug level.
    pub async fn spawn_managed<S: AsRef<str>>(
        &self,
        label: &str,
        argv: &[S],
    ) -> Result<RunOutcome, CommandError> {
        let argv = to_vec(argv)?;
        if self.stop.should_stop() {
            tracing::info!(label, "stop requested, not launching");
            return Ok(RunOutcome::Skipped);
        }

        tracing::info!(label, command = %argv.join(" "), "launching background process");
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| CommandError::Spawn {
                program: argv[0].clone(),
                source: e,
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(label.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(label.to_string(), "stderr", stderr);
        }

        let pid = self.supervisor.register(label, child);
        Ok(RunOutcome::Spawned { pid })
    }

    /// Run an installer-style process, waiting at most `limit`.
    ///
    /// Past the limit, or on a stop request, the process is terminated
    /// (SIGTERM, then SIGKILL after the grace period).
    pub async fn run_bounded<S: AsRef<str>>(
        &self,
        argv: &[S],
        limit: Duration,
    ) -> Result<BoundedOutcome, CommandError> {
        let argv = to_vec(argv)?;
        if self.stop.should_stop() {
            tracing::info!(command = %argv.join(" "), "stop requested, not running command");
            return Ok(BoundedOutcome::Cancelled);
        }

        tracing::info!(command = %argv.join(" "), limit_secs = limit.as_secs(), "running with time limit");
        let program = argv[0].clone();
        let mut child = Command::new(&program)
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| CommandError::Spawn {
                program: program.clone(),
                source: e,
            })?;
        if let Some(stdout) = child.stdout.take() {
            forward_lines(program.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(program.clone(), "stderr", stderr);
        }

        let deadline = deadline_after(limit);
        loop {
            if self.stop.should_stop() {
                tracing::info!(program = %program, "stop requested, terminating");
                terminate_child(&mut child, self.grace_period).await;
                return Ok(BoundedOutcome::Cancelled);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(program = %program, limit_secs = limit.as_secs(), "time limit exceeded, terminating");
                terminate_child(&mut child, self.grace_period).await;
                return Ok(BoundedOutcome::TimedOut);
            }
            let tick = POLL_INTERVAL.min(deadline - now);
            match tokio::time::timeout(tick, child.wait()).await {
                Ok(Ok(status)) => return Ok(BoundedOutcome::Exited { code: status.code() }),
                Ok(Err(e)) => return Err(CommandError::Wait { program, source: e }),
                Err(_) => continue,
            }
        }
    }

    /// Run a probe command and classify the result.
    pub async fn probe<S: AsRef<str>>(&self, argv: &[S]) -> ProbeResult {
        match self.run(argv, RunOptions::unchecked()).await {
            Ok(RunOutcome::Completed(out)) if out.success() => {
                let text = if out.stdout.trim().is_empty() {
                    out.stderr.trim()
                } else {
                    out.stdout.trim()
                };
                ProbeResult::Found(text.to_string())
            }
            Ok(RunOutcome::Completed(_)) => ProbeResult::NotFound,
            Ok(_) => ProbeResult::Error("probe skipped".to_string()),
            Err(e) => ProbeResult::Error(e.to_string()),
        }
    }
}

fn to_vec<S: AsRef<str>>(argv: &[S]) -> Result<Vec<String>, CommandError> {
    if argv.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(argv.iter().map(|s| s.as_ref().to_string()).collect())
}

fn join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(" ")
}

fn forward_lines<R>(label: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(process = %label, stream, "{line}");
        }
    });
}
