/// Registry of background processes and their supervised shutdown.
///
/// Background processes are spawned in their own process group, so
/// termination signals go to the whole group (Wine tends to fork helpers).
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Child;

/// A background process owned by the supervisor.
#[derive(Debug)]
pub struct ManagedProcess {
    pub label: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    child: Child,
}

/// What `shutdown_all` did, by process label.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Exited within the grace period after SIGTERM.
    pub graceful: Vec<String>,
    /// Still running after the grace period; sent SIGKILL.
    pub forced: Vec<String>,
    /// Had already exited; not signalled.
    pub already_exited: Vec<String>,
}

impl ShutdownReport {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.graceful.is_empty() && self.forced.is_empty() && self.already_exited.is_empty()
    }
}

pub struct ProcessSupervisor {
    registry: Mutex<Vec<ManagedProcess>>,
    grace_period: Duration,
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
            grace_period,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ManagedProcess>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take ownership of a spawned child. Returns its pid.
    pub fn register(&self, label: impl Into<String>, child: Child) -> u32 {
        let label = label.into();
        let pid = child.id().unwrap_or(0);
        tracing::info!(label = %label, pid, "background process registered");
        self.lock().push(ManagedProcess {
            label,
            pid,
            started_at: Utc::now(),
            child,
        });
        pid
    }

    /// Whether a process with this label is registered and still running.
    pub fn is_running(&self, label: &str) -> bool {
        self.lock()
            .iter_mut()
            .filter(|p| p.label == label)
            .any(|p| matches!(p.child.try_wait(), Ok(None)))
    }

    /// Number of registered processes that have not exited.
    pub fn running_count(&self) -> usize {
        self.lock()
            .iter_mut()
            .map(|p| matches!(p.child.try_wait(), Ok(None)))
            .filter(|running| *running)
            .count()
    }

    /// SIGTERM every running process, wait up to the grace period, then
    /// SIGKILL whatever is left.
    ///
    /// The registry is drained, so a second call is a no-op. Processes that
    /// already exited are reaped without being signalled.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let entries: Vec<ManagedProcess> = std::mem::take(&mut *self.lock());
        let mut report = ShutdownReport::default();
        if entries.is_empty() {
            return report;
        }
        tracing::info!(count = entries.len(), "stopping background processes");

        let mut running = Vec::new();
        for mut process in entries {
            match process.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(label = %process.label, ?status, "process already exited");
                    report.already_exited.push(process.label);
                }
                _ => {
                    send_signal(process.pid, Signal::SIGTERM);
                    running.push(process);
                }
            }
        }

        let deadline = deadline_after(self.grace_period);
        for mut process in running {
            let uptime_secs = (Utc::now() - process.started_at).num_seconds();
            match tokio::time::timeout_at(deadline, process.child.wait()).await {
                Ok(status) => {
                    tracing::info!(label = %process.label, pid = process.pid, ?status, uptime_secs, "process terminated");
                    report.graceful.push(process.label);
                }
                Err(_) => {
                    tracing::warn!(
                        label = %process.label,
                        pid = process.pid,
                        grace_secs = self.grace_period.as_secs_f64(),
                        "process ignored SIGTERM, killing"
                    );
                    if !send_signal(process.pid, Signal::SIGKILL) {
                        if let Err(e) = process.child.start_kill() {
                            tracing::debug!(label = %process.label, error = %e, "start_kill failed");
                        }
                    }
                    if let Err(e) = process.child.wait().await {
                        tracing::error!(label = %process.label, error = %e, "failed to reap killed process");
                    }
                    report.forced.push(process.label);
                }
            }
        }
        report
    }
}

/// How a single child was brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

/// SIGTERM one child's group, wait up to `grace`, then SIGKILL.
///
/// Used for bounded foreground processes the supervisor does not own.
pub(crate) async fn terminate_child(child: &mut Child, grace: Duration) -> Termination {
    let pid = child.id().unwrap_or(0);
    if matches!(child.try_wait(), Ok(Some(_))) {
        return Termination::Graceful;
    }
    send_signal(pid, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return Termination::Graceful;
    }
    tracing::warn!(pid, "process ignored SIGTERM, killing");
    if !send_signal(pid, Signal::SIGKILL) {
        if let Err(e) = child.start_kill() {
            tracing::debug!(pid, error = %e, "start_kill failed");
        }
    }
    if let Err(e) = child.wait().await {
        tracing::debug!(pid, error = %e, "failed to reap killed process");
    }
    Termination::Forced
}

/// `now + wait`, clamped to roughly thirty years out instead of overflowing.
pub(crate) fn deadline_after(wait: Duration) -> tokio::time::Instant {
    const FAR: Duration = Duration::from_secs(86_400 * 365 * 30);
    let now = tokio::time::Instant::now();
    now.checked_add(wait.min(FAR)).unwrap_or(now)
}

/// Signal the process group led by `pid`, falling back to the pid alone.
fn send_signal(pid: u32, signal: Signal) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_raw(pid as i32);
    if killpg(pid, signal).is_ok() {
        return true;
    }
    match kill(pid, signal) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(%pid, ?signal, error = %e, "signal delivery failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap()
    }

    /// Wait for the child to print its first line so its traps are in place.
    async fn wait_ready(child: &mut Child) {
        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let line = lines.next_line().await.unwrap();
        assert_eq!(line.as_deref(), Some("ready"));
    }

    #[tokio::test]
    async fn test_empty_registry_shutdown() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(100));
        assert!(supervisor.shutdown_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_cooperative_process_is_not_force_killed() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(5));
        let mut child = spawn_sh("echo ready; exec sleep 30");
        wait_ready(&mut child).await;
        supervisor.register("sleeper", child);
        assert_eq!(supervisor.running_count(), 1);
        assert!(supervisor.is_running("sleeper"));

        let report = supervisor.shutdown_all().await;
        assert_eq!(report.graceful, vec!["sleeper"]);
        assert!(report.forced.is_empty());
        assert_eq!(supervisor.running_count(), 0);
    }

    #[tokio::test]
    async fn test_process_ignoring_sigterm_is_killed_once() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(300));
        let mut child = spawn_sh("trap '' TERM; echo ready; sleep 30");
        wait_ready(&mut child).await;
        supervisor.register("stubborn", child);

        let start = std::time::Instant::now();
        let report = supervisor.shutdown_all().await;
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(report.forced, vec!["stubborn"]);
        assert!(report.graceful.is_empty());

        // Second call has nothing left to signal.
        let again = supervisor.shutdown_all().await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_already_exited_process_is_skipped() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(100));
        let mut child = Command::new("true").process_group(0).spawn().unwrap();
        // Let it finish but leave it registered.
        let pid = child.id();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(child.try_wait(), Ok(Some(_))));
        assert!(pid.is_some());
        supervisor.register("done", child);

        assert!(!supervisor.is_running("done"));
        let report = supervisor.shutdown_all().await;
        assert_eq!(report.already_exited, vec!["done"]);
        assert!(report.graceful.is_empty());
        assert!(report.forced.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_registry() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(300));
        let mut polite = spawn_sh("echo ready; exec sleep 30");
        wait_ready(&mut polite).await;
        let mut stubborn = spawn_sh("trap '' TERM; echo ready; sleep 30");
        wait_ready(&mut stubborn).await;
        supervisor.register("polite", polite);
        supervisor.register("stubborn", stubborn);

        let report = supervisor.shutdown_all().await;
        assert_eq!(report.graceful, vec!["polite"]);
        assert_eq!(report.forced, vec!["stubborn"]);
    }

    #[test]
    fn test_deadline_after_huge_wait_does_not_overflow() {
        let now = tokio::time::Instant::now();
        assert!(deadline_after(Duration::MAX) > now);
        assert!(deadline_after(Duration::from_secs(u64::MAX)) > now);
    }

    #[tokio::test]
    async fn test_running_count_ignores_exited() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(300));
        let mut sleeper = spawn_sh("echo ready; exec sleep 30");
        wait_ready(&mut sleeper).await;
        supervisor.register("sleeper", sleeper);
        let mut done = Command::new("true").process_group(0).spawn().unwrap();
        done.wait().await.unwrap();
        supervisor.register("done", done);

        assert_eq!(supervisor.running_count(), 1);
        supervisor.shutdown_all().await;
        assert_eq!(supervisor.running_count(), 0);
    }

    #[tokio::test]
    async fn test_is_running_unknown_label() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(100));
        assert!(!supervisor.is_running("nothing"));
    }
}
