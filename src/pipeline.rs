/// The ordered install/launch sequence.
///
/// Each step checks the stop flag before it starts, evaluates an idempotency
/// precondition, and only then runs its action. A failed step either halts the
/// run or is logged and skipped past, depending on [`FailurePolicy`].
use crate::command::{BoundedOutcome, CommandError, CommandRunner, ProbeResult, RunOptions, RunOutcome};
use crate::config::{Config, FailurePolicy};
use crate::download::{ArtifactRequest, Fetch, FetchOutcome};
use crate::signals::StopFlag;
use crate::status::{ProvisionState, StatusTracker, StepRecord};
use crate::supervisor::ShutdownReport;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Poll interval of the post-install idle wait.
const IDLE_POLL: Duration = Duration::from_secs(1);

const TERMINAL_LABEL: &str = "terminal";
const BRIDGE_LABEL: &str = "bridge";

static PIP_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Version:\s*(\S+)").unwrap());

/// Local-address ports in `ss -tuln` output (`0.0.0.0:8001`, `[::]:8001`, `*:8001`).
static LISTEN_PORT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":(\d+)\s").unwrap());

/// Pipeline steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InstallRuntime,
    InstallTerminal,
    InstallPython,
    InstallPackages,
    LaunchTerminal,
    LaunchService,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::InstallRuntime,
        Step::InstallTerminal,
        Step::InstallPython,
        Step::InstallPackages,
        Step::LaunchTerminal,
        Step::LaunchService,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::InstallRuntime => "install_mono",
            Step::InstallTerminal => "install_terminal",
            Step::InstallPython => "install_python",
            Step::InstallPackages => "install_packages",
            Step::LaunchTerminal => "start_terminal",
            Step::LaunchService => "start_service",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Precondition says the target already exists.
    Skipped(String),
    Failed(String),
    /// Stop requested while the step was running.
    Cancelled,
}

/// How `run` ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every step was attempted.
    Finished,
    /// A stop request cut the sequence short.
    Stopped,
}

#[derive(Debug)]
pub enum PipelineError {
    /// A step failed under [`FailurePolicy::Halt`].
    StepFailed { step: &'static str, reason: String },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::StepFailed { step, reason } => {
                write!(f, "step {step} failed: {reason}")
            }
            PipelineError::Io { path, source } => {
                write!(f, "failed to prepare {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io { source, .. } => Some(source),
            PipelineError::StepFailed { .. } => None,
        }
    }
}

pub struct InstallationPipeline<'a, F> {
    config: &'a Config,
    fetcher: F,
    runner: CommandRunner,
    stop: StopFlag,
    status: StatusTracker,
}

impl<'a, F: Fetch> InstallationPipeline<'a, F> {
    pub fn new(config: &'a Config, fetcher: F, runner: CommandRunner, stop: StopFlag) -> Self {
        Self {
            config,
            fetcher,
            runner,
            stop,
            status: StatusTracker::disabled(),
        }
    }

    pub fn with_status(mut self, status: StatusTracker) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Run the steps, idle until a stop is requested, then shut down every
    /// background process. Shutdown happens on the error path too.
    pub async fn execute(&mut self) -> Result<ShutdownReport, PipelineError> {
        let result = self.run().await;
        match &result {
            Ok(PipelineOutcome::Finished) => self.idle().await,
            Ok(PipelineOutcome::Stopped) => {}
            Err(e) => tracing::error!(error = %e, "installation failed"),
        }
        let report = self.shutdown().await;
        match result {
            Ok(_) => {
                self.status.remove();
                Ok(report)
            }
            Err(e) => {
                self.status.update(ProvisionState::Failed);
                Err(e)
            }
        }
    }

    /// Run every step in order.
    pub async fn run(&mut self) -> Result<PipelineOutcome, PipelineError> {
        let config = self.config;
        tracing::info!(
            prefix = %config.wine.prefix.display(),
            policy = ?config.pipeline.on_step_failure,
            "starting installation"
        );
        self.status.update(ProvisionState::Starting);

        for dir in [&config.wine.prefix, &config.downloads.work_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PipelineError::Io {
                    path: dir.clone(),
                    source: e,
                })?;
        }

        for step in Step::ALL {
            if self.stop.should_stop() {
                tracing::info!(next_step = %step, "installation interrupted by stop request");
                self.status.update(ProvisionState::Stopped);
                return Ok(PipelineOutcome::Stopped);
            }

            self.status.set_current_step(step.name());
            self.status.update(ProvisionState::RunningStep);
            tracing::info!(step = %step, "step started");

            match self.run_step(step).await {
                StepOutcome::Completed => {
                    tracing::info!(step = %step, "step completed");
                    self.status.record(step.name(), StepRecord::Completed);
                }
                StepOutcome::Skipped(reason) => {
                    tracing::info!(step = %step, reason = %reason, "step skipped");
                    self.status.record(step.name(), StepRecord::Skipped);
                }
                StepOutcome::Cancelled => {
                    tracing::info!(step = %step, "step interrupted by stop request");
                    self.status.update(ProvisionState::Stopped);
                    return Ok(PipelineOutcome::Stopped);
                }
                StepOutcome::Failed(reason) => {
                    self.status.record(step.name(), StepRecord::Failed);
                    match config.pipeline.on_step_failure {
                        FailurePolicy::Continue => {
                            tracing::warn!(step = %step, reason = %reason, "step failed, continuing");
                        }
                        FailurePolicy::Halt => {
                            tracing::error!(step = %step, reason = %reason, "step failed, halting");
                            return Err(PipelineError::StepFailed {
                                step: step.name(),
                                reason,
                            });
                        }
                    }
                }
            }
        }

        let failed = self.status.failed_steps();
        if failed.is_empty() {
            tracing::info!("installation complete");
        } else {
            tracing::warn!(failed = ?failed, "installation complete with failed steps");
        }
        self.status.update(ProvisionState::Idle);
        Ok(PipelineOutcome::Finished)
    }

    /// Block until a stop is requested.
    pub async fn idle(&self) {
        tracing::info!(
            running = self.runner.supervisor().running_count(),
            "waiting for termination signal"
        );
        while !self.stop.should_stop() {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.status.update(ProvisionState::ShuttingDown);
        let report = self.runner.supervisor().shutdown_all().await;
        tracing::info!(
            graceful = report.graceful.len(),
            forced = report.forced.len(),
            already_exited = report.already_exited.len(),
            "background processes stopped"
        );
        report
    }

    pub(crate) async fn run_step(&self, step: Step) -> StepOutcome {
        if let Some(reason) = self.precondition(step).await {
            return StepOutcome::Skipped(reason);
        }
        match step {
            Step::InstallRuntime => self.install_runtime().await,
            Step::InstallTerminal => self.install_terminal().await,
            Step::InstallPython => self.install_python().await,
            Step::InstallPackages => self.install_packages().await,
            Step::LaunchTerminal => self.launch_terminal().await,
            Step::LaunchService => self.launch_service().await,
        }
    }

    /// `Some(reason)` when the step's target is already in place.
    async fn precondition(&self, step: Step) -> Option<String> {
        match step {
            Step::InstallRuntime => {
                let dir = self.mono_dir();
                dir.exists()
                    .then(|| format!("mono already installed at {}", dir.display()))
            }
            Step::InstallTerminal => {
                let exe = self.terminal_exe();
                exe.exists()
                    .then(|| format!("terminal already installed at {}", exe.display()))
            }
            Step::InstallPython => {
                let tools = &self.config.tools;
                match self.runner.probe(&[tools.wine.as_str(), "python", "--version"]).await {
                    ProbeResult::Found(version) => {
                        Some(format!("python already installed in wine: {version}"))
                    }
                    ProbeResult::NotFound => None,
                    ProbeResult::Error(e) => {
                        tracing::warn!(error = %e, "python version probe failed, installing anyway");
                        None
                    }
                }
            }
            // Checked per package inside the step.
            Step::InstallPackages => None,
            Step::LaunchTerminal => self
                .runner
                .supervisor()
                .is_running(TERMINAL_LABEL)
                .then(|| "terminal already running".to_string()),
            Step::LaunchService => {
                if self.runner.supervisor().is_running(BRIDGE_LABEL) {
                    return Some("bridge already running".to_string());
                }
                let port = self.config.terminal.port;
                self.port_listening(port)
                    .await
                    .then(|| format!("port {port} already listening"))
            }
        }
    }

    async fn install_runtime(&self) -> StepOutcome {
        let config = self.config;
        let installer = self.installer_path("mono.msi");
        if let Some(outcome) = self.download(&config.downloads.mono_url, &installer).await {
            return outcome;
        }

        let installer_arg = installer.to_string_lossy().into_owned();
        let result = self
            .runner
            .run(
                &[
                    config.tools.wine.as_str(),
                    "msiexec",
                    "/i",
                    installer_arg.as_str(),
                    "/qn",
                ],
                // msiexec exits non-zero when the package is already present.
                RunOptions::unchecked(),
            )
            .await;
        remove_installer(&installer);
        match result {
            Ok(RunOutcome::Skipped) => StepOutcome::Cancelled,
            Ok(RunOutcome::Completed(out)) if !out.success() => {
                tracing::warn!(code = ?out.code, "mono installer exited non-zero");
                StepOutcome::Completed
            }
            Ok(_) => StepOutcome::Completed,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    async fn install_terminal(&self) -> StepOutcome {
        let config = self.config;
        let wine = config.tools.wine.as_str();
        let reg = self
            .runner
            .run(
                &[
                    wine,
                    "reg",
                    "add",
                    r"HKEY_CURRENT_USER\Software\Wine",
                    "/v",
                    "Version",
                    "/t",
                    "REG_SZ",
                    "/d",
                    config.wine.version.as_str(),
                    "/f",
                ],
                RunOptions::default(),
            )
            .await;
        match reg {
            Ok(RunOutcome::Skipped) => return StepOutcome::Cancelled,
            Ok(_) => tracing::info!(version = %config.wine.version, "wine windows version set"),
            Err(e) => return StepOutcome::Failed(format!("setting wine version: {e}")),
        }

        let installer = self.installer_path("mt5setup.exe");
        if let Some(outcome) = self.download(&config.downloads.terminal_url, &installer).await {
            return outcome;
        }

        let installer_arg = installer.to_string_lossy().into_owned();
        let waited = self
            .runner
            .run_bounded(&[wine, installer_arg.as_str(), "/auto"], config.startup_timeout())
            .await;
        remove_installer(&installer);
        match waited {
            Ok(BoundedOutcome::Exited { code }) => {
                tracing::debug!(?code, "terminal installer exited");
            }
            Ok(BoundedOutcome::Cancelled) => return StepOutcome::Cancelled,
            Ok(BoundedOutcome::TimedOut) => {
                return StepOutcome::Failed(format!(
                    "installer did not finish within {}s",
                    config.terminal.startup_timeout_secs
                ))
            }
            Err(e) => return StepOutcome::Failed(e.to_string()),
        }

        let exe = self.terminal_exe();
        if exe.exists() {
            StepOutcome::Completed
        } else {
            StepOutcome::Failed(format!("{} missing after install", exe.display()))
        }
    }

    async fn install_python(&self) -> StepOutcome {
        let config = self.config;
        let wine = config.tools.wine.as_str();
        let installer = self.installer_path("python-installer.exe");
        if let Some(outcome) = self.download(&config.downloads.python_url, &installer).await {
            return outcome;
        }

        let installer_arg = installer.to_string_lossy().into_owned();
        // The installer exits non-zero when there is nothing to do.
        let result = self
            .runner
            .run(
                &[
                    wine,
                    installer_arg.as_str(),
                    "/quiet",
                    "InstallAllUsers=1",
                    "PrependPath=1",
                ],
                RunOptions::unchecked(),
            )
            .await;
        remove_installer(&installer);
        match result {
            Ok(RunOutcome::Skipped) => return StepOutcome::Cancelled,
            Ok(_) => {}
            Err(e) => return StepOutcome::Failed(e.to_string()),
        }

        match self
            .runner
            .run(
                &[wine, "python", "-m", "pip", "install", "--upgrade", "pip"],
                RunOptions::unchecked(),
            )
            .await
        {
            Ok(RunOutcome::Skipped) => StepOutcome::Cancelled,
            Ok(_) => StepOutcome::Completed,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    /// Install every required package into Wine's Python and the host's.
    async fn install_packages(&self) -> StepOutcome {
        let config = self.config;
        let wine_pip = [config.tools.wine.as_str(), "python", "-m", "pip"];
        let host_pip = [config.tools.pip.as_str()];
        let mut installed = 0usize;
        let mut failed: Vec<String> = Vec::new();

        for package in &config.packages.required {
            let requirement = Requirement::parse(package);
            for (side, pip) in [("wine", &wine_pip[..]), ("host", &host_pip[..])] {
                if self.stop.should_stop() {
                    return StepOutcome::Cancelled;
                }
                if self.package_present(pip, &requirement).await {
                    tracing::info!(package = %package, side, "package already installed");
                    continue;
                }
                tracing::info!(package = %package, side, "installing package");
                let mut argv: Vec<&str> = pip.to_vec();
                argv.extend(["install", "--no-cache-dir", package.as_str()]);
                match self.runner.run(&argv, RunOptions::unchecked()).await {
                    Ok(RunOutcome::Skipped) => return StepOutcome::Cancelled,
                    Ok(RunOutcome::Completed(out)) if !out.success() => {
                        tracing::warn!(package = %package, side, code = ?out.code, "package install exited non-zero");
                        failed.push(format!("{package} ({side})"));
                    }
                    Ok(_) => installed += 1,
                    Err(e) => return StepOutcome::Failed(e.to_string()),
                }
            }
        }

        if !failed.is_empty() {
            StepOutcome::Failed(format!("package install failed: {}", failed.join(", ")))
        } else if installed == 0 {
            StepOutcome::Skipped("all packages already installed".to_string())
        } else {
            StepOutcome::Completed
        }
    }

    async fn package_present(&self, pip: &[&str], requirement: &Requirement<'_>) -> bool {
        let mut argv: Vec<&str> = pip.to_vec();
        argv.extend(["show", requirement.name]);
        match self.runner.probe(&argv).await {
            ProbeResult::Found(output) => match requirement.version {
                None => true,
                Some(pinned) => pip_show_version(&output) == Some(pinned),
            },
            ProbeResult::NotFound => false,
            ProbeResult::Error(e) => {
                tracing::debug!(package = requirement.name, error = %e, "pip show failed");
                false
            }
        }
    }

    async fn launch_terminal(&self) -> StepOutcome {
        let exe = self.terminal_exe();
        if !exe.exists() {
            return StepOutcome::Failed(format!("terminal not found at {}", exe.display()));
        }
        let exe_arg = exe.to_string_lossy().into_owned();
        launched(
            self.runner
                .spawn_managed(
                    TERMINAL_LABEL,
                    &[self.config.tools.wine.as_str(), exe_arg.as_str()],
                )
                .await,
        )
    }

    async fn launch_service(&self) -> StepOutcome {
        let config = self.config;
        let port = config.terminal.port.to_string();
        let argv = [
            config.tools.python.as_str(),
            "-m",
            "mt5linux",
            "--host",
            "0.0.0.0",
            "-p",
            port.as_str(),
            "-w",
            config.tools.wine.as_str(),
            "python.exe",
        ];
        let outcome = launched(self.runner.spawn_managed(BRIDGE_LABEL, &argv).await);
        if outcome != StepOutcome::Completed {
            return outcome;
        }

        let settle = Duration::from_secs(config.pipeline.service_settle_secs);
        if !self.stop.sleep(settle).await {
            return StepOutcome::Cancelled;
        }
        if self.port_listening(config.terminal.port).await {
            tracing::info!(port = config.terminal.port, "bridge listening");
            StepOutcome::Completed
        } else {
            StepOutcome::Failed(format!("nothing listening on port {}", config.terminal.port))
        }
    }

    async fn port_listening(&self, port: u16) -> bool {
        match self
            .runner
            .run(&[self.config.tools.ss.as_str(), "-tuln"], RunOptions::unchecked())
            .await
        {
            Ok(RunOutcome::Completed(out)) => ss_has_port(&out.stdout, port),
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "could not list listening sockets");
                false
            }
        }
    }

    /// Fetch `url` to `destination`. `None` means the file is ready.
    async fn download(&self, url: &str, destination: &Path) -> Option<StepOutcome> {
        let request = ArtifactRequest::new(url, destination);
        match self.fetcher.fetch(&request).await {
            Ok(FetchOutcome::Cancelled) => Some(StepOutcome::Cancelled),
            Ok(outcome) => {
                tracing::debug!(?outcome, path = %destination.display(), "installer ready");
                None
            }
            Err(e) => Some(StepOutcome::Failed(format!("download failed: {e}"))),
        }
    }

    fn mono_dir(&self) -> PathBuf {
        self.config.wine.prefix.join("drive_c").join("windows").join("mono")
    }

    fn terminal_exe(&self) -> PathBuf {
        self.config
            .wine
            .prefix
            .join("drive_c")
            .join("Program Files")
            .join("MetaTrader 5")
            .join("terminal64.exe")
    }

    fn installer_path(&self, name: &str) -> PathBuf {
        self.config.downloads.work_dir.join(name)
    }
}

fn launched(result: Result<RunOutcome, CommandError>) -> StepOutcome {
    match result {
        Ok(RunOutcome::Skipped) => StepOutcome::Cancelled,
        Ok(_) => StepOutcome::Completed,
        Err(e) => StepOutcome::Failed(e.to_string()),
    }
}

fn remove_installer(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove installer");
        }
    }
}

/// A `name==version` requirement. Other specifiers are matched by name only.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement<'a> {
    name: &'a str,
    version: Option<&'a str>,
}

impl<'a> Requirement<'a> {
    fn parse(spec: &'a str) -> Self {
        let spec = spec.trim();
        if let Some((name, version)) = spec.split_once("==") {
            return Self {
                name: name.trim(),
                version: Some(version.trim()),
            };
        }
        let end = spec
            .find(|c: char| matches!(c, '<' | '>' | '=' | '!' | '~' | '[' | ';' | ' '))
            .unwrap_or(spec.len());
        Self {
            name: &spec[..end],
            version: None,
        }
    }
}

fn pip_show_version(output: &str) -> Option<&str> {
    PIP_VERSION
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn ss_has_port(output: &str, port: u16) -> bool {
    LISTEN_PORT
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
        .any(|p| p == port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadError;
    use crate::supervisor::ProcessSupervisor;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    /// Writes a small file at the destination, or fails, and counts calls.
    struct FakeFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeFetcher {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetch for &FakeFetcher {
        async fn fetch(&self, request: &ArtifactRequest) -> Result<FetchOutcome, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DownloadError::Status {
                    url: request.url.clone(),
                    status: 404,
                });
            }
            std::fs::write(&request.destination, b"installer").unwrap();
            Ok(FetchOutcome::Downloaded { bytes: 9 })
        }
    }

    fn write_tool(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Config rooted in a temp dir with every external tool faked under
    /// `bin/`. `wine` and `pip` log their arguments to `calls.log`.
    fn sandbox(wine_body: &str, pip_body: &str) -> (TempDir, Config) {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let log = root.join("calls.log");
        let log = log.display();
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let bin = bin.as_path();

        let mut config = Config::default();
        config.wine.prefix = root.join("prefix").join(".wine");
        config.downloads.work_dir = root.join("work");
        config.pipeline.grace_period_secs = 1;
        config.pipeline.service_settle_secs = 0;
        config.terminal.startup_timeout_secs = 5;
        config.tools.wine = write_tool(
            bin,
            "wine",
            &format!("printf '%s\\n' \"wine $*\" >> {log}\n{wine_body}"),
        );
        config.tools.pip = write_tool(
            bin,
            "pip",
            &format!("printf '%s\\n' \"pip $*\" >> {log}\n{pip_body}"),
        );
        config.tools.python = write_tool(bin, "python", "exec sleep 30");
        config.tools.ss = write_tool(bin, "ss", "echo 'tcp LISTEN 0 5 0.0.0.0:22 0.0.0.0:*'");
        (dir, config)
    }

    fn calls(dir: &TempDir) -> String {
        std::fs::read_to_string(dir.path().join("calls.log")).unwrap_or_default()
    }

    fn runner(stop: &StopFlag) -> CommandRunner {
        CommandRunner::new(
            stop.clone(),
            Arc::new(ProcessSupervisor::new(Duration::from_millis(300))),
            Duration::from_millis(300),
        )
    }

    #[tokio::test]
    async fn test_installed_runtime_makes_no_download() {
        let (dir, config) = sandbox("exit 0", "exit 0");
        std::fs::create_dir_all(config.wine.prefix.join("drive_c/windows/mono")).unwrap();
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        for _ in 0..2 {
            let outcome = pipeline.run_step(Step::InstallRuntime).await;
            assert!(matches!(outcome, StepOutcome::Skipped(_)));
        }
        assert_eq!(fetcher.calls(), 0);
        assert!(calls(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_runtime_install_downloads_and_runs_msiexec() {
        let (dir, config) = sandbox("exit 0", "exit 0");
        std::fs::create_dir_all(&config.downloads.work_dir).unwrap();
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        assert_eq!(pipeline.run_step(Step::InstallRuntime).await, StepOutcome::Completed);
        assert_eq!(fetcher.calls(), 1);
        let installer = config.downloads.work_dir.join("mono.msi");
        assert!(calls(&dir).contains(&format!("wine msiexec /i {} /qn", installer.display())));
        assert!(!installer.exists(), "installer removed after use");
    }

    #[tokio::test]
    async fn test_stop_before_run_runs_no_steps() {
        let (dir, config) = sandbox("exit 0", "exit 0");
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        stop.request_stop();
        let mut pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        assert_eq!(pipeline.run().await.unwrap(), PipelineOutcome::Stopped);
        assert_eq!(fetcher.calls(), 0);
        assert!(calls(&dir).is_empty());
        let snapshot = pipeline.status().snapshot(ProvisionState::Stopped);
        assert!(snapshot.completed_steps.is_empty());
        assert!(snapshot.skipped_steps.is_empty());
        assert!(snapshot.failed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_halt_policy_stops_at_first_failure() {
        let (dir, mut config) = sandbox("exit 0", "exit 0");
        config.pipeline.on_step_failure = FailurePolicy::Halt;
        let fetcher = FakeFetcher::failing();
        let stop = StopFlag::new();
        let mut pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::StepFailed { step: "install_mono", .. }));
        assert_eq!(fetcher.calls(), 1);
        // Nothing after the failed step ran.
        assert!(!calls(&dir).contains("reg add"));
    }

    #[tokio::test]
    async fn test_continue_policy_attempts_every_step_in_order() {
        // wine: python probe and pip show fail, everything else succeeds.
        let wine = r#"case "$*" in
  "python --version") exit 1 ;;
  "python -m pip show"*) exit 1 ;;
esac
exit 0"#;
        let pip = r#"case "$1" in show) exit 1 ;; esac
exit 0"#;
        let (dir, config) = sandbox(wine, pip);
        let fetcher = FakeFetcher::failing();
        let stop = StopFlag::new();
        let mut pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        assert_eq!(pipeline.run().await.unwrap(), PipelineOutcome::Finished);
        let snapshot = pipeline.status().snapshot(ProvisionState::Idle);
        assert_eq!(
            snapshot.failed_steps,
            vec![
                "install_mono",
                "install_terminal",
                "install_python",
                "start_terminal",
                "start_service"
            ]
        );
        assert_eq!(snapshot.completed_steps, vec!["install_packages"]);
        assert_eq!(fetcher.calls(), 3);

        let log = calls(&dir);
        let reg = log.find("wine reg add").unwrap();
        let first_pkg = log.find("install --no-cache-dir MetaTrader5==5.0.36").unwrap();
        assert!(reg < first_pkg);
        assert!(log.contains("pip install --no-cache-dir pyxdg"));

        // The bridge was launched and registered even though its port never appeared.
        assert!(pipeline.runner.supervisor().is_running(BRIDGE_LABEL));
        let report = pipeline.shutdown().await;
        assert_eq!(report.graceful, vec![BRIDGE_LABEL]);
    }

    #[tokio::test]
    async fn test_packages_at_pinned_version_are_skipped() {
        let show = r#"case "$*" in
  *"pip show MetaTrader5") printf 'Name: MetaTrader5\nVersion: 5.0.36\n' ;;
  *"pip show"*) printf 'Name: x\nVersion: 1.0\n' ;;
esac
exit 0"#;
        let pip = r#"case "$1" in
  show) printf 'Name: %s\nVersion: %s\n' "$2" "$( [ "$2" = MetaTrader5 ] && echo 5.0.36 || echo 1.0 )" ;;
esac
exit 0"#;
        let (dir, config) = sandbox(show, pip);
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        let outcome = pipeline.run_step(Step::InstallPackages).await;
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
        assert!(!calls(&dir).contains("install --no-cache-dir"));
    }

    #[tokio::test]
    async fn test_outdated_pinned_package_is_reinstalled() {
        let wine = r#"case "$*" in
  "python -m pip show MetaTrader5") printf 'Name: MetaTrader5\nVersion: 5.0.30\n' ;;
  "python -m pip show"*) printf 'Version: 1.0\n' ;;
esac
exit 0"#;
        let pip = r#"case "$1" in show) printf 'Version: 5.0.36\n' ;; esac
exit 0"#;
        let (dir, config) = sandbox(wine, pip);
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        assert_eq!(pipeline.run_step(Step::InstallPackages).await, StepOutcome::Completed);
        let log = calls(&dir);
        assert!(log.contains("wine python -m pip install --no-cache-dir MetaTrader5==5.0.36"));
        assert!(!log.contains("pip install --no-cache-dir mt5linux"));
    }

    #[tokio::test]
    async fn test_failed_package_installs_fail_the_step() {
        // Nothing is present and every install exits non-zero.
        let wine = r#"case "$*" in
  "python -m pip"*) exit 1 ;;
esac
exit 0"#;
        let (dir, config) = sandbox(wine, "exit 1");
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        let outcome = pipeline.run_step(Step::InstallPackages).await;
        let StepOutcome::Failed(reason) = outcome else {
            panic!("expected failed step, got {outcome:?}");
        };
        assert!(reason.contains("MetaTrader5==5.0.36 (wine)"));
        assert!(reason.contains("pyxdg (host)"));
        // Every package was still attempted on both sides.
        let log = calls(&dir);
        assert!(log.contains("wine python -m pip install --no-cache-dir pyxdg"));
        assert!(log.lines().any(|l| l == "pip install --no-cache-dir mt5linux"));
    }

    #[tokio::test]
    async fn test_failed_package_step_is_not_recorded_as_skipped() {
        let wine = r#"case "$*" in
  "python --version") exit 1 ;;
  "python -m pip"*) exit 1 ;;
esac
exit 0"#;
        let (_dir, config) = sandbox(wine, "exit 1");
        let fetcher = FakeFetcher::failing();
        let stop = StopFlag::new();
        let mut pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        assert_eq!(pipeline.run().await.unwrap(), PipelineOutcome::Finished);
        let snapshot = pipeline.status().snapshot(ProvisionState::Idle);
        assert!(snapshot.failed_steps.contains(&"install_packages".to_string()));
        assert!(snapshot.skipped_steps.is_empty());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_msiexec_nonzero_exit_is_tolerated() {
        let wine = r#"case "$1" in msiexec) exit 1 ;; esac
exit 0"#;
        let (dir, config) = sandbox(wine, "exit 0");
        std::fs::create_dir_all(&config.downloads.work_dir).unwrap();
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        assert_eq!(pipeline.run_step(Step::InstallRuntime).await, StepOutcome::Completed);
        assert!(calls(&dir).contains("wine msiexec /i"));
        assert!(!config.downloads.work_dir.join("mono.msi").exists());
    }

    #[tokio::test]
    async fn test_python_probe_found_skips_install() {
        let wine = r#"case "$*" in "python --version") echo "Python 3.9.0" ;; esac
exit 0"#;
        let (_dir, config) = sandbox(wine, "exit 0");
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        let outcome = pipeline.run_step(Step::InstallPython).await;
        assert_eq!(
            outcome,
            StepOutcome::Skipped("python already installed in wine: Python 3.9.0".to_string())
        );
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_terminal_install_fails_when_exe_missing() {
        let (dir, config) = sandbox("exit 0", "exit 0");
        std::fs::create_dir_all(&config.downloads.work_dir).unwrap();
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        let outcome = pipeline.run_step(Step::InstallTerminal).await;
        assert!(matches!(outcome, StepOutcome::Failed(ref r) if r.contains("missing after install")));
        let log = calls(&dir);
        assert!(log.contains(r"wine reg add HKEY_CURRENT_USER\Software\Wine /v Version /t REG_SZ /d win10 /f"));
        assert!(log.contains("mt5setup.exe /auto"));
    }

    #[tokio::test]
    async fn test_terminal_installer_timeout_fails_step() {
        let wine = r#"case "$*" in *mt5setup.exe*) exec sleep 30 ;; esac
exit 0"#;
        let (_dir, mut config) = sandbox(wine, "exit 0");
        config.terminal.startup_timeout_secs = 1;
        std::fs::create_dir_all(&config.downloads.work_dir).unwrap();
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        let start = std::time::Instant::now();
        let outcome = pipeline.run_step(Step::InstallTerminal).await;
        assert!(matches!(outcome, StepOutcome::Failed(ref r) if r.contains("did not finish")));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_service_step_skipped_when_port_listening() {
        let (dir, mut config) = sandbox("exit 0", "exit 0");
        config.terminal.port = 8001;
        config.tools.ss = write_tool(
            dir.path(),
            "ss-listening",
            "echo 'tcp LISTEN 0 5 0.0.0.0:8001 0.0.0.0:*'",
        );
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        let outcome = pipeline.run_step(Step::LaunchService).await;
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
        assert_eq!(pipeline.runner.supervisor().running_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_launch_registers_once() {
        let (_dir, config) = sandbox("exec sleep 30", "exit 0");
        let exe = config.wine.prefix.join("drive_c/Program Files/MetaTrader 5/terminal64.exe");
        std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
        std::fs::write(&exe, b"").unwrap();
        let fetcher = FakeFetcher::ok();
        let stop = StopFlag::new();
        let pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop);

        assert_eq!(pipeline.run_step(Step::LaunchTerminal).await, StepOutcome::Completed);
        assert!(matches!(
            pipeline.run_step(Step::LaunchTerminal).await,
            StepOutcome::Skipped(_)
        ));
        assert_eq!(pipeline.runner.supervisor().running_count(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_idles_until_stop_then_shuts_down() {
        let (dir, config) = sandbox("exit 0", "exit 0");
        let status_path = dir.path().join("provisioner.status");
        let fetcher = FakeFetcher::failing();
        let stop = StopFlag::new();
        let mut pipeline = InstallationPipeline::new(&config, &fetcher, runner(&stop), stop.clone())
            .with_status(StatusTracker::new(status_path.clone()));

        let stopper = stop.clone();
        let watcher = status_path.clone();
        tokio::spawn(async move {
            // Stop once the pipeline reports it is idle.
            for _ in 0..200 {
                let idle = std::fs::read_to_string(&watcher)
                    .map(|s| s.contains("\"idle\""))
                    .unwrap_or(false);
                if idle {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            stopper.request_stop();
        });

        let report = pipeline.execute().await.unwrap();
        assert_eq!(report.graceful, vec![BRIDGE_LABEL]);
        assert!(!status_path.exists(), "status file removed on clean exit");
    }

    #[test]
    fn test_step_order_and_names() {
        let names: Vec<&str> = Step::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "install_mono",
                "install_terminal",
                "install_python",
                "install_packages",
                "start_terminal",
                "start_service"
            ]
        );
    }

    #[test]
    fn test_requirement_parse() {
        assert_eq!(
            Requirement::parse("MetaTrader5==5.0.36"),
            Requirement {
                name: "MetaTrader5",
                version: Some("5.0.36")
            }
        );
        assert_eq!(
            Requirement::parse("mt5linux"),
            Requirement {
                name: "mt5linux",
                version: None
            }
        );
        assert_eq!(
            Requirement::parse("pyxdg>=0.27"),
            Requirement {
                name: "pyxdg",
                version: None
            }
        );
    }

    #[test]
    fn test_pip_show_version() {
        let out = "Name: MetaTrader5\nVersion: 5.0.36\nSummary: API";
        assert_eq!(pip_show_version(out), Some("5.0.36"));
        assert_eq!(pip_show_version("Name: x"), None);
    }

    #[test]
    fn test_ss_port_match_is_exact() {
        let out = "Netid State  Recv-Q Send-Q Local Address:Port Peer Address:Port\n\
                   tcp   LISTEN 0      5      0.0.0.0:80010     0.0.0.0:*\n\
                   tcp   LISTEN 0      5      [::]:8001         [::]:*\n";
        assert!(ss_has_port(out, 8001));
        assert!(!ss_has_port(out, 800));
        assert!(!ss_has_port("tcp LISTEN 0 5 127.0.0.1:22 0.0.0.0:*\n", 8001));
    }
}
