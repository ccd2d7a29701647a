use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from provisioner.toml.
///
/// Built once at startup (file, then environment, then CLI flags), validated,
/// and handed to every component by reference.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub wine: WineConfig,
    pub terminal: TerminalConfig,
    pub downloads: DownloadConfig,
    pub cache: CacheConfig,
    pub vnc: VncConfig,
    pub packages: PackagesConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WineConfig {
    pub prefix: PathBuf,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Port the mt5linux bridge listens on.
    pub port: u16,
    pub version: String,
    /// Upper bound on the GUI installer run, in seconds.
    pub startup_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub mono_url: String,
    pub python_url: String,
    pub terminal_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub backoff_secs: f64,
    pub chunk_size: usize,
    /// Where installers are staged before they run.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_days: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VncConfig {
    pub port: u16,
    pub custom_user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PackagesConfig {
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// What the pipeline does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure as a warning and move on to the next step.
    Continue,
    /// Stop at the first failed step and exit non-zero.
    Halt,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" | "full" => Ok(FailurePolicy::Continue),
            "halt" | "basic" => Ok(FailurePolicy::Halt),
            other => Err(format!("unknown step failure policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub on_step_failure: FailurePolicy,
    /// Grace period between SIGTERM and SIGKILL at shutdown, in seconds.
    pub grace_period_secs: u64,
    /// Pause after launching the bridge before probing its port.
    pub service_settle_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub wine: String,
    pub pip: String,
    pub python: String,
    pub ss: String,
}

// --- Default implementations ---

impl Default for WineConfig {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("/config/.wine"),
            version: "win10".to_string(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            version: "5.0.36".to_string(),
            startup_timeout_secs: 300,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            mono_url: "https://dl.winehq.org/wine/wine-mono/8.0.0/wine-mono-8.0.0-x86.msi"
                .to_string(),
            python_url: "https://www.python.org/ftp/python/3.9.0/python-3.9.0.exe".to_string(),
            terminal_url:
                "https://download.mql5.com/cdn/web/metaquotes.software.corp/mt5/mt5setup.exe"
                    .to_string(),
            timeout_secs: 300,
            max_retries: 3,
            backoff_secs: 1.0,
            chunk_size: 8192,
            work_dir: std::env::temp_dir(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_days: 7,
        }
    }
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            custom_user: None,
            password: None,
        }
    }
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            required: vec![
                "MetaTrader5==5.0.36".to_string(),
                "mt5linux".to_string(),
                "pyxdg".to_string(),
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            on_step_failure: FailurePolicy::Continue,
            grace_period_secs: 5,
            service_settle_secs: 5,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            wine: "wine".to_string(),
            pip: "pip3".to_string(),
            python: "python3".to_string(),
            ss: "ss".to_string(),
        }
    }
}

const WINE_VERSIONS: &[&str] = &["win10", "win7", "winxp"];

/// Upper bounds keep derived durations and deadlines far from overflow.
const MAX_TTL_DAYS: u64 = 3650;
const MAX_WAIT_SECS: u64 = 24 * 60 * 60;
const LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// An environment override could not be parsed into its field's type.
    Env { key: String, value: String },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Env { key, value } => {
                write!(f, "invalid value for {key}: '{value}'")
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Env { .. } | ConfigError::Invalid(_) => None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply deployment overrides from an environment snapshot.
    ///
    /// Keys are matched case-insensitively. Callers pass the snapshot in so
    /// nothing below the entry point touches process-wide state.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        let vars: HashMap<String, &String> = vars
            .iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string());

        if let Some(v) = get("WINEPREFIX") {
            self.wine.prefix = PathBuf::from(v);
        }
        if let Some(v) = get("WINE_VERSION") {
            self.wine.version = v;
        }
        if let Some(v) = get("MT5_PORT") {
            self.terminal.port = parse_env("MT5_PORT", &v)?;
        }
        if let Some(v) = get("MT5_VERSION") {
            self.terminal.version = v;
        }
        if let Some(v) = get("STARTUP_TIMEOUT") {
            self.terminal.startup_timeout_secs = parse_env("STARTUP_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MONO_URL") {
            self.downloads.mono_url = v;
        }
        if let Some(v) = get("PYTHON_URL") {
            self.downloads.python_url = v;
        }
        if let Some(v) = get("MT5_DOWNLOAD_URL") {
            self.downloads.terminal_url = v;
        }
        if let Some(v) = get("DOWNLOAD_TIMEOUT") {
            self.downloads.timeout_secs = parse_env("DOWNLOAD_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            self.downloads.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("DOWNLOAD_CHUNK_SIZE") {
            self.downloads.chunk_size = parse_env("DOWNLOAD_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("VNC_PORT") {
            self.vnc.port = parse_env("VNC_PORT", &v)?;
        }
        if let Some(v) = get("CUSTOM_USER") {
            self.vnc.custom_user = Some(v);
        }
        if let Some(v) = get("PASSWORD") {
            self.vnc.password = Some(v);
        }
        if let Some(v) = get("REQUIRED_PACKAGES") {
            self.packages.required = parse_list(&v);
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("CACHE_ENABLED") {
            self.cache.enabled = parse_bool("CACHE_ENABLED", &v)?;
        }
        if let Some(v) = get("CACHE_TTL_DAYS") {
            self.cache.ttl_days = parse_env("CACHE_TTL_DAYS", &v)?;
        }
        if let Some(v) = get("STEP_FAILURE_POLICY") {
            self.pipeline.on_step_failure =
                v.parse::<FailurePolicy>().map_err(|_| ConfigError::Env {
                    key: "STEP_FAILURE_POLICY".to_string(),
                    value: v.clone(),
                })?;
        }
        Ok(())
    }

    /// Check field constraints and normalise the log level to upper case.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (name, port) in [("terminal.port", self.terminal.port), ("vnc.port", self.vnc.port)] {
            if port <= 1024 || port >= 65535 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 1025 and 65534, got {port}"
                )));
            }
        }
        if !WINE_VERSIONS.contains(&self.wine.version.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "wine.version must be one of {WINE_VERSIONS:?}, got '{}'",
                self.wine.version
            )));
        }
        let level = self.logging.level.to_ascii_uppercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {LOG_LEVELS:?}, got '{}'",
                self.logging.level
            )));
        }
        self.logging.level = level;

        let positive = [
            ("downloads.timeout_secs", self.downloads.timeout_secs),
            ("downloads.max_retries", u64::from(self.downloads.max_retries)),
            ("downloads.chunk_size", self.downloads.chunk_size as u64),
            ("cache.ttl_days", self.cache.ttl_days),
            ("terminal.startup_timeout_secs", self.terminal.startup_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        let bounded = [
            ("cache.ttl_days", self.cache.ttl_days, MAX_TTL_DAYS),
            ("downloads.timeout_secs", self.downloads.timeout_secs, MAX_WAIT_SECS),
            ("terminal.startup_timeout_secs", self.terminal.startup_timeout_secs, MAX_WAIT_SECS),
            ("pipeline.grace_period_secs", self.pipeline.grace_period_secs, MAX_WAIT_SECS),
            ("pipeline.service_settle_secs", self.pipeline.service_settle_secs, MAX_WAIT_SECS),
        ];
        for (name, value, max) in bounded {
            if value > max {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {max}, got {value}"
                )));
            }
        }
        if let Some(password) = &self.vnc.password {
            if password.len() < 8 {
                return Err(ConfigError::Invalid(
                    "vnc.password must be at least 8 characters".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// `<parent of prefix>/.cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.prefix_parent().join(".cache")
    }

    pub fn status_path(&self) -> PathBuf {
        self.prefix_parent().join("provisioner.status")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.prefix_parent().join("provisioner.lock")
    }

    fn prefix_parent(&self) -> PathBuf {
        self.wine
            .prefix
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_days.saturating_mul(24 * 60 * 60))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.terminal.startup_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.pipeline.grace_period_secs)
    }

    /// Map the Python-style level names onto a tracing filter directive.
    pub fn tracing_level(&self) -> &'static str {
        match self.logging.level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Accepts `a,b,c` as well as a JSON-style `["a", "b"]` list.
fn parse_list(value: &str) -> Vec<String> {
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
