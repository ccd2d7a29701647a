mod cache;
mod command;
mod config;
mod download;
mod lock;
mod pipeline;
mod retry;
mod signals;
mod status;
mod supervisor;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::ContentCache;
use crate::command::CommandRunner;
use crate::config::{Config, FailurePolicy};
use crate::download::Downloader;
use crate::lock::InstanceLock;
use crate::pipeline::InstallationPipeline;
use crate::signals::{SignalController, StopFlag};
use crate::status::StatusTracker;
use crate::supervisor::ProcessSupervisor;

/// Provisions a Wine prefix with the trading terminal stack: downloads and
/// verifies installers, runs each install step once, launches the terminal
/// and its bridge service, and supervises them until signalled.
#[derive(Parser, Debug)]
#[command(name = "wine-provisioner", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "provisioner.toml")]
    config: PathBuf,

    /// Wine prefix (overrides config and WINEPREFIX)
    #[arg(short, long)]
    prefix: Option<PathBuf>,

    /// What to do when a step fails: continue or halt
    #[arg(long)]
    policy: Option<FailurePolicy>,

    /// Log level: DEBUG, INFO, WARNING, ERROR, CRITICAL
    #[arg(long)]
    log_level: Option<String>,

    /// Disable the download cache for this run
    #[arg(long)]
    no_cache: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.tracing_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "wine-provisioner starting");
    tracing::debug!(?cli, "parsed CLI arguments");

    if cli.dry_run {
        print_resolved(&config);
        return;
    }

    if let Err(e) = run(&config).await {
        tracing::error!(error = %e, "provisioning failed");
        std::process::exit(1);
    }
    tracing::info!("wine-provisioner exiting");
}

/// File, then environment, then CLI flags; validated last.
fn resolve_config(cli: &Cli) -> Result<Config, config::ConfigError> {
    let mut config = Config::load(&cli.config)?;
    let env: std::collections::HashMap<String, String> = std::env::vars().collect();
    config.apply_env(&env)?;

    if let Some(prefix) = &cli.prefix {
        config.wine.prefix = prefix.clone();
    }
    if let Some(policy) = cli.policy {
        config.pipeline.on_step_failure = policy;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.no_cache {
        config.cache.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

fn print_resolved(config: &Config) {
    let mut shown = config.clone();
    if shown.vnc.password.is_some() {
        shown.vnc.password = Some("********".to_string());
    }
    match toml::to_string_pretty(&shown) {
        Ok(text) => {
            println!("Dry run: config validated, not running.\n");
            println!("{text}");
            println!("cache dir:   {}", config.cache_dir().display());
            println!("status file: {}", config.status_path().display());
            println!("lock file:   {}", config.lock_path().display());
        }
        Err(e) => tracing::error!(error = %e, "failed to render config"),
    }
}

async fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let _lock = InstanceLock::acquire(&config.lock_path())?;

    let signals = SignalController::install(StopFlag::new())?;
    let stop = signals.flag().clone();

    let cache = ContentCache::new(config.cache_dir(), config.cache_ttl(), config.cache.enabled);
    let downloader = Downloader::new(&config.downloads, cache, stop.clone())?;
    let supervisor = Arc::new(ProcessSupervisor::new(config.grace_period()));
    let runner = CommandRunner::new(stop.clone(), supervisor, config.grace_period());

    let mut pipeline = InstallationPipeline::new(config, downloader, runner, stop)
        .with_status(StatusTracker::new(config.status_path()));
    let report = pipeline.execute().await?;

    if !report.forced.is_empty() {
        tracing::warn!(forced = ?report.forced, "some processes had to be killed");
    }
    Ok(())
}
