// src/lib.rs

pub mod cli;
pub mod config;
pub mod control;
pub mod engine;
pub mod errors;
pub mod expand;
pub mod fs;
pub mod lifecycle;
pub mod logging;
pub mod provision;
pub mod remote;
pub mod render;
pub mod retry;
pub mod shutdown;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};

use crate::cli::CliArgs;
use crate::config::{load_and_validate, ConfigFile};
use crate::control::StopSignal;
use crate::engine::{RunPaths, Scheduler, TestConductor};
use crate::errors::ExprunError;
use crate::expand::{expand_tests, CompletionIndex, TestReplica};
use crate::fs::{FileSystem, RealFileSystem};
use crate::logging::UnitLogger;
use crate::provision::{CommandPortalDriver, PortalProvisioner, ProvisionGuard, ProvisionSettings};
use crate::remote::{RemoteConnector, SshConnector};
use crate::shutdown::spawn_interrupt_handler;

/// Environment variable consulted for the portal password when no password
/// file is configured.
pub const PASSWORD_ENV: &str = "EXPRUN_PASSWORD";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every replica was attempted.
    Completed,
    /// Stop was requested; running replicas were joined.
    Stopped,
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and CLI overrides
/// - completion scan and test expansion
/// - the portal provisioner behind its guard
/// - the scheduler and its lifecycles
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<RunStatus> {
    info!("Starting automated experiment execution");

    let mut cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    cfg.apply_cli(args.overrides());

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let paths = RunPaths::under(".");

    let experiments_dir = args.repo_path.join(&cfg.experiments_path);
    if !fs.is_dir(&experiments_dir) {
        bail!(
            "experiment directory {} not found",
            experiments_dir.display()
        );
    }

    let completion = CompletionIndex::scan(fs.as_ref(), &paths.results);
    let replicas = expand_tests(&cfg, &completion)?;

    if args.dry_run {
        print_dry_run(&cfg, &completion, &replicas);
        return Ok(RunStatus::Completed);
    }

    for dir in [&paths.working, &paths.logs, &paths.results] {
        fs.create_dir_all(dir)?;
    }

    let Some(username) = cfg.username.clone() else {
        bail!(ExprunError::ConfigError(
            "portal username not specified: set `username`".to_string()
        ));
    };
    let password = load_password(cfg.password_path.as_deref(), &username).await?;

    let stop = StopSignal::new();
    let headless = cfg.headless();
    info!(
        "Initializing {} portal driver for {username}",
        if headless { "headless" } else { "gui" }
    );
    let driver = CommandPortalDriver::new(cfg.portal.command.clone(), username, password, headless);
    let provisioner =
        PortalProvisioner::new(driver, ProvisionSettings::from_config(&cfg), stop.clone());
    let guard = Arc::new(ProvisionGuard::new(Box::new(provisioner), stop.clone()));

    let interrupts = spawn_interrupt_handler(stop.clone());

    info!("Logging into the portal");
    match guard.login(UnitLogger::global()).await {
        Ok(()) => info!("Portal login successful"),
        Err(ExprunError::EarlyExit) => {
            interrupts.abort();
            return Ok(RunStatus::Stopped);
        }
        Err(err) => {
            interrupts.abort();
            error!("Could not log into the portal: {err:#}");
            return Err(err).context("logging into the portal");
        }
    }

    let connector: Arc<dyn RemoteConnector> =
        Arc::new(SshConnector::new(cfg.ssh_username(), cfg.ssh_cert()));
    let conductor = TestConductor::new(
        fs,
        experiments_dir,
        cfg.profile.clone(),
        guard,
        connector,
        Arc::new(cfg.execution_settings()),
        paths,
        stop.clone(),
    );

    let summary = Scheduler::new(conductor, cfg.max_concurrency(), stop.clone())
        .with_retry_backoff(cfg.timing.retry_backoff())
        .run(replicas)
        .await;
    interrupts.abort();

    info!(
        started = summary.started,
        skipped = summary.skipped,
        failed = summary.failed,
        "Exiting"
    );

    Ok(if stop.is_stopping() {
        RunStatus::Stopped
    } else {
        RunStatus::Completed
    })
}

/// Portal password: the password file if one is configured, else
/// [`PASSWORD_ENV`], else a prompt on stdin.
pub async fn load_password(path: Option<&Path>, username: &str) -> Result<String> {
    if let Some(path) = path {
        let path = config::expand_home(path);
        let password = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("could not load portal password file at {}", path.display()))?;
        return Ok(password.trim().to_string());
    }

    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        debug!("using portal password from {PASSWORD_ENV}");
        return Ok(password);
    }

    eprint!("Portal password for {username}: ");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let password = lines
        .next_line()
        .await
        .context("reading portal password from stdin")?
        .unwrap_or_default();
    Ok(password.trim().to_string())
}

/// Simple dry-run output: print the expanded test plan.
fn print_dry_run(cfg: &ConfigFile, completion: &CompletionIndex, replicas: &[TestReplica]) {
    println!("exprun dry-run");
    println!("  repo = {}", cfg.repo);
    if let Some(branch) = &cfg.branch {
        println!("  branch = {branch}");
    }
    println!("  max_concurrency = {}", cfg.max_concurrency());
    println!("  archives already collected = {}", completion.len());
    println!();

    println!("replicas ({}):", replicas.len());
    for replica in replicas {
        println!("  - {replica}");
        if let Some(profile) = &replica.profile {
            println!("      profile: {profile}");
        }
        for (key, value) in replica.options.iter() {
            println!("      {key} = {value}");
        }
    }

    debug!("dry-run complete (no provisioning)");
}
