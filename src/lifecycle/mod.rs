// src/lifecycle/mod.rs

//! Per-replica remote execution: setup → execute → teardown.
//!
//! A [`Lifecycle`] owns the allocation it was handed until teardown releases
//! it through the [`ProvisionGuard`]. Every remote step runs under its own
//! [`RetryCursor`]; the execute stage is additionally wrapped in an outer
//! cursor so a dropped session or failed clone restarts the whole stage on a
//! fresh session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ExecutionSettings;
use crate::control::StopSignal;
use crate::errors::{ExprunError, Result};
use crate::expand::TestReplica;
use crate::logging::{UnitLogger, DETAIL_TARGET};
use crate::provision::{Allocation, ProvisionGuard};
use crate::remote::{
    run_sequence, stream_command, CommandFailed, RemoteConnector, RemoteSession, Transfer,
    TransferDirection,
};
use crate::retry::{BackoffPolicy, RetryCursor, TaskDescription};

pub const REMOTE_CERT_PATH: &str = ".ssh/id_rsa";
pub const REMOTE_REPO_DIR: &str = "repo";
pub const RUN_SCRIPT: &str = "./scripts/run.sh";

const TRANSFER_ATTEMPTS: u32 = 10;
const SESSION_ATTEMPTS: u32 = 10;
const CLONE_ATTEMPTS: u32 = 10;
const COPY_CONFIG_ATTEMPTS: u32 = 10;
const EXECUTE_ATTEMPTS: u32 = 5;
const RESULTS_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Setup,
    Execute,
    Teardown,
    Done,
    Failed,
    EarlyExit,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Done | LifecycleState::Failed | LifecycleState::EarlyExit
        )
    }
}

/// Local files belonging to one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPaths {
    /// Rendered configuration document to upload.
    pub config: PathBuf,
    /// Where the results archive is downloaded to.
    pub results: PathBuf,
}

pub struct Lifecycle {
    replica: TestReplica,
    allocation: Allocation,
    guard: Arc<ProvisionGuard>,
    connector: Arc<dyn RemoteConnector>,
    settings: Arc<ExecutionSettings>,
    paths: ReplicaPaths,
    stop: StopSignal,
    logger: UnitLogger,
    state: LifecycleState,
}

impl Lifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replica: TestReplica,
        allocation: Allocation,
        guard: Arc<ProvisionGuard>,
        connector: Arc<dyn RemoteConnector>,
        settings: Arc<ExecutionSettings>,
        paths: ReplicaPaths,
        stop: StopSignal,
        logger: UnitLogger,
    ) -> Self {
        Self {
            replica,
            allocation,
            guard,
            connector,
            settings,
            paths,
            stop,
            logger,
            state: LifecycleState::Setup,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// `repo/{experiments_path}/{experiment}` on the executor host.
    pub fn remote_experiment_path(&self) -> String {
        format!(
            "{}/{}/{}",
            REMOTE_REPO_DIR, self.settings.experiments_path, self.replica.experiment
        )
    }

    /// Drive the lifecycle to completion and return its final state.
    ///
    /// Retry exhaustion and early exit end the unit here; they are logged,
    /// not returned. The allocation is released on every path except an
    /// early exit, where the portal may no longer be usable.
    pub async fn run(mut self) -> LifecycleState {
        let Some(host) = self.allocation.executor_host().map(str::to_string) else {
            error!("allocation {} has no hosts", self.allocation);
            self.state = match self.release().await {
                Err(ExprunError::EarlyExit) => LifecycleState::EarlyExit,
                _ => LifecycleState::Failed,
            };
            return self.state;
        };

        info!("Starting execution on {host}");
        let outcome = self.run_stages(&host).await;

        self.state = match outcome {
            Ok(()) => {
                info!("Finished execution on {host}");
                LifecycleState::Done
            }
            Err(ExprunError::EarlyExit) => {
                warn!("Exiting test early");
                LifecycleState::EarlyExit
            }
            Err(err) => {
                error!("Failed test; exiting: {err:#}");
                LifecycleState::Failed
            }
        };
        self.state
    }

    async fn run_stages(&mut self, host: &str) -> Result<()> {
        self.state = LifecycleState::Setup;
        info!(target: DETAIL_TARGET, "Beginning setup");
        if let Err(err) = self.setup(host).await {
            return self.abandon(err).await;
        }

        self.state = LifecycleState::Execute;
        info!(target: DETAIL_TARGET, "Beginning execute");
        if let Err(err) = self.execute(host).await {
            return self.abandon(err).await;
        }

        self.state = LifecycleState::Teardown;
        info!(target: DETAIL_TARGET, "Beginning teardown");
        self.teardown(host).await
    }

    /// Release the allocation after a failed stage, then report the
    /// stage's error.
    async fn abandon(&mut self, err: ExprunError) -> Result<()> {
        if !err.is_early_exit() {
            self.state = LifecycleState::Teardown;
            self.release().await?;
        }
        Err(err)
    }

    fn cursor(&self, attempts: u32, task: impl Into<TaskDescription>) -> RetryCursor {
        RetryCursor::new(attempts, task, self.stop.clone())
            .with_backoff(self.settings.timing.retry_backoff(), BackoffPolicy::default())
            .with_logger(self.logger.clone())
    }

    async fn setup(&self, host: &str) -> Result<()> {
        info!(
            target: DETAIL_TARGET,
            "Transferring the SSH certificate from {} to remote:{REMOTE_CERT_PATH}",
            self.settings.ssh_cert.display()
        );
        self.transfer(
            host,
            Transfer::upload(&self.settings.ssh_cert, REMOTE_CERT_PATH),
            TRANSFER_ATTEMPTS,
        )
        .await?;

        info!(
            target: DETAIL_TARGET,
            "Transferring rendered config file from {} to remote:{}",
            self.paths.config.display(),
            self.settings.remote_config
        );
        self.transfer(
            host,
            Transfer::upload(&self.paths.config, self.settings.remote_config.clone()),
            TRANSFER_ATTEMPTS,
        )
        .await
    }

    async fn transfer(&self, host: &str, transfer: Transfer, attempts: u32) -> Result<()> {
        let preposition = match transfer.direction {
            TransferDirection::Upload => "to",
            TransferDirection::Download => "from",
        };
        let local = transfer.local.display().to_string();
        let task = TaskDescription::with_external(
            format!("transfer '{local}' {preposition} host {host}"),
            format!("transfer '{local}' {preposition} remote"),
        );
        let mut cursor = self.cursor(attempts, task);

        loop {
            cursor.next_attempt().await?;
            match self.connector.transfer(host, &transfer).await {
                Ok(0) => return Ok(()),
                Ok(code) => cursor.failed(format!("exit code ({code})")),
                Err(err) => cursor.failed_cause(err),
            }
        }
    }

    async fn execute(&self, host: &str) -> Result<()> {
        let mut outer = self.cursor(
            EXECUTE_ATTEMPTS,
            TaskDescription::with_external(
                format!("execute experiment {} on host {host}", self.replica.id),
                format!("execute experiment {}", self.replica.id),
            ),
        );

        loop {
            outer.next_attempt().await?;

            info!(target: DETAIL_TARGET, "Attaching a remote terminal to the executor host");
            let mut session = match self.open_session(host).await {
                Ok(session) => session,
                Err(ExprunError::EarlyExit) => return Err(ExprunError::EarlyExit),
                Err(err) => {
                    outer.failed_cause(err);
                    continue;
                }
            };
            let outcome = self.run_experiment(session.as_mut(), host).await;
            if let Err(err) = session.close().await {
                debug!("closing remote session failed: {err:#}");
            }

            match outcome {
                Ok(()) => return Ok(()),
                Err(ExprunError::EarlyExit) => return Err(ExprunError::EarlyExit),
                Err(err) => outer.failed_cause(err),
            }
        }
    }

    async fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>> {
        let mut cursor = self.cursor(
            SESSION_ATTEMPTS,
            TaskDescription::with_external(
                format!("attach ssh terminal to host {host}"),
                "attach ssh terminal to remote",
            ),
        );
        loop {
            cursor.next_attempt().await?;
            match self.connector.open(host).await {
                Ok(session) => return Ok(session),
                Err(err) => cursor.failed_cause(err),
            }
        }
    }

    async fn run_experiment(&self, session: &mut dyn RemoteSession, host: &str) -> Result<()> {
        let timing = &self.settings.timing;

        info!(
            target: DETAIL_TARGET,
            "Cloning the repo {} into remote:{REMOTE_REPO_DIR}", self.settings.repo
        );
        self.run_commands(
            session,
            host,
            &clone_commands(&self.settings.repo, self.settings.branch.as_deref()),
            CLONE_ATTEMPTS,
            timing.clone_timeout(),
        )
        .await?;

        let experiment_path = self.remote_experiment_path();
        let remote_config = &self.settings.remote_config;
        let dest_config = format!("{experiment_path}/conf/{remote_config}");
        debug!("Copy the config file from remote:{remote_config} into place at remote:{dest_config}");
        self.run_commands(
            session,
            host,
            &[format!("cp {remote_config} {dest_config}")],
            COPY_CONFIG_ATTEMPTS,
            timing.command_timeout(),
        )
        .await?;

        debug!("Change the working directory to remote:{experiment_path}");
        self.run_commands(
            session,
            host,
            &[format!("cd {experiment_path}")],
            1,
            timing.command_timeout(),
        )
        .await?;

        info!(target: DETAIL_TARGET, "Running primary script at remote:{RUN_SCRIPT}");
        let status = stream_command(session, RUN_SCRIPT, timing.script_read_timeout()).await?;
        if status != 0 {
            warn!("{RUN_SCRIPT} exited with status {status}");
        }
        info!(target: DETAIL_TARGET, "Finished primary script");
        Ok(())
    }

    /// Retry a command sequence while its commands fail. Session errors are
    /// returned immediately so the outer execute cursor can reconnect.
    async fn run_commands(
        &self,
        session: &mut dyn RemoteSession,
        host: &str,
        commands: &[String],
        attempts: u32,
        timeout: Duration,
    ) -> Result<()> {
        let task = TaskDescription::with_external(
            format!("execute sequence {commands:?} on host {host}"),
            format!("execute sequence {commands:?} on remote"),
        );
        let mut cursor = self.cursor(attempts, task);
        loop {
            cursor.next_attempt().await?;
            match run_sequence(session, commands, timeout).await {
                Ok(()) => return Ok(()),
                Err(ExprunError::Other(err)) => match err.downcast_ref::<CommandFailed>() {
                    Some(failed) => {
                        let message = format!("command: {}", failed.command);
                        cursor.failed_with(message, err);
                    }
                    None => return Err(ExprunError::Other(err)),
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn teardown(&mut self, host: &str) -> Result<()> {
        let remote_results = format!("{}/results.tar.gz", self.remote_experiment_path());
        debug!(
            "Moving the results tar from remote:{remote_results} to {}",
            self.paths.results.display()
        );
        if let Some(parent) = self.paths.results.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!("could not create {}: {err}", parent.display());
            }
        }
        let download = Transfer::download(remote_results, &self.paths.results);
        match self.transfer(host, download, RESULTS_ATTEMPTS).await {
            Ok(()) => {}
            Err(ExprunError::EarlyExit) => return Err(ExprunError::EarlyExit),
            Err(err) => error!("Could not collect results: {err:#}"),
        }

        self.release().await
    }

    /// Terminate the allocation through the guard, then cool down.
    ///
    /// Termination failures are logged and swallowed. Skipped entirely once
    /// stop is requested; an early exit during the cooldown is returned.
    async fn release(&mut self) -> Result<()> {
        if self.stop.is_stopping() {
            return Err(ExprunError::EarlyExit);
        }

        match self
            .guard
            .terminate(self.logger.clone(), &self.allocation)
            .await
        {
            Ok(()) => {}
            Err(ExprunError::EarlyExit) => return Err(ExprunError::EarlyExit),
            Err(err) => error!("Could not terminate experiment {}: {err:#}", self.allocation),
        }

        let cooldown = self.settings.timing.cooldown();
        info!("Sleeping for {cooldown:?} after finished experiment");
        if self.stop.wait(cooldown).await {
            return Err(ExprunError::EarlyExit);
        }
        Ok(())
    }
}

/// `sudo rm -rf repo` followed by the clone of `repo` at `branch`.
pub fn clone_commands(repo: &str, branch: Option<&str>) -> Vec<String> {
    let mut clone = String::from("git clone");
    if let Some(branch) = branch.filter(|b| !b.is_empty()) {
        clone.push_str(&format!(" --single-branch --branch \"{branch}\""));
    }
    clone.push_str(&format!(" \"{repo}\" {REMOTE_REPO_DIR}"));
    vec![format!("sudo rm -rf {REMOTE_REPO_DIR}"), clone]
}
