// src/engine/conduct.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::ExecutionSettings;
use crate::control::StopSignal;
use crate::errors::{ExprunError, Result};
use crate::expand::TestReplica;
use crate::fs::FileSystem;
use crate::lifecycle::Lifecycle;
use crate::logging::UnitLogger;
use crate::provision::{Allocation, BoxFuture, ProvisionGuard};
use crate::remote::RemoteConnector;
use crate::render::render_config;
use crate::retry::RetryCursor;

use super::{ConductOutcome, Conductor, RunPaths};

/// Production conductor: checks the experiment template, provisions an
/// allocation through the guard, renders the replica's configuration and
/// spawns its [`Lifecycle`].
pub struct TestConductor {
    fs: Arc<dyn FileSystem>,
    experiments_dir: PathBuf,
    default_profile: Option<String>,
    guard: Arc<ProvisionGuard>,
    connector: Arc<dyn RemoteConnector>,
    settings: Arc<ExecutionSettings>,
    paths: RunPaths,
    stop: StopSignal,
}

impl TestConductor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<dyn FileSystem>,
        experiments_dir: impl Into<PathBuf>,
        default_profile: Option<String>,
        guard: Arc<ProvisionGuard>,
        connector: Arc<dyn RemoteConnector>,
        settings: Arc<ExecutionSettings>,
        paths: RunPaths,
        stop: StopSignal,
    ) -> Self {
        Self {
            fs,
            experiments_dir: experiments_dir.into(),
            default_profile,
            guard,
            connector,
            settings,
            paths,
            stop,
        }
    }

    /// `{experiments_dir}/{experiment}/conf/{remote_config}`.
    pub fn template_path(&self, experiment: &str) -> PathBuf {
        self.experiments_dir
            .join(experiment)
            .join("conf")
            .join(&self.settings.remote_config)
    }

    /// Load the replica's template, or `None` if the replica cannot run.
    fn load_template(&self, replica: &TestReplica) -> Option<String> {
        let experiment_dir = self.experiments_dir.join(&replica.experiment);
        if !self.fs.is_dir(&experiment_dir) {
            error!(
                "Test experiment directory {} not found",
                experiment_dir.display()
            );
            return None;
        }

        let template_path = self.template_path(&replica.experiment);
        if !self.fs.exists(&template_path) {
            error!(
                "Test experiment config file {} not found",
                template_path.display()
            );
            return None;
        }

        match self.fs.read_to_string(&template_path) {
            Ok(template) => Some(template),
            Err(err) => {
                error!("Could not read {}: {err:#}", template_path.display());
                None
            }
        }
    }

    /// Best-effort release of an allocation that never reached a lifecycle.
    async fn discard(&self, logger: UnitLogger, allocation: &Allocation) {
        debug!("Terminating experiment {allocation}");
        if let Err(err) = self.guard.terminate(logger, allocation).await {
            warn!("Could not terminate experiment {allocation}: {err:#}");
        }
    }

    async fn conduct_replica(
        &self,
        replica: &TestReplica,
        cursor: &mut RetryCursor,
        logger: UnitLogger,
    ) -> Result<ConductOutcome> {
        info!("Starting test {}", replica.id);
        debug!("{replica}");

        let Some(template) = self.load_template(replica) else {
            return Ok(ConductOutcome::Skipped);
        };

        // Reject templates that can never render before spending an
        // allocation on them.
        if let Err(err) = render_config(&template, &replica.options, &[]) {
            error!("{err}");
            return Ok(ConductOutcome::Skipped);
        }

        let Some(profile) = replica
            .profile
            .clone()
            .or_else(|| self.default_profile.clone())
        else {
            error!("Test {} has no experiment profile", replica.id);
            return Ok(ConductOutcome::Skipped);
        };

        if self.stop.is_stopping() {
            return Err(ExprunError::EarlyExit);
        }

        info!("Provisioning new experiment from the portal");
        let allocation = match self
            .guard
            .provision(logger.clone(), &profile, Some(&replica.id))
            .await
        {
            Ok(allocation) => allocation,
            Err(ExprunError::EarlyExit) => return Err(ExprunError::EarlyExit),
            Err(err) => {
                error!("Could not provision experiment on the portal");
                cursor.failed_cause(err);
                return Ok(ConductOutcome::Retry);
            }
        };
        let host_list: Vec<String> = allocation.hosts.iter().map(|h| format!("│ {h}")).collect();
        info!(
            "Successfully provisioned new experiment from the portal: {allocation}\n{}",
            host_list.join("\n")
        );

        let rendered = match render_config(&template, &replica.options, allocation.role_hosts()) {
            Ok(rendered) => rendered,
            Err(err) => {
                error!("Could not render config for {}: {err}", replica.id);
                self.discard(logger, &allocation).await;
                return Ok(ConductOutcome::Skipped);
            }
        };

        let paths = self.paths.for_replica(&replica.id);
        info!(
            "Using {} as the working directory",
            parent_or_self(&paths.config).display()
        );
        if let Err(err) = self.fs.write(&paths.config, rendered.as_bytes()) {
            error!("Could not write rendered config to {}", paths.config.display());
            cursor.failed_cause(err);
            self.discard(logger, &allocation).await;
            return Ok(ConductOutcome::Retry);
        }
        info!("Wrote rendered config file to {}", paths.config.display());

        let lifecycle = Lifecycle::new(
            replica.clone(),
            allocation,
            Arc::clone(&self.guard),
            Arc::clone(&self.connector),
            Arc::clone(&self.settings),
            paths,
            self.stop.clone(),
            logger.clone(),
        );
        let handle = tokio::spawn(logger.scope(lifecycle.run()));
        Ok(ConductOutcome::Started(handle))
    }
}

fn parent_or_self(path: &Path) -> &Path {
    path.parent().unwrap_or(path)
}

impl Conductor for TestConductor {
    fn conduct<'a>(
        &'a self,
        replica: &'a TestReplica,
        cursor: &'a mut RetryCursor,
        logger: UnitLogger,
    ) -> BoxFuture<'a, Result<ConductOutcome>> {
        Box::pin(self.conduct_replica(replica, cursor, logger))
    }
}
