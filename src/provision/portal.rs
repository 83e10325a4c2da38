// src/provision/portal.rs

//! Retrying provisioner on top of a low-level portal driver.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::config::ConfigFile;
use crate::control::StopSignal;
use crate::errors::{ExprunError, Result};
use crate::logging::UnitLogger;
use crate::retry::{BackoffPolicy, RetryCursor, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};

use super::{Allocation, BoxFuture, Provisioner};

static NOT_ENOUGH_NODES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9]+ nodes of type .+ requested, but only [0-9]+ available nodes of type .+ found")
        .expect("valid node availability pattern")
});

const RESERVATION_VIOLATION: &str = "Resource reservation violation";

/// Status of an allocation as reported by the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationStatus {
    Created,
    Provisioning,
    Booting,
    Ready,
    Terminating,
    /// Anything else, typically `failed`.
    Other(String),
}

impl AllocationStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim() {
            "created" => AllocationStatus::Created,
            "provisioning" => AllocationStatus::Provisioning,
            "booting" => AllocationStatus::Booting,
            "ready" => AllocationStatus::Ready,
            "terminating" => AllocationStatus::Terminating,
            other => AllocationStatus::Other(other.to_string()),
        }
    }

    /// Still on its way to `ready`.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Created | AllocationStatus::Provisioning | AllocationStatus::Booting
        )
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocationStatus::Created => "created",
            AllocationStatus::Provisioning => "provisioning",
            AllocationStatus::Booting => "booting",
            AllocationStatus::Ready => "ready",
            AllocationStatus::Terminating => "terminating",
            AllocationStatus::Other(other) => other,
        };
        f.write_str(s)
    }
}

/// An allocation the portal accepted but that is not ready yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAllocation {
    pub uuid: String,
    pub name: String,
}

impl fmt::Display for PendingAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// Single-shot portal operations. No retries, no polling.
///
/// `sign_in` fails with [`ExprunError::AuthError`] when the credentials are
/// rejected. Other operations return `AuthError` when the portal session
/// has expired, which makes the provisioner sign in again.
pub trait PortalDriver: Send {
    fn sign_in(&mut self) -> BoxFuture<'_, Result<()>>;

    fn instantiate<'a>(
        &'a mut self,
        profile: &'a str,
        name: Option<&'a str>,
        expires_in_hours: u32,
    ) -> BoxFuture<'a, Result<PendingAllocation>>;

    fn status<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<AllocationStatus>>;

    /// Error message the portal shows for the allocation, if any.
    fn error_text<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Host addresses, executor host first.
    fn hosts<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    fn terminate<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub attempts: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub expires_in_hours: u32,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_BACKOFF,
            poll_interval: Duration::from_secs(4),
            expires_in_hours: 5,
        }
    }
}

impl ProvisionSettings {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: cfg.timing.retry_backoff(),
            poll_interval: Duration::from_secs(cfg.portal.poll_interval),
            expires_in_hours: cfg.portal.expires_in_hours,
        }
    }
}

/// Map a portal error message onto a short failure kind.
pub fn classify_portal_error(error_text: &str) -> &'static str {
    if error_text.contains(RESERVATION_VIOLATION) {
        "resource reservation violation"
    } else if NOT_ENOUGH_NODES.is_match(error_text) {
        "insufficient nodes available"
    } else {
        "error during provisioning"
    }
}

enum PollOutcome {
    Ready,
    Failed(String),
    Stopped,
}

pub struct PortalProvisioner<D> {
    driver: D,
    settings: ProvisionSettings,
    authenticated: bool,
    logger: UnitLogger,
    stop: StopSignal,
}

impl<D: PortalDriver> PortalProvisioner<D> {
    pub fn new(driver: D, settings: ProvisionSettings, stop: StopSignal) -> Self {
        Self {
            driver,
            settings,
            authenticated: false,
            logger: UnitLogger::global(),
            stop,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn cursor(&self, task: String) -> RetryCursor {
        RetryCursor::new(self.settings.attempts, task, self.stop.clone())
            .with_backoff(self.settings.retry_backoff, BackoffPolicy::default())
            .with_logger(self.logger.clone())
    }

    async fn sign_in(&mut self) -> Result<()> {
        let mut cursor = self.cursor("log into the portal".to_string());
        loop {
            cursor.next_attempt().await?;
            match self.driver.sign_in().await {
                Ok(()) => {
                    self.authenticated = true;
                    debug!("signed into the portal");
                    return Ok(());
                }
                Err(err @ ExprunError::AuthError(_)) => {
                    self.authenticated = false;
                    return Err(err);
                }
                Err(err) => {
                    self.authenticated = false;
                    cursor.failed_with("could not sign in", err);
                }
            }
        }
    }

    /// Sign in again if the session was lost. Rejected credentials and
    /// early exit are not retryable by the caller.
    async fn ensure_authenticated(&mut self, cursor: &mut RetryCursor) -> Result<bool> {
        if self.authenticated {
            return Ok(true);
        }
        match self.sign_in().await {
            Ok(()) => Ok(true),
            Err(err @ (ExprunError::AuthError(_) | ExprunError::EarlyExit)) => Err(err),
            Err(err) => {
                cursor.failed_with("could not log in", err);
                Ok(false)
            }
        }
    }

    fn note_driver_error(&mut self, err: &ExprunError) {
        if matches!(err, ExprunError::AuthError(_)) {
            self.authenticated = false;
        }
    }

    async fn provision_allocation(
        &mut self,
        profile: &str,
        name: Option<&str>,
    ) -> Result<Allocation> {
        let task = match name {
            Some(name) => format!("provision experiment with name {name} on the portal"),
            None => "provision experiment on the portal".to_string(),
        };
        let mut cursor = self.cursor(task);

        loop {
            cursor.next_attempt().await?;
            if !self.ensure_authenticated(&mut cursor).await? {
                continue;
            }

            let pending = match self
                .driver
                .instantiate(profile, name, self.settings.expires_in_hours)
                .await
            {
                Ok(pending) => pending,
                Err(err) => {
                    self.note_driver_error(&err);
                    cursor.failed_with("could not instantiate experiment", err);
                    continue;
                }
            };
            info!("Instantiating experiment {pending}");

            // From here on the allocation exists and every failure path
            // must try to release it.
            match self.poll_until_ready(&pending).await {
                PollOutcome::Ready => {}
                PollOutcome::Failed(reason) => {
                    cursor.failed(reason);
                    continue;
                }
                PollOutcome::Stopped => {
                    self.safe_terminate(&pending.uuid, &pending.to_string()).await;
                    return Err(ExprunError::EarlyExit);
                }
            }

            let hosts = match self.driver.hosts(&pending.uuid).await {
                Ok(hosts) => hosts,
                Err(err) => {
                    self.note_driver_error(&err);
                    cursor.failed_with("could not read allocated hosts", err);
                    self.safe_terminate(&pending.uuid, &pending.to_string()).await;
                    continue;
                }
            };
            if hosts.is_empty() {
                cursor.failed("parsed hostnames list was empty");
                if let Ok(Some(text)) = self.driver.error_text(&pending.uuid).await {
                    warn!("{text}");
                }
                debug!("Terminating experiment {pending}");
                self.safe_terminate(&pending.uuid, &pending.to_string()).await;
                continue;
            }

            return Ok(Allocation::new(pending.uuid, pending.name, hosts));
        }
    }

    async fn poll_until_ready(&mut self, pending: &PendingAllocation) -> PollOutcome {
        let mut announced = false;
        loop {
            let status = match self.driver.status(&pending.uuid).await {
                Ok(status) => status,
                Err(err) => {
                    self.note_driver_error(&err);
                    warn!("could not read status of {pending}: {err:#}");
                    self.safe_terminate(&pending.uuid, &pending.to_string()).await;
                    return PollOutcome::Failed("could not read experiment status".to_string());
                }
            };

            match status {
                AllocationStatus::Ready => return PollOutcome::Ready,
                status if status.is_pending() => {
                    if !announced {
                        debug!("Waiting for experiment to become ready");
                        announced = true;
                    }
                    if self.stop.wait(self.settings.poll_interval).await {
                        return PollOutcome::Stopped;
                    }
                }
                AllocationStatus::Terminating => {
                    self.safe_terminate(&pending.uuid, &pending.to_string()).await;
                    return PollOutcome::Failed("experiment is marked as terminating".to_string());
                }
                other => {
                    let portal_error = self
                        .driver
                        .error_text(&pending.uuid)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    error!(
                        "Experiment is marked as {other}: stopping; trying to terminate. {portal_error}"
                    );
                    self.safe_terminate(&pending.uuid, &pending.to_string()).await;
                    return PollOutcome::Failed(classify_portal_error(&portal_error).to_string());
                }
            }
        }
    }

    async fn terminate_uuid(&mut self, uuid: &str, label: &str) -> Result<()> {
        let mut cursor = self.cursor(format!("terminate experiment {label} on the portal"));
        loop {
            cursor.next_attempt().await?;
            if !self.ensure_authenticated(&mut cursor).await? {
                continue;
            }
            match self.driver.terminate(uuid).await {
                Ok(()) => {
                    info!("Terminated experiment {label}");
                    return Ok(());
                }
                Err(err) => {
                    self.note_driver_error(&err);
                    cursor.failed_with("could not terminate", err);
                }
            }
        }
    }

    /// Terminate, logging instead of returning any failure.
    async fn safe_terminate(&mut self, uuid: &str, label: &str) {
        if let Err(err) = self.terminate_uuid(uuid, label).await {
            warn!("An error occurred while attempting to terminate {label}: {err:#}");
        }
    }
}

impl<D: PortalDriver> Provisioner for PortalProvisioner<D> {
    fn login(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.sign_in())
    }

    fn provision<'a>(
        &'a mut self,
        profile: &'a str,
        name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Allocation>> {
        Box::pin(self.provision_allocation(profile, name))
    }

    fn terminate<'a>(&'a mut self, allocation: &'a Allocation) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let label = allocation.to_string();
            self.terminate_uuid(&allocation.uuid, &label).await
        })
    }

    fn set_logger(&mut self, logger: UnitLogger) -> UnitLogger {
        std::mem::replace(&mut self.logger, logger)
    }
}
