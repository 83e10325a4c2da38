// src/provision/guard.rs

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::control::StopSignal;
use crate::errors::{ExprunError, Result};
use crate::logging::UnitLogger;

use super::{Allocation, Provisioner};

/// Mutual exclusion around the one provisioner shared by all replicas.
///
/// Every portal call made on behalf of a replica runs while holding a
/// [`ProvisionLease`], with the replica's logger installed on the provisioner
/// for the duration of the lease.
pub struct ProvisionGuard {
    provisioner: Mutex<Box<dyn Provisioner>>,
    holders: AtomicUsize,
    stop: StopSignal,
}

impl ProvisionGuard {
    pub fn new(provisioner: Box<dyn Provisioner>, stop: StopSignal) -> Self {
        Self {
            provisioner: Mutex::new(provisioner),
            holders: AtomicUsize::new(0),
            stop,
        }
    }

    /// Wait for exclusive access.
    ///
    /// Fails with [`ExprunError::EarlyExit`] without waiting once stop has
    /// been requested.
    pub async fn acquire(&self, logger: UnitLogger) -> Result<ProvisionLease<'_>> {
        if self.stop.is_stopping() {
            return Err(ExprunError::EarlyExit);
        }

        let mut provisioner = self.provisioner.lock().await;
        self.holders.fetch_add(1, Ordering::SeqCst);
        trace!(unit = logger.unit().unwrap_or("-"), "provision guard acquired");
        let previous = provisioner.set_logger(logger);

        Ok(ProvisionLease {
            provisioner,
            previous: Some(previous),
            holders: &self.holders,
        })
    }

    /// Number of current lease holders: always 0 or 1.
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    pub async fn login(&self, logger: UnitLogger) -> Result<()> {
        let mut lease = self.acquire(logger).await?;
        lease.login().await
    }

    pub async fn provision(
        &self,
        logger: UnitLogger,
        profile: &str,
        name: Option<&str>,
    ) -> Result<Allocation> {
        let mut lease = self.acquire(logger).await?;
        lease.provision(profile, name).await
    }

    pub async fn terminate(&self, logger: UnitLogger, allocation: &Allocation) -> Result<()> {
        let mut lease = self.acquire(logger).await?;
        lease.terminate(allocation).await
    }
}

/// Exclusive access to the provisioner. Restores the previous logger and
/// releases the lock when dropped.
pub struct ProvisionLease<'g> {
    provisioner: MutexGuard<'g, Box<dyn Provisioner>>,
    previous: Option<UnitLogger>,
    holders: &'g AtomicUsize,
}

impl Deref for ProvisionLease<'_> {
    type Target = dyn Provisioner;

    fn deref(&self) -> &Self::Target {
        self.provisioner.as_ref()
    }
}

impl DerefMut for ProvisionLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.provisioner.as_mut()
    }
}

impl Drop for ProvisionLease<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.provisioner.set_logger(previous);
        }
        self.holders.fetch_sub(1, Ordering::SeqCst);
        trace!("provision guard released");
    }
}
