// src/provision/mod.rs

//! Provisioning of experiment allocations.
//!
//! - [`Provisioner`] is the interface the engine talks to.
//! - [`portal::PortalProvisioner`] implements it on top of a low-level
//!   [`portal::PortalDriver`], adding retries, status polling and failure
//!   classification.
//! - [`command::CommandPortalDriver`] is the production driver, backed by an
//!   external helper program.
//! - [`guard::ProvisionGuard`] serializes every call to the single
//!   provisioner shared by all running replicas.

pub mod command;
pub mod guard;
pub mod portal;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::errors::Result;
use crate::logging::UnitLogger;

pub use command::CommandPortalDriver;
pub use guard::{ProvisionGuard, ProvisionLease};
pub use portal::{
    classify_portal_error, AllocationStatus, PendingAllocation, PortalDriver, PortalProvisioner,
    ProvisionSettings,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A provisioned set of hosts, owned by one lifecycle until terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub uuid: String,
    pub name: String,
    /// Executor host first, role hosts after it.
    pub hosts: Vec<String>,
}

impl Allocation {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            hosts,
        }
    }

    /// The host that drives the experiment.
    pub fn executor_host(&self) -> Option<&str> {
        self.hosts.first().map(String::as_str)
    }

    pub fn role_hosts(&self) -> &[String] {
        self.hosts.get(1..).unwrap_or(&[])
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// The provisioning resource.
///
/// Not safe for concurrent use: callers go through [`ProvisionGuard`].
pub trait Provisioner: Send {
    fn login(&mut self) -> BoxFuture<'_, Result<()>>;

    fn provision<'a>(
        &'a mut self,
        profile: &'a str,
        name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Allocation>>;

    fn terminate<'a>(&'a mut self, allocation: &'a Allocation) -> BoxFuture<'a, Result<()>>;

    /// Install `logger` for subsequent calls and return the one it replaces.
    fn set_logger(&mut self, logger: UnitLogger) -> UnitLogger;
}
