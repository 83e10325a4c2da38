// src/engine/mod.rs

//! Orchestration engine for exprun.
//!
//! - [`scheduler`] walks the expanded replicas in order and keeps at most
//!   `max_concurrency` lifecycles running, joining the oldest when full.
//! - [`conduct`] prepares one replica (template checks, provisioning,
//!   rendering) and spawns its lifecycle.
//!
//! The scheduler only sees the [`Conductor`] trait, so tests can drive it
//! with a scripted fake instead of a real portal.

pub mod conduct;
pub mod scheduler;

use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;

use crate::errors::Result;
use crate::expand::TestReplica;
use crate::lifecycle::{LifecycleState, ReplicaPaths};
use crate::logging::UnitLogger;
use crate::provision::BoxFuture;
use crate::retry::RetryCursor;

pub use conduct::TestConductor;
pub use scheduler::{RunSummary, Scheduler};

/// Handle to a spawned lifecycle.
pub type LifecycleHandle = JoinHandle<LifecycleState>;

/// What happened when a replica was handed to the conductor.
#[derive(Debug)]
pub enum ConductOutcome {
    /// The lifecycle is running.
    Started(LifecycleHandle),
    /// A transient failure was recorded on the cursor; try again.
    Retry,
    /// Handled without running (missing directory or template, bad
    /// template); move on to the next replica.
    Skipped,
}

/// Prepares and launches one replica.
pub trait Conductor: Send + Sync {
    /// `cursor` is the replica's retry cursor; a [`ConductOutcome::Retry`]
    /// must be preceded by a `failed*` call on it.
    fn conduct<'a>(
        &'a self,
        replica: &'a TestReplica,
        cursor: &'a mut RetryCursor,
        logger: UnitLogger,
    ) -> BoxFuture<'a, Result<ConductOutcome>>;
}

/// Local working directories of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// Rendered configs, one directory per replica.
    pub working: PathBuf,
    /// Per-replica log files.
    pub logs: PathBuf,
    /// Downloaded result archives.
    pub results: PathBuf,
}

impl RunPaths {
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            working: root.join("working"),
            logs: root.join("logs"),
            results: root.join("results"),
        }
    }

    pub fn for_replica(&self, id: &str) -> ReplicaPaths {
        ReplicaPaths {
            config: self.working.join(id).join("config.sh"),
            results: self.results.join(format!("{id}.tar.gz")),
        }
    }
}
