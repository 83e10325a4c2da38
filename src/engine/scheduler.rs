// src/engine/scheduler.rs

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::control::StopSignal;
use crate::errors::{ExprunError, Result};
use crate::expand::TestReplica;
use crate::lifecycle::LifecycleState;
use crate::logging::UnitLogger;
use crate::retry::{BackoffPolicy, RetryCursor, TaskDescription, DEFAULT_BACKOFF};

use super::{ConductOutcome, Conductor, LifecycleHandle};

/// Attempts per replica before it is abandoned.
pub const TEST_ATTEMPTS: u32 = 5;

/// Counters reported after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Replicas whose lifecycle was spawned.
    pub started: usize,
    /// Replicas handled without running.
    pub skipped: usize,
    /// Replicas abandoned after exhausting retries or an unexpected error.
    pub failed: usize,
    /// Final state of every joined lifecycle, in join order.
    pub finished: Vec<(String, LifecycleState)>,
    /// Iteration ended because stop was requested.
    pub stopped: bool,
}

impl RunSummary {
    pub fn count(&self, state: LifecycleState) -> usize {
        self.finished.iter().filter(|(_, s)| *s == state).count()
    }
}

enum Start {
    Started,
    Skipped,
}

/// Bounded-concurrency driver over the expanded replicas.
pub struct Scheduler<C> {
    conductor: C,
    max_concurrency: usize,
    retry_backoff: Duration,
    stop: StopSignal,
    running: VecDeque<(String, LifecycleHandle)>,
    summary: RunSummary,
}

impl<C: Conductor> Scheduler<C> {
    pub fn new(conductor: C, max_concurrency: usize, stop: StopSignal) -> Self {
        Self {
            conductor,
            max_concurrency: max_concurrency.max(1),
            retry_backoff: DEFAULT_BACKOFF,
            stop,
            running: VecDeque::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn conductor(&self) -> &C {
        &self.conductor
    }

    /// Start every replica in order, then join whatever is still running.
    pub async fn run(mut self, replicas: Vec<TestReplica>) -> RunSummary {
        info!(
            replicas = replicas.len(),
            max_concurrency = self.max_concurrency,
            "scheduling tests"
        );

        for replica in replicas.iter() {
            if self.stop.is_stopping() {
                self.summary.stopped = true;
                break;
            }

            let logger = UnitLogger::for_unit(&replica.id);
            let outcome = logger.scope(self.start(replica, logger.clone())).await;

            match outcome {
                Ok(Start::Started) => self.summary.started += 1,
                Ok(Start::Skipped) => self.summary.skipped += 1,
                Err(ExprunError::EarlyExit) => {
                    info!(test = %replica.id, "stop requested; no further tests will start");
                    self.summary.stopped = true;
                    break;
                }
                Err(err) => {
                    error!(test = %replica.id, "failed to conduct test: {err:#}");
                    self.summary.failed += 1;
                }
            }
        }

        self.drain().await;
        self.summary
    }

    async fn start(&mut self, replica: &TestReplica, logger: UnitLogger) -> Result<Start> {
        let mut cursor = RetryCursor::new(
            TEST_ATTEMPTS,
            TaskDescription::new(format!("execute test {}", replica.id)),
            self.stop.clone(),
        )
        .with_backoff(self.retry_backoff, BackoffPolicy::default())
        .with_logger(logger.clone());

        loop {
            cursor.next_attempt().await?;

            while self.running.len() >= self.max_concurrency {
                self.join_oldest().await;
            }

            match self
                .conductor
                .conduct(replica, &mut cursor, logger.clone())
                .await?
            {
                ConductOutcome::Started(handle) => {
                    self.running.push_back((replica.id.clone(), handle));
                    return Ok(Start::Started);
                }
                ConductOutcome::Retry => continue,
                ConductOutcome::Skipped => return Ok(Start::Skipped),
            }
        }
    }

    async fn join_oldest(&mut self) {
        let Some((id, handle)) = self.running.pop_front() else {
            return;
        };
        debug!(test = %id, "waiting for running test to finish");
        let state = match handle.await {
            Ok(state) => state,
            Err(err) => {
                error!(test = %id, "test task ended abnormally: {err}");
                LifecycleState::Failed
            }
        };
        self.summary.finished.push((id, state));
    }

    /// Join every outstanding lifecycle, whatever its outcome.
    async fn drain(&mut self) {
        if !self.running.is_empty() {
            info!(running = self.running.len(), "joining running tests");
        }
        while !self.running.is_empty() {
            self.join_oldest().await;
        }
        if self.summary.stopped {
            warn!("run stopped before all tests were started");
        }
    }
}
