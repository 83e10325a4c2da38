// src/retry/cursor.rs

//! Explicit retry state machine.
//!
//! A [`RetryCursor`] is created per resilient operation. The caller loops on
//! [`RetryCursor::advance`] (or [`RetryCursor::next_attempt`]), performs the
//! action, and reports a failure with one of the `failed*` methods before
//! advancing again. Returning from the loop without reporting a failure is
//! the success path.

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::control::StopSignal;
use crate::errors::{ExprunError, Result};
use crate::logging::{UnitLogger, DETAIL_TARGET};

use super::backoff::BackoffPolicy;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

/// What is being retried, phrased for one or two audiences.
///
/// The internal phrasing carries detail such as host names and goes to the
/// replica's own log; the external phrasing is what the console shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescription {
    internal: String,
    external: Option<String>,
}

impl TaskDescription {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            internal: task.into(),
            external: None,
        }
    }

    pub fn with_external(internal: impl Into<String>, external: impl Into<String>) -> Self {
        Self {
            internal: internal.into(),
            external: Some(external.into()),
        }
    }

    pub fn internal(&self) -> &str {
        &self.internal
    }

    pub fn external(&self) -> Option<&str> {
        self.external.as_deref()
    }
}

impl From<&str> for TaskDescription {
    fn from(task: &str) -> Self {
        TaskDescription::new(task)
    }
}

impl From<String> for TaskDescription {
    fn from(task: String) -> Self {
        TaskDescription::new(task)
    }
}

/// Handle for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    index: u32,
}

impl Attempt {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_first(&self) -> bool {
        self.index == 0
    }
}

/// Result of advancing a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Attempt(Attempt),
    /// The retry budget is spent; the terminal failure has been logged.
    Exhausted,
    /// Stop was requested while backing off.
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingFailure {
    pub message: Option<String>,
    pub cause: Option<String>,
}

#[derive(Debug)]
pub struct RetryCursor {
    index: i64,
    max_attempts: u32,
    base: Duration,
    policy: BackoffPolicy,
    task: TaskDescription,
    pending: PendingFailure,
    exhausted: bool,
    logger: UnitLogger,
    stop: StopSignal,
}

impl RetryCursor {
    pub fn new(max_attempts: u32, task: impl Into<TaskDescription>, stop: StopSignal) -> Self {
        Self {
            index: -1,
            max_attempts,
            base: DEFAULT_BACKOFF,
            policy: BackoffPolicy::default(),
            task: task.into(),
            pending: PendingFailure::default(),
            exhausted: false,
            logger: UnitLogger::global(),
            stop,
        }
    }

    pub fn with_backoff(mut self, base: Duration, policy: BackoffPolicy) -> Self {
        self.base = base;
        self.policy = policy;
        self
    }

    pub fn with_logger(mut self, logger: UnitLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Index of the current attempt; `-1` before the first advance.
    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn task(&self) -> &TaskDescription {
        &self.task
    }

    pub fn pending_failure(&self) -> &PendingFailure {
        &self.pending
    }

    /// Record why the current attempt failed.
    pub fn failed(&mut self, message: impl Into<String>) {
        self.pending = PendingFailure {
            message: Some(message.into()),
            cause: None,
        };
    }

    pub fn failed_with(&mut self, message: impl Into<String>, cause: impl fmt::Display) {
        self.pending = PendingFailure {
            message: Some(message.into()),
            cause: Some(format!("{cause:#}")),
        };
    }

    /// Record a failure described only by its cause.
    pub fn failed_cause(&mut self, cause: impl fmt::Display) {
        self.pending = PendingFailure {
            message: None,
            cause: Some(format!("{cause:#}")),
        };
    }

    /// Move to the next attempt, backing off first unless this is the first.
    pub async fn advance(&mut self) -> Advance {
        if self.exhausted {
            return Advance::Exhausted;
        }

        self.index += 1;
        let index = u32::try_from(self.index).unwrap_or(u32::MAX);

        if index >= self.max_attempts {
            self.exhausted = true;
            let attempts = attempts_text(self.max_attempts);
            self.report_exhausted(&attempts);
            return Advance::Exhausted;
        }

        if index > 0 {
            let delay = self.policy.delay(index, self.base);
            let secs = delay.as_secs_f64();
            let retry_text = format!(
                "retrying in {:.1} {}",
                secs,
                if secs != 1.0 { "seconds" } else { "second" }
            );
            let attempt_text = format!(" after the {}", attempt_ordinal(index));
            let failure_text = match self.pending.message.as_deref() {
                Some(message) => format!(" [{message}]{attempt_text}"),
                None => attempt_text,
            };
            self.report_retry(&failure_text, &retry_text);

            if let Some(cause) = self.pending.cause.as_deref() {
                debug!("Caused by:\n{cause}");
            }
            self.pending = PendingFailure::default();

            if self.stop.wait(delay).await {
                return Advance::Stopped;
            }
        }

        Advance::Attempt(Attempt { index })
    }

    /// [`advance`](Self::advance) with the terminal tags mapped to errors.
    pub async fn next_attempt(&mut self) -> Result<Attempt> {
        match self.advance().await {
            Advance::Attempt(attempt) => Ok(attempt),
            Advance::Exhausted => Err(ExprunError::OperationFailed {
                task: self.task.internal.clone(),
                attempts: attempts_text(self.max_attempts),
            }),
            Advance::Stopped => Err(ExprunError::EarlyExit),
        }
    }

    fn report_exhausted(&self, attempts: &str) {
        match (self.task.external(), self.logger.splits_audiences()) {
            (Some(external), true) => {
                error!(target: DETAIL_TARGET, "Failed to {} {}", self.task.internal, attempts);
                error!("Failed to {} {}", external, attempts);
            }
            (Some(external), false) => error!("Failed to {} {}", external, attempts),
            (None, _) => error!("Failed to {} {}", self.task.internal, attempts),
        }
    }

    fn report_retry(&self, failure_text: &str, retry_text: &str) {
        match (self.task.external(), self.logger.splits_audiences()) {
            (Some(external), true) => {
                warn!(
                    target: DETAIL_TARGET,
                    "Failed to {}{}; {}", self.task.internal, failure_text, retry_text
                );
                warn!("Failed to {}{}; {}", external, failure_text, retry_text);
            }
            (Some(external), false) => {
                warn!("Failed to {}{}; {}", external, failure_text, retry_text)
            }
            (None, _) => warn!("Failed to {}{}; {}", self.task.internal, failure_text, retry_text),
        }
    }
}

fn attempts_text(count: u32) -> String {
    format!(
        "after {} {}",
        count,
        if count == 1 { "attempt" } else { "attempts" }
    )
}

/// `1st attempt`, `2nd attempt`, ... chosen by `index % 10`.
pub fn attempt_ordinal(index: u32) -> String {
    let suffix = match index % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    };
    format!("{index}{suffix} attempt")
}
