// src/control.rs

//! Cooperative shutdown primitive shared by every unit of work.
//!
//! A [`StopSignal`] is a stop flag plus a broadcast wake-up. It is cloned and
//! threaded through constructors instead of living in a global; every clone
//! observes the same flag.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Set the stop flag and wake every blocked waiter.
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            debug!("stop requested; waking all waiters");
        }
        self.token.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Block for `delay` or until stop is requested.
    ///
    /// Returns `true` if stop was requested before or during the wait.
    pub async fn wait(&self, delay: Duration) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(delay) => self.token.is_cancelled(),
        }
    }

    /// Resolves once stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}
