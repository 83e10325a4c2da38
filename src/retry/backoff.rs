// src/retry/backoff.rs

use std::time::Duration;

/// Maps (attempt index, base duration) to the wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    /// Always `base`.
    Constant,
    /// `base * (1 + factor * index)`.
    Linear { factor: f64 },
    /// `base * (1 + factor * index^2)`.
    Quadratic { factor: f64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Quadratic { factor: 0.5 }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, index: u32, base: Duration) -> Duration {
        let i = f64::from(index);
        let multiplier = match *self {
            BackoffPolicy::Constant => 1.0,
            BackoffPolicy::Linear { factor } => 1.0 + factor * i,
            BackoffPolicy::Quadratic { factor } => 1.0 + factor * i * i,
        };
        // Negative factors could drive the multiplier below zero.
        base.mul_f64(multiplier.max(0.0))
    }
}
