// src/retry/mod.rs

//! Resilient retry loops for fallible operations.
//!
//! - [`backoff`] holds the delay policies.
//! - [`cursor`] holds the retry state machine and its audience-aware
//!   failure reporting.

pub mod backoff;
pub mod cursor;

pub use backoff::BackoffPolicy;
pub use cursor::{
    attempt_ordinal, Advance, Attempt, PendingFailure, RetryCursor, TaskDescription,
    DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS,
};
