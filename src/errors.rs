// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExprunError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Retry budget exhausted; abandons the current test unit only.
    #[error("Operation failed: could not {task} {attempts}")]
    OperationFailed { task: String, attempts: String },

    /// Cooperative shutdown; unwinds to the nearest unit boundary and is
    /// never retried.
    #[error("Exiting early: stop requested")]
    EarlyExit,

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExprunError {
    pub fn is_early_exit(&self) -> bool {
        matches!(self, ExprunError::EarlyExit)
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ExprunError>;
