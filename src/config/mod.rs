// src/config/mod.rs

//! Configuration loading and validation for exprun.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate basic invariants like unique test ids (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_str};
pub use model::{
    expand_home, CliOverrides, ConfigFile, ExecutionSettings, MatrixDimension, MatrixValue,
    PortalSection, RawConfigFile, TestSetConfig, TimingSection,
};
pub use validate::validate_config;
