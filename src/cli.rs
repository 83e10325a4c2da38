// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::CliOverrides;

/// Command-line arguments for `exprun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "exprun",
    version,
    about = "Run a batch of distributed experiments on provisioned portal allocations.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the test configuration (TOML).
    #[arg(short = 'c', long, value_name = "PATH")]
    pub config: PathBuf,

    /// Local checkout of the experiments repository.
    #[arg(short = 'r', long, value_name = "PATH")]
    pub repo_path: PathBuf,

    /// SSH private key used to reach the allocated hosts.
    ///
    /// Ignored when the config file sets `ssh_cert`.
    #[arg(short = 'C', long, value_name = "PATH", default_value = "~/.ssh/id_rsa")]
    pub cert: PathBuf,

    /// Maximum number of experiments running at once.
    ///
    /// Ignored when the config file sets `max_concurrency`.
    #[arg(short = 't', long, value_name = "N", default_value_t = 1)]
    pub threads: usize,

    /// File holding the portal password.
    ///
    /// If omitted, `EXPRUN_PASSWORD` is used, else the password is prompted for.
    #[arg(short = 'p', long, value_name = "PATH")]
    pub password: Option<PathBuf>,

    /// Drive the portal without a visible browser.
    #[arg(long)]
    pub headless: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `EXPRUN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the expanded test plan, but don't provision
    /// anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl CliArgs {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            ssh_cert: Some(self.cert.clone()),
            max_concurrency: Some(self.threads),
            password_path: self.password.clone(),
            headless: self.headless,
        }
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
