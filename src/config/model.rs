// src/config/model.rs

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use toml::Table;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// repo = "https://github.com/example/experiments.git"
/// branch = "main"
/// username = "alice"
/// profile = "small-lan"
///
/// [options]
/// DURATION = 60
///
/// [[tests]]
/// id = "baseline"
/// experiment = "kv-store"
/// replicas = 3
///
/// [[tests.matrix]]
/// name = "clients"
/// values = [{ id = "c8", options = { CLIENTS = 8 } }]
/// ```
///
/// This is the unchecked form; see [`ConfigFile`] for the validated one.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    /// Git URL of the repository holding the experiments.
    #[serde(default)]
    pub repo: Option<String>,

    /// Optional branch to clone.
    #[serde(default)]
    pub branch: Option<String>,

    /// Portal account name.
    #[serde(default)]
    pub username: Option<String>,

    /// Remote login name; falls back to `username`, then `root`.
    #[serde(default)]
    pub ssh_username: Option<String>,

    /// Default experiment profile for tests that do not name one.
    #[serde(default)]
    pub profile: Option<String>,

    /// Directory (relative to the repo root) holding one folder per experiment.
    #[serde(default = "default_experiments_path")]
    pub experiments_path: String,

    /// Name of the rendered configuration document on the remote host.
    #[serde(default = "default_remote_config")]
    pub remote_config: String,

    #[serde(default)]
    pub ssh_cert: Option<PathBuf>,

    #[serde(default)]
    pub password_path: Option<PathBuf>,

    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub headless: Option<bool>,

    #[serde(default)]
    pub timing: TimingSection,

    #[serde(default)]
    pub portal: PortalSection,

    /// Global option overrides applied to every test.
    #[serde(default)]
    pub options: Table,

    #[serde(default)]
    pub tests: Vec<TestSetConfig>,
}

fn default_experiments_path() -> String {
    "experiments".to_string()
}

fn default_remote_config() -> String {
    "config.sh".to_string()
}

/// `[timing]` section. All values are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingSection {
    /// Base backoff for retried steps.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: u64,

    /// Pause after terminating an allocation before the slot counts as free.
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,

    /// Read timeout for ordinary remote commands.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Read timeout for the repository clone.
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,

    /// Read cycle while streaming the run script's output.
    #[serde(default = "default_script_read_timeout")]
    pub script_read_timeout: u64,
}

fn default_retry_backoff() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    300
}

fn default_command_timeout() -> u64 {
    30
}

fn default_clone_timeout() -> u64 {
    120
}

fn default_script_read_timeout() -> u64 {
    60
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            retry_backoff: default_retry_backoff(),
            cooldown: default_cooldown(),
            command_timeout: default_command_timeout(),
            clone_timeout: default_clone_timeout(),
            script_read_timeout: default_script_read_timeout(),
        }
    }
}

impl TimingSection {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout)
    }

    pub fn script_read_timeout(&self) -> Duration {
        Duration::from_secs(self.script_read_timeout)
    }
}

/// `[portal]` section: how to reach the provisioning portal driver.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalSection {
    /// Helper program implementing the portal driver protocol.
    #[serde(default = "default_portal_command")]
    pub command: String,

    /// Seconds between allocation status polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Requested allocation lifetime in hours.
    #[serde(default = "default_expires_in")]
    pub expires_in_hours: u32,
}

fn default_portal_command() -> String {
    "exprun-portal".to_string()
}

fn default_poll_interval() -> u64 {
    4
}

fn default_expires_in() -> u32 {
    5
}

impl Default for PortalSection {
    fn default() -> Self {
        Self {
            command: default_portal_command(),
            poll_interval: default_poll_interval(),
            expires_in_hours: default_expires_in(),
        }
    }
}

/// One `[[tests]]` entry: a declarative test set.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TestSetConfig {
    #[serde(default)]
    pub id: String,

    /// Folder name under `experiments_path`.
    #[serde(default)]
    pub experiment: String,

    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Replicas already finished in an earlier run.
    #[serde(default)]
    pub completed: u32,

    #[serde(default)]
    pub options: Table,

    /// Matrix dimensions, expanded in declaration order.
    #[serde(default)]
    pub matrix: Vec<MatrixDimension>,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MatrixDimension {
    #[serde(default = "default_dimension_name")]
    pub name: String,

    #[serde(default)]
    pub values: Vec<MatrixValue>,
}

fn default_dimension_name() -> String {
    "unknown".to_string()
}

/// A value of a matrix dimension: a partial override of its test set.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MatrixValue {
    /// Identifier fragment; values without one are skipped.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub options: Table,

    #[serde(default)]
    pub experiment: Option<String>,

    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default)]
    pub replicas: Option<u32>,

    #[serde(default)]
    pub completed: Option<u32>,
}

/// Validated configuration.
///
/// Constructed through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub repo: String,
    pub branch: Option<String>,
    pub username: Option<String>,
    pub ssh_username: Option<String>,
    pub profile: Option<String>,
    pub experiments_path: String,
    pub remote_config: String,
    pub ssh_cert: Option<PathBuf>,
    pub password_path: Option<PathBuf>,
    pub max_concurrency: Option<usize>,
    pub headless: Option<bool>,
    pub timing: TimingSection,
    pub portal: PortalSection,
    pub options: Table,
    pub tests: Vec<TestSetConfig>,
}

/// Values supplied on the command line; they only fill fields the config
/// file leaves unset.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub ssh_cert: Option<PathBuf>,
    pub max_concurrency: Option<usize>,
    pub password_path: Option<PathBuf>,
    pub headless: bool,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile, repo: String) -> Self {
        Self {
            repo,
            branch: raw.branch,
            username: raw.username,
            ssh_username: raw.ssh_username,
            profile: raw.profile,
            experiments_path: raw.experiments_path,
            remote_config: raw.remote_config,
            ssh_cert: raw.ssh_cert,
            password_path: raw.password_path,
            max_concurrency: raw.max_concurrency,
            headless: raw.headless,
            timing: raw.timing,
            portal: raw.portal,
            options: raw.options,
            tests: raw.tests,
        }
    }

    pub fn apply_cli(&mut self, cli: CliOverrides) {
        if self.ssh_cert.is_none() {
            self.ssh_cert = cli.ssh_cert;
        }
        if self.max_concurrency.is_none() {
            self.max_concurrency = cli.max_concurrency;
        }
        if self.password_path.is_none() {
            self.password_path = cli.password_path;
        }
        if self.headless.is_none() {
            self.headless = Some(cli.headless);
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(1).max(1)
    }

    pub fn headless(&self) -> bool {
        self.headless.unwrap_or(false)
    }

    pub fn ssh_username(&self) -> String {
        self.ssh_username
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| "root".to_string())
    }

    pub fn ssh_cert(&self) -> PathBuf {
        self.ssh_cert
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| PathBuf::from("id_rsa"))
    }

    /// Settings each lifecycle needs, detached from the rest of the config.
    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            ssh_cert: self.ssh_cert(),
            experiments_path: self.experiments_path.clone(),
            remote_config: self.remote_config.clone(),
            timing: self.timing.clone(),
        }
    }
}

/// Per-run settings shared (read-only) by every lifecycle.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub repo: String,
    pub branch: Option<String>,
    pub ssh_cert: PathBuf,
    pub experiments_path: String,
    pub remote_config: String,
    pub timing: TimingSection,
}

/// Expand a leading `~/` using `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
