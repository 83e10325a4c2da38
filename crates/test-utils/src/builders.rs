#![allow(dead_code)]

use std::path::PathBuf;

use exprun::config::{
    ConfigFile, ExecutionSettings, MatrixDimension, MatrixValue, RawConfigFile, TestSetConfig,
    TimingSection,
};
use exprun::expand::TestReplica;
use toml::{Table, Value};

/// Builder for `ConfigFile` to simplify test setup.
///
/// Starts from a config with a repository, a portal username and a default
/// profile, and no tests.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                repo: Some("https://example.com/experiments.git".to_string()),
                username: Some("tester".to_string()),
                profile: Some("small-lan".to_string()),
                experiments_path: "experiments".to_string(),
                remote_config: "config.sh".to_string(),
                ..RawConfigFile::default()
            },
        }
    }

    pub fn with_test(mut self, test: TestSetConfig) -> Self {
        self.config.tests.push(test);
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.options.insert(key.to_string(), value.into());
        self
    }

    pub fn with_profile(mut self, profile: Option<&str>) -> Self {
        self.config.profile = profile.map(str::to_string);
        self
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.config.branch = Some(branch.to_string());
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = Some(n);
        self
    }

    pub fn without_repo(mut self) -> Self {
        self.config.repo = None;
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for one `[[tests]]` entry.
pub struct TestSetBuilder {
    test: TestSetConfig,
}

impl TestSetBuilder {
    pub fn new(id: &str, experiment: &str) -> Self {
        Self {
            test: TestSetConfig {
                id: id.to_string(),
                experiment: experiment.to_string(),
                profile: None,
                replicas: 1,
                completed: 0,
                options: Table::new(),
                matrix: vec![],
            },
        }
    }

    pub fn replicas(mut self, n: u32) -> Self {
        self.test.replicas = n;
        self
    }

    pub fn completed(mut self, n: u32) -> Self {
        self.test.completed = n;
        self
    }

    pub fn profile(mut self, profile: &str) -> Self {
        self.test.profile = Some(profile.to_string());
        self
    }

    pub fn option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.test.options.insert(key.to_string(), value.into());
        self
    }

    pub fn dimension(mut self, name: &str, values: Vec<MatrixValue>) -> Self {
        self.test.matrix.push(MatrixDimension {
            name: name.to_string(),
            values,
        });
        self
    }

    pub fn build(self) -> TestSetConfig {
        self.test
    }
}

/// A matrix value with an id and option overrides.
pub fn matrix_value(id: &str, options: &[(&str, Value)]) -> MatrixValue {
    let mut table = Table::new();
    for (key, value) in options {
        table.insert(key.to_string(), value.clone());
    }
    MatrixValue {
        id: Some(id.to_string()),
        options: table,
        ..MatrixValue::default()
    }
}

/// A replica built by hand, bypassing expansion.
pub fn replica(id: &str, experiment: &str) -> TestReplica {
    TestReplica {
        id: id.to_string(),
        base_id: id.to_string(),
        replica: 0,
        experiment: experiment.to_string(),
        profile: Some("small-lan".to_string()),
        options: Table::new(),
        matrix: None,
    }
}

/// Timings small enough for paused-clock tests: 1 s backoff, 2 s cooldown.
pub fn fast_timing() -> TimingSection {
    TimingSection {
        retry_backoff: 1,
        cooldown: 2,
        command_timeout: 1,
        clone_timeout: 1,
        script_read_timeout: 1,
    }
}

pub fn execution_settings() -> ExecutionSettings {
    ExecutionSettings {
        repo: "https://example.com/experiments.git".to_string(),
        branch: None,
        ssh_cert: PathBuf::from("id_rsa"),
        experiments_path: "experiments".to_string(),
        remote_config: "config.sh".to_string(),
        timing: fast_timing(),
    }
}
