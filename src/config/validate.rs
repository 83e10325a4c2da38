// src/config/validate.rs

use std::collections::HashSet;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{ExprunError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::ExprunError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;
        let repo = require_repo(&raw)?;
        Ok(ConfigFile::new_unchecked(raw, repo))
    }
}

/// Run every semantic check on a raw config.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tests(cfg)?;
    require_repo(cfg)?;
    validate_global_config(cfg)?;
    validate_tests(cfg)?;
    Ok(())
}

fn ensure_has_tests(cfg: &RawConfigFile) -> Result<()> {
    if cfg.tests.is_empty() {
        return Err(ExprunError::ConfigError(
            "no tests found: config must contain at least one [[tests]] entry".to_string(),
        ));
    }
    Ok(())
}

fn require_repo(cfg: &RawConfigFile) -> Result<String> {
    match cfg.repo.as_deref().map(str::trim) {
        Some(repo) if !repo.is_empty() => Ok(repo.to_string()),
        _ => Err(ExprunError::ConfigError(
            "no repo found: `repo` must name the experiments repository".to_string(),
        )),
    }
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.max_concurrency == Some(0) {
        return Err(ExprunError::ConfigError(
            "max_concurrency must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.portal.poll_interval == 0 {
        return Err(ExprunError::ConfigError(
            "[portal].poll_interval must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_tests(cfg: &RawConfigFile) -> Result<()> {
    let mut seen = HashSet::new();

    for (index, test) in cfg.tests.iter().enumerate() {
        if test.id.trim().is_empty() {
            return Err(ExprunError::ConfigError(format!(
                "test #{} has no `id`",
                index + 1
            )));
        }
        if test.experiment.trim().is_empty() {
            return Err(ExprunError::ConfigError(format!(
                "test '{}' has no `experiment`",
                test.id
            )));
        }
        if !seen.insert(test.id.as_str()) {
            return Err(ExprunError::ConfigError(format!(
                "test id '{}' is declared more than once",
                test.id
            )));
        }
    }
    Ok(())
}
