// src/expand/mod.rs

//! Test specification expansion.
//!
//! Turns the declarative `[[tests]]` entries into a flat, ordered list of
//! [`TestReplica`]s:
//!
//! 1. global options merged under each test set's options (`matrix.rs`),
//! 2. matrix dimensions expanded into a cartesian product (`matrix.rs`),
//! 3. replicas generated, skipping finished ones (`replicas.rs`).
//!
//! The whole pipeline is pure and deterministic. Replica ids key the result
//! archives that [`CompletionIndex`] reads back on the next run, so the
//! order and naming must not drift between runs.

pub mod completion;
pub mod matrix;
pub mod replicas;

use std::collections::HashSet;
use std::fmt;

use toml::Table;

use crate::config::ConfigFile;
use crate::errors::{ExprunError, Result};

pub use completion::CompletionIndex;
pub use matrix::{deep_merge, expand_matrix, merge_globals, ExpandedSpec};
pub use replicas::{generate_replicas, replica_id_width};

/// One concrete runnable unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReplica {
    /// `{base_id}-{replica:0W}`; unique within a run.
    pub id: String,
    /// Test set id including matrix fragments.
    pub base_id: String,
    pub replica: u32,
    pub experiment: String,
    pub profile: Option<String>,
    pub options: Table,
    /// Dimension name → value id, when the test set declared a matrix.
    pub matrix: Option<Vec<(String, String)>>,
}

impl fmt::Display for TestReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.experiment)?;
        if let Some(matrix) = &self.matrix {
            let choices: Vec<String> = matrix
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            write!(f, " [{}]", choices.join(", "))?;
        }
        Ok(())
    }
}

/// Run the full expansion pipeline for a validated config.
pub fn expand_tests(cfg: &ConfigFile, completion: &CompletionIndex) -> Result<Vec<TestReplica>> {
    let merged = merge_globals(&cfg.tests, &cfg.options);
    let expanded = matrix::expand_matrices(&cfg.tests, merged);
    let replicas = generate_replicas(&expanded, completion, cfg.profile.as_deref());
    ensure_unique_ids(&replicas)?;
    Ok(replicas)
}

fn ensure_unique_ids(replicas: &[TestReplica]) -> Result<()> {
    let mut seen = HashSet::new();
    for replica in replicas {
        if !seen.insert(replica.id.as_str()) {
            return Err(ExprunError::ConfigError(format!(
                "test id '{}' is produced more than once; check matrix value ids",
                replica.id
            )));
        }
    }
    Ok(())
}
