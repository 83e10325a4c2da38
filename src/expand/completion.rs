// src/expand/completion.rs

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::fs::FileSystem;

static RESULT_ARCHIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)-(\d+)\.tar\.gz$").expect("valid result archive pattern"));

/// Replica indices whose result archive already exists, keyed by test id.
///
/// A file named `{id}-{index}.tar.gz` anywhere below the results directory
/// marks replica `index` of `id` as done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionIndex {
    done: HashMap<String, BTreeSet<u32>>,
}

impl CompletionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `results_dir` and collect every matching archive.
    ///
    /// A missing or unreadable directory is not an error: the index comes
    /// back empty and only the configured `completed` counts apply.
    pub fn scan(fs: &dyn FileSystem, results_dir: &Path) -> Self {
        let files = match fs.walk_files(results_dir) {
            Ok(files) => files,
            Err(err) => {
                warn!(
                    dir = %results_dir.display(),
                    error = %format!("{err:#}"),
                    "could not scan results directory; falling back to 'completed' values"
                );
                return Self::default();
            }
        };

        let mut index = Self::default();
        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((test_id, replica)) = parse_archive_name(name) {
                index.insert(test_id, replica);
            }
        }

        debug!(
            tests = index.done.len(),
            archives = index.len(),
            "scanned results directory"
        );
        index
    }

    pub fn insert(&mut self, test_id: impl Into<String>, replica: u32) {
        self.done.entry(test_id.into()).or_default().insert(replica);
    }

    pub fn contains(&self, test_id: &str, replica: u32) -> bool {
        self.done
            .get(test_id)
            .is_some_and(|replicas| replicas.contains(&replica))
    }

    pub fn completed_for(&self, test_id: &str) -> Option<&BTreeSet<u32>> {
        self.done.get(test_id)
    }

    /// Total number of recorded archives.
    pub fn len(&self) -> usize {
        self.done.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }
}

/// Split `{id}-{index}.tar.gz` into its parts. Indices that overflow `u32`
/// are ignored.
pub fn parse_archive_name(name: &str) -> Option<(String, u32)> {
    let caps = RESULT_ARCHIVE.captures(name)?;
    let replica = caps[2].parse().ok()?;
    Some((caps[1].to_string(), replica))
}
