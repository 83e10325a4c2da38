// src/expand/matrix.rs

//! Global-option merge and matrix expansion.

use toml::{Table, Value};

use crate::config::{MatrixDimension, MatrixValue, TestSetConfig};

/// A test set after global merge and (possibly) matrix expansion, before
/// replica generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedSpec {
    pub id: String,
    pub experiment: String,
    pub profile: Option<String>,
    pub replicas: u32,
    pub completed: u32,
    pub options: Table,
    /// Dimension name → chosen value id, in dimension order.
    pub matrix: Vec<(String, String)>,
    pub has_matrix: bool,
}

/// Shallow merge with precedence `global < test set`.
pub fn merge_globals(tests: &[TestSetConfig], global_options: &Table) -> Vec<ExpandedSpec> {
    tests
        .iter()
        .map(|test| {
            let mut options = global_options.clone();
            for (key, value) in test.options.iter() {
                options.insert(key.clone(), value.clone());
            }
            ExpandedSpec {
                id: test.id.clone(),
                experiment: test.experiment.clone(),
                profile: test.profile.clone(),
                replicas: test.replicas,
                completed: test.completed,
                options,
                matrix: Vec::new(),
                has_matrix: false,
            }
        })
        .collect()
}

/// Expand every spec against its test set's matrix dimensions.
///
/// `tests` and `specs` are parallel: `specs[i]` is the merged form of
/// `tests[i]`.
pub fn expand_matrices(tests: &[TestSetConfig], specs: Vec<ExpandedSpec>) -> Vec<ExpandedSpec> {
    let mut expanded = Vec::new();
    for (test, spec) in tests.iter().zip(specs) {
        if test.matrix.is_empty() {
            expanded.push(spec);
        } else {
            expanded.extend(expand_matrix(spec, &test.matrix));
        }
    }
    expanded
}

/// Incremental cartesian expansion of one spec.
///
/// For each dimension in order, every partial result so far is combined
/// with every value of the dimension, so ids come out in lexicographic
/// dimension order. Values without an id are skipped and a dimension
/// without values leaves the working set untouched.
pub fn expand_matrix(base: ExpandedSpec, dimensions: &[MatrixDimension]) -> Vec<ExpandedSpec> {
    let mut intermediate = vec![ExpandedSpec {
        has_matrix: true,
        ..base
    }];

    for dimension in dimensions {
        if dimension.values.is_empty() {
            continue;
        }

        let mut next = Vec::new();
        for partial in intermediate.iter() {
            for value in dimension.values.iter() {
                let Some(value_id) = value.id.as_deref().filter(|id| !id.is_empty()) else {
                    continue;
                };
                next.push(apply_value(partial, &dimension.name, value_id, value));
            }
        }
        intermediate = next;
    }

    intermediate
}

fn apply_value(
    partial: &ExpandedSpec,
    dimension: &str,
    value_id: &str,
    value: &MatrixValue,
) -> ExpandedSpec {
    let mut spec = partial.clone();
    deep_merge(&mut spec.options, &value.options);

    if let Some(experiment) = &value.experiment {
        spec.experiment = experiment.clone();
    }
    if let Some(profile) = &value.profile {
        spec.profile = Some(profile.clone());
    }
    if let Some(replicas) = value.replicas {
        spec.replicas = replicas;
    }
    if let Some(completed) = value.completed {
        spec.completed = completed;
    }

    spec.id = format!("{}-{}", partial.id, value_id);
    record_choice(&mut spec.matrix, dimension, value_id);
    spec
}

fn record_choice(choices: &mut Vec<(String, String)>, dimension: &str, value_id: &str) {
    match choices.iter_mut().find(|(name, _)| name == dimension) {
        Some(existing) => existing.1 = value_id.to_string(),
        None => choices.push((dimension.to_string(), value_id.to_string())),
    }
}

/// Recursive merge: tables merge key by key, arrays append, anything else
/// is replaced by the overlay.
pub fn deep_merge(base: &mut Table, overlay: &Table) {
    for (key, value) in overlay.iter() {
        match (base.get_mut(key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                deep_merge(existing, incoming);
            }
            (Some(Value::Array(existing)), Value::Array(incoming)) => {
                existing.extend(incoming.iter().cloned());
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
