// src/expand/replicas.rs

use crate::expand::completion::CompletionIndex;
use crate::expand::matrix::ExpandedSpec;
use crate::expand::TestReplica;

/// Zero-padding width for replica indices: at least two digits, more if any
/// spec declares a replica count that needs them.
pub fn replica_id_width(specs: &[ExpandedSpec]) -> usize {
    specs
        .iter()
        .map(|spec| digit_count(spec.replicas))
        .max()
        .unwrap_or(0)
        .max(2)
}

fn digit_count(n: u32) -> usize {
    n.to_string().len()
}

/// Emit the replicas still to run for every spec, in spec order.
pub fn generate_replicas(
    specs: &[ExpandedSpec],
    completion: &CompletionIndex,
    default_profile: Option<&str>,
) -> Vec<TestReplica> {
    let width = replica_id_width(specs);
    let mut replicas = Vec::new();

    for spec in specs {
        let remaining = spec.replicas.saturating_sub(spec.completed);
        for i in 0..remaining {
            let j = i + spec.completed;
            if completion.contains(&spec.id, j) {
                continue;
            }
            replicas.push(TestReplica {
                id: format!("{}-{:0width$}", spec.id, j),
                base_id: spec.id.clone(),
                replica: j,
                experiment: spec.experiment.clone(),
                profile: spec
                    .profile
                    .clone()
                    .or_else(|| default_profile.map(str::to_string)),
                options: spec.options.clone(),
                matrix: spec.has_matrix.then(|| spec.matrix.clone()),
            });
        }
    }

    replicas
}
