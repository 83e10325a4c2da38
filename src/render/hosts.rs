// src/render/hosts.rs

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{ExprunError, Result};

static HOST_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^(?:readonly )?([A-Z_]+_HOSTS?)="?.*"?$"#).expect("valid host field pattern")
});

/// Role-host fields declared in a configuration document, first-seen order,
/// without duplicates.
pub fn host_fields(text: &str) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for caps in HOST_FIELD.captures_iter(text) {
        let name = &caps[1];
        if !fields.iter().any(|f| f == name) {
            fields.push(name.to_string());
        }
    }
    fields
}

/// Sizes of an order-preserving partition of `hosts` items over `fields`
/// slots; the first `hosts % fields` slots get one extra.
pub fn partition_sizes(hosts: usize, fields: usize) -> Vec<usize> {
    if fields == 0 {
        return Vec::new();
    }
    let base = hosts / fields;
    let extra = hosts % fields;
    (0..fields)
        .map(|i| base + usize::from(i < extra))
        .collect()
}

/// Assign role hosts to the host fields declared in `text`.
///
/// Hosts are consumed from the front in order. A document with no host
/// fields cannot take any assignment and is a configuration error.
pub fn assign_hosts(text: &str, hosts: &[String]) -> Result<Vec<(String, Vec<String>)>> {
    let fields = host_fields(text);
    if fields.is_empty() {
        return Err(ExprunError::ConfigError(
            "configuration declares no *_HOST(S) fields; cannot assign allocated hosts"
                .to_string(),
        ));
    }

    let sizes = partition_sizes(hosts.len(), fields.len());
    let mut remaining = hosts;
    let mut assignment = Vec::with_capacity(fields.len());
    for (field, size) in fields.into_iter().zip(sizes) {
        let (taken, rest) = remaining.split_at(size);
        assignment.push((field, taken.to_vec()));
        remaining = rest;
    }
    Ok(assignment)
}
