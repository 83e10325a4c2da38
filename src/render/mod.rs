// src/render/mod.rs

//! Rendering of the per-test configuration document.
//!
//! The document is shell-variable assignment text. Test options overwrite
//! matching `KEY=...` lines, then the allocated role hosts are spread over
//! the `*_HOST`/`*_HOSTS` lines.

pub mod hosts;
pub mod substitute;

use toml::{Table, Value};

use crate::errors::{ExprunError, Result};

pub use hosts::{assign_hosts, host_fields, partition_sizes};
pub use substitute::{apply_overrides, render_value, substitute};

/// Render `template` for one replica.
///
/// `role_hosts` excludes the executor host. Option keys that name a host
/// field are rejected since the assignment would silently overwrite them.
pub fn render_config(template: &str, options: &Table, role_hosts: &[String]) -> Result<String> {
    let assignment = assign_hosts(template, role_hosts)?;

    let mut merged = options.clone();
    for (field, hosts) in assignment {
        if merged.contains_key(&field) {
            return Err(ExprunError::ConfigError(format!(
                "option '{field}' collides with a host field of the same name"
            )));
        }
        merged.insert(field, Value::String(hosts.join(" ")));
    }

    apply_overrides(template, merged.iter())
}
