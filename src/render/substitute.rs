// src/render/substitute.rs

use regex::{Captures, Regex};
use toml::Value;

use crate::errors::{ExprunError, Result};

/// Shell-side rendering of an option value: strings are double-quoted,
/// everything else is written bare.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    }
}

/// Replace every `KEY=...` (or `readonly KEY=...`) line with `KEY=<value>`,
/// keeping the `readonly` qualifier. Lines that do not declare `key` are
/// left untouched, and so is the text when `key` is not declared at all.
pub fn substitute(text: &str, key: &str, value: &Value) -> Result<String> {
    let pattern = format!(r#"(?m)^((?:readonly )?{})="?.*"?$"#, regex::escape(key));
    let re = Regex::new(&pattern).map_err(|e| {
        ExprunError::ConfigError(format!("invalid override key '{key}': {e}"))
    })?;
    let rendered = render_value(value);
    Ok(re
        .replace_all(text, |caps: &Captures| format!("{}={}", &caps[1], rendered))
        .into_owned())
}

/// Apply overrides in iteration order.
pub fn apply_overrides<'a, I>(text: &str, overrides: I) -> Result<String>
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut out = text.to_string();
    for (key, value) in overrides {
        out = substitute(&out, key, value)?;
    }
    Ok(out)
}
