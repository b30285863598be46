//! `{{ path }}` interpolation against the workflow data.
//!
//! Unresolved placeholders are left exactly as written, so interpolating a
//! template twice against the same data gives the same result.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::data::lookup_path;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is a valid regex")
});

/// Namespace read by `$`-prefixed paths.
const PRICING_NAMESPACE: &str = "pricing";

/// Replace every resolvable placeholder in `template`.
pub fn interpolate(template: &str, data: &Map<String, Value>) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match resolve(&caps[1], data) {
            Some(value) => value_to_string(value),
            None => {
                tracing::debug!(placeholder = &caps[0], "unresolved placeholder left as-is");
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Deep-walk a structured template, interpolating every string.
///
/// A string that is exactly one placeholder takes the resolved value itself,
/// keeping its JSON type.
pub fn interpolate_value(template: &Value, data: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => {
            let whole = PLACEHOLDER
                .captures(s)
                .filter(|caps| caps[0].len() == s.trim().len())
                .and_then(|caps| resolve(&caps[1], data).cloned());
            whole.unwrap_or_else(|| Value::String(interpolate(s, data)))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, data)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve<'a>(path: &str, data: &'a Map<String, Value>) -> Option<&'a Value> {
    let path = path.trim();
    match path.strip_prefix('$') {
        Some(rest) => match data.get(PRICING_NAMESPACE)? {
            Value::Object(pricing) => lookup_path(pricing, rest),
            _ => None,
        },
        None => lookup_path(data, path),
    }
}

/// Display form of a value: strings bare, scalars as JSON, structures as
/// compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
