//! Rule evaluation for brick inputs.
//!
//! Empty values are handled first: a required empty value fails with exactly
//! one error, an optional empty value passes. Every other check runs and all
//! violations are reported together.

use std::collections::HashMap;
use std::sync::Arc;

use brickflow_types::validation::{ValidationResult, ValidationRule};
use regex::Regex;
use serde_json::Value;

/// Outcome of a custom predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum CustomVerdict {
    Valid,
    Invalid,
    /// Invalid, with the message to report.
    InvalidWith(String),
}

impl From<bool> for CustomVerdict {
    fn from(ok: bool) -> Self {
        if ok {
            CustomVerdict::Valid
        } else {
            CustomVerdict::Invalid
        }
    }
}

pub type CustomPredicate = Arc<dyn Fn(&Value) -> CustomVerdict + Send + Sync>;

/// Evaluates [`ValidationRule`]s, resolving `custom` predicates by name.
#[derive(Clone, Default)]
pub struct Validator {
    predicates: HashMap<String, CustomPredicate>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named predicate usable from `rule.custom`.
    pub fn with_predicate<F>(mut self, name: &str, predicate: F) -> Self
    where
        F: Fn(&Value) -> CustomVerdict + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(predicate));
        self
    }

    pub fn validate(&self, value: &Value, rule: &ValidationRule) -> ValidationResult {
        let label = rule.label();

        if is_empty_value(value) {
            return if rule.required {
                ValidationResult::fail(format!("{label} is required"))
            } else {
                ValidationResult::pass()
            };
        }

        let mut result = ValidationResult::pass();
        let mut error = |message: String| {
            result.valid = false;
            result.errors.push(message);
        };

        if let Some(len) = length_of(value) {
            if let Some(min) = rule.min_length.filter(|&min| len < min) {
                error(format!("{label} must be at least {min} characters"));
            }
            if let Some(max) = rule.max_length.filter(|&max| len > max) {
                error(format!("{label} must be at most {max} characters"));
            }
        }

        if rule.min.is_some() || rule.max.is_some() {
            match as_number(value) {
                Some(n) => {
                    if let Some(min) = rule.min.filter(|&min| n < min) {
                        error(format!("{label} must be at least {min}"));
                    }
                    if let Some(max) = rule.max.filter(|&max| n > max) {
                        error(format!("{label} must be at most {max}"));
                    }
                }
                None => error(format!("{label} must be a number")),
            }
        }

        let mut warnings = Vec::new();

        if let Some(pattern) = &rule.pattern {
            match Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(&display_form(value)) {
                        error(format!("{label} has an invalid format"));
                    }
                }
                Err(e) => warnings.push(format!("ignored invalid pattern '{pattern}': {e}")),
            }
        }

        if let Some(name) = &rule.custom {
            match self.predicates.get(name) {
                Some(predicate) => match predicate(value) {
                    CustomVerdict::Valid => {}
                    CustomVerdict::Invalid => error(format!("{label} is invalid")),
                    CustomVerdict::InvalidWith(message) => error(message),
                },
                None => warnings.push(format!("unknown custom validator '{name}'")),
            }
        }

        result.warnings.extend(warnings);
        result
    }

    /// Validate independent `(value, rule)` pairs and union the results.
    pub fn validate_multiple<'a, I>(&self, checks: I) -> ValidationResult
    where
        I: IntoIterator<Item = (&'a Value, &'a ValidationRule)>,
    {
        checks
            .into_iter()
            .fold(ValidationResult::pass(), |mut acc, (value, rule)| {
                acc.merge(self.validate(value, rule));
                acc
            })
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("Validator").field("predicates", &names).finish()
    }
}

/// Null, whitespace-only strings, empty arrays and empty objects.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// Numbers, and strings that parse as numbers.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn display_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
