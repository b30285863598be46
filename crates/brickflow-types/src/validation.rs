//! Declarative validation rules and results.
//!
//! Rules are plain configuration (they appear inside brick configs in the
//! workflow document). Custom predicates are referenced by name and resolved
//! by the validation engine in `brickflow-core`.

use serde::{Deserialize, Serialize};

/// A declarative rule for a single value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    /// Empty values fail with a single error when set.
    #[serde(default)]
    pub required: bool,
    /// Minimum length for strings (chars) and arrays (items).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Maximum length for strings (chars) and arrays (items).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Inclusive numeric lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Regular expression the string form of the value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Name of a custom predicate registered with the validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,
    /// Human label used in messages (defaults to "value").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ValidationRule {
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("value")
    }
}

/// Outcome of validating one or more values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    /// Union another result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.valid = self.valid && other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// First error, joined for single-line display.
    pub fn message(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_deserializes_camel_case_fields() {
        let rule: ValidationRule = serde_json::from_str(
            r#"{"required": true, "minLength": 2, "maxLength": 5, "pattern": "^[a-z]+$"}"#,
        )
        .unwrap();
        assert!(rule.required);
        assert_eq!(rule.min_length, Some(2));
        assert_eq!(rule.max_length, Some(5));
        assert_eq!(rule.label(), "value");
    }

    #[test]
    fn merge_unions_errors_and_validity() {
        let mut result = ValidationResult::pass();
        result.merge(ValidationResult::fail("too short"));
        result.merge(ValidationResult::fail("bad pattern"));
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.message().unwrap(), "too short; bad pattern");
    }
}
