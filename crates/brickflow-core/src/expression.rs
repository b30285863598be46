//! JEXL evaluation for step conditions, computed `nextStep` targets and
//! background-brick trigger predicates.
//!
//! The workflow data is always passed as the evaluation context; values are
//! never spliced into expression strings. The data is reachable both at the
//! top level (`name == 'Ada'`) and under `workflowData`.

use regex::Regex;
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression did not produce a step id: got {0}")]
    NotAStepId(Value),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the string/collection transforms workflows use.
///
/// Construct one per evaluation; the underlying evaluator is not shared
/// across tasks.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!is_truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        args.get(1).is_some_and(|needle| items.contains(needle))
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("match", |args: &[Value]| {
                // Invalid patterns never match.
                let matched = Regex::new(str_arg(args, 1))
                    .map(|re| re.is_match(str_arg(args, 0)))
                    .unwrap_or(false);
                Ok(json!(matched))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        data: &Map<String, Value>,
    ) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, data).map(|v| is_truthy(&v))
    }

    /// Evaluate to a raw JSON value.
    pub fn evaluate_value(
        &self,
        expression: &str,
        data: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        let context = expression_context(data);
        self.evaluator
            .eval_in_context(expression, &context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate a computed `nextStep`: a string names the target, `null` or
    /// an empty string means "no transition".
    pub fn evaluate_step_id(
        &self,
        expression: &str,
        data: &Map<String, Value>,
    ) -> Result<Option<String>, ExpressionError> {
        match self.evaluate_value(expression, data)? {
            Value::String(s) if s.is_empty() => Ok(None),
            Value::String(s) => Ok(Some(s)),
            Value::Null => Ok(None),
            other => Err(ExpressionError::NotAStepId(other)),
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience wrapper for one-off condition checks.
pub fn evaluate_condition(expression: &str, data: &Map<String, Value>) -> Result<bool, ExpressionError> {
    ConditionEvaluator::new().evaluate_bool(expression, data)
}

fn expression_context(data: &Map<String, Value>) -> Value {
    let mut context = data.clone();
    context
        .entry("workflowData")
        .or_insert_with(|| Value::Object(data.clone()));
    Value::Object(context)
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn compares_top_level_and_prefixed_paths() {
        let d = data(json!({"name": "Ada", "plan": {"tier": "pro"}}));
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("name == 'Ada'", &d).unwrap());
        assert!(eval.evaluate_bool("workflowData.plan.tier == 'pro'", &d).unwrap());
        assert!(!eval.evaluate_bool("plan.tier == 'free'", &d).unwrap());
    }

    #[test]
    fn transforms_are_available() {
        let d = data(json!({"email": "ADA@Example.com", "items": [1, 2, 3]}));
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("email|lower|endsWith('example.com')", &d).unwrap());
        assert!(eval.evaluate_bool("items|length > 2", &d).unwrap());
        assert!(eval.evaluate_bool("email|match('^[A-Z]+@')", &d).unwrap());
    }

    #[test]
    fn missing_values_are_falsy() {
        let d = data(json!({}));
        assert!(!evaluate_condition("approved", &d).unwrap());
    }

    #[test]
    fn computed_step_ids() {
        let d = data(json!({"premium": true}));
        let eval = ConditionEvaluator::new();
        assert_eq!(
            eval.evaluate_step_id("premium ? 'upsell' : 'done'", &d).unwrap(),
            Some("upsell".to_string())
        );
        assert_eq!(eval.evaluate_step_id("''", &d).unwrap(), None);
        assert!(matches!(
            eval.evaluate_step_id("42", &d),
            Err(ExpressionError::NotAStepId(_))
        ));
    }

    #[test]
    fn malformed_expressions_error() {
        let d = data(json!({}));
        assert!(matches!(
            evaluate_condition("name ==", &d),
            Err(ExpressionError::EvalFailed(_))
        ));
    }
}
