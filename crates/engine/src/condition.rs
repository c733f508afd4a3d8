//! The default start-condition evaluator.
//!
//! A condition is a JSON object mapping paths to expected values:
//!
//! ```json
//! { "msg.order.kind": "retail", "config.region": ["eu", "us"] }
//! ```
//!
//! Paths starting with `msg.` are resolved in the message, `config.` in the
//! integration configuration; bare paths are resolved in the message. An
//! array of expected values matches any of them. Every entry must match.

use serde_json::Value;
use workflow::document::lookup;
use workflow::FlowError;

use crate::services::ConditionEvaluator;

#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMatcher;

impl ConditionEvaluator for FieldMatcher {
    fn evaluate(&self, condition: &Value, message: Option<&Value>, config: &Value) -> Result<bool, FlowError> {
        let entries = match condition {
            Value::Null => return Ok(true),
            Value::Object(entries) => entries,
            other => {
                return Err(FlowError::Condition(format!(
                    "a condition must be an object of path/value pairs, got {other}"
                )))
            }
        };

        let matched = entries.iter().all(|(path, expected)| {
            let actual = if let Some(rest) = path.strip_prefix("config.") {
                lookup(config, rest)
            } else {
                let rest = path.strip_prefix("msg.").unwrap_or(path);
                message.and_then(|m| lookup(m, rest))
            };

            match (actual, expected) {
                (Some(actual), Value::Array(options)) => options.contains(actual),
                (Some(actual), expected) => actual == expected,
                (None, Value::Null) => true,
                (None, _) => false,
            }
        });
        Ok(matched)
    }
}
