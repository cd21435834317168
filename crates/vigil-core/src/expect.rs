//! Final type coercion applied to a formatted value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("value expect type '{expected}', but {found} found")]
pub struct ExpectError {
    expected: &'static str,
    found: String,
}

impl ExpectError {
    fn new(expected: &'static str, value: &Value) -> Self {
        Self {
            expected,
            found: describe(value),
        }
    }
}

/// Requested result type of a task.
///
/// The `OrNull` variants pass a `null` input through unchanged; the plain
/// variants fail when the value cannot be coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expect {
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "intOrNull")]
    IntOrNull,
    #[serde(rename = "real")]
    Real,
    #[serde(rename = "realOrNull")]
    RealOrNull,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "stringOrNull")]
    StringOrNull,
    #[serde(rename = "null")]
    Null,
}

impl Expect {
    /// Coerce `value` to the expected type.
    pub fn coerce(self, value: Value) -> Result<Value, ExpectError> {
        match self {
            Expect::Int => coerce_int(value, false),
            Expect::IntOrNull => coerce_int(value, true),
            Expect::Real => coerce_real(value, false),
            Expect::RealOrNull => coerce_real(value, true),
            Expect::String => coerce_string(value, false),
            Expect::StringOrNull => coerce_string(value, true),
            Expect::Null => coerce_null(value),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "type 'null'".to_string(),
        Value::Bool(_) => "type 'bool'".to_string(),
        Value::Number(_) => "type 'number'".to_string(),
        Value::String(s) => format!("string \"{}\"", s),
        Value::Array(_) => "type 'array'".to_string(),
        Value::Object(_) => "type 'object'".to_string(),
    }
}

fn coerce_int(value: Value, nullable: bool) -> Result<Value, ExpectError> {
    match value {
        Value::Null if nullable => Ok(Value::Null),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Ok(Value::Number(n))
            } else {
                // Truncate toward zero, as a float-to-int conversion does.
                let truncated = n.as_f64().unwrap_or(0.0).trunc();
                Ok(Value::from(truncated as i64))
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| ExpectError::new("int", &Value::String(s))),
        Value::Bool(b) => Ok(Value::from(b as i64)),
        other => Err(ExpectError::new("int", &other)),
    }
}

fn coerce_real(value: Value, nullable: bool) -> Result<Value, ExpectError> {
    match value {
        Value::Null if nullable => Ok(Value::Null),
        Value::Number(n) => match n.as_f64() {
            Some(f) => Ok(Value::from(f)),
            None => Err(ExpectError::new("real", &Value::Number(n))),
        },
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| ExpectError::new("real", &Value::String(s))),
        Value::Bool(b) => Ok(Value::from(if b { 1.0 } else { 0.0 })),
        other => Err(ExpectError::new("real", &other)),
    }
}

fn coerce_string(value: Value, nullable: bool) -> Result<Value, ExpectError> {
    match value {
        Value::Null if nullable => Ok(Value::Null),
        Value::String(s) => Ok(Value::String(s)),
        Value::Number(n) => Ok(Value::String(n.to_string())),
        Value::Bool(b) => Ok(Value::String(b.to_string())),
        Value::Null => Err(ExpectError::new("string", &Value::Null)),
        composite => match serde_json::to_string(&composite) {
            Ok(s) => Ok(Value::String(s)),
            Err(_) => Err(ExpectError::new("string", &composite)),
        },
    }
}

fn coerce_null(value: Value) -> Result<Value, ExpectError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::String(s) if s.is_empty() => Ok(Value::Null),
        other => Err(ExpectError::new("null", &other)),
    }
}
