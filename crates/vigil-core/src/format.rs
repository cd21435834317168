//! Named value transforms applied between collection and expect coercion.
//!
//! The registry is an explicit name-to-function table built at startup and
//! passed by reference into each task runner; there is no process-wide
//! registration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("no format registered under name '{0}'")]
    Unknown(String),
    #[error("format name '{0}' already registered")]
    Duplicate(String),
    #[error("format '{name}' cannot convert value '{value}'")]
    Convert { name: &'static str, value: Value },
}

pub type FormatFn = fn(&Value) -> Result<Value, FormatError>;

/// Format pipeline of a task: identity, one named transform, or an ordered
/// chain of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormatSpec {
    #[default]
    None,
    Single(String),
    Chain(Vec<String>),
}

/// Explicit name-to-function format table.
pub struct FormatRegistry {
    formats: HashMap<String, FormatFn>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self {
            formats: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in transforms.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for (name, f) in [
            ("toInt", to_int as FormatFn),
            ("toIntOrNull", to_int_or_null as FormatFn),
            ("toFloat", to_float as FormatFn),
            ("toFloatOrNull", to_float_or_null as FormatFn),
        ] {
            // Names are distinct literals; registration cannot collide.
            let _ = registry.register(name, f);
        }
        registry
    }

    pub fn register(&mut self, name: &str, f: FormatFn) -> Result<(), FormatError> {
        if self.formats.contains_key(name) {
            return Err(FormatError::Duplicate(name.to_string()));
        }
        self.formats.insert(name.to_string(), f);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formats.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<FormatFn, FormatError> {
        self.formats
            .get(name)
            .copied()
            .ok_or_else(|| FormatError::Unknown(name.to_string()))
    }

    /// Run `value` through the pipeline. A chain applies each transform in
    /// order and short-circuits to `null` when a stage yields a falsy value.
    pub fn apply(&self, spec: &FormatSpec, value: Value) -> Result<Value, FormatError> {
        match spec {
            FormatSpec::None => Ok(value),
            FormatSpec::Single(name) => (self.get(name)?)(&value),
            FormatSpec::Chain(names) => {
                let mut current = value;
                for name in names {
                    current = (self.get(name)?)(&current)?;
                    if is_falsy(&current) {
                        return Ok(Value::Null);
                    }
                }
                Ok(current)
            }
        }
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Falsy means null, false, zero, or an empty string/array/object.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn parse_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => n.as_i64(),
        Value::Number(n) => n.as_f64().map(|f| f.trunc() as i64),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn parse_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn to_int(value: &Value) -> Result<Value, FormatError> {
    parse_int(value).map(Value::from).ok_or(FormatError::Convert {
        name: "toInt",
        value: value.clone(),
    })
}

fn to_int_or_null(value: &Value) -> Result<Value, FormatError> {
    Ok(parse_int(value).map(Value::from).unwrap_or(Value::Null))
}

fn to_float(value: &Value) -> Result<Value, FormatError> {
    parse_float(value)
        .map(Value::from)
        .ok_or(FormatError::Convert {
            name: "toFloat",
            value: value.clone(),
        })
}

fn to_float_or_null(value: &Value) -> Result<Value, FormatError> {
    Ok(parse_float(value).map(Value::from).unwrap_or(Value::Null))
}
