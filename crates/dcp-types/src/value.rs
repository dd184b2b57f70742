//! `TaskSpec` and log-payload values.
//!
//! Both are modeled as a JSON object (`serde_json::Map`) rather than a
//! closed Rust struct, because the set of recognized keys is task-type- and
//! caller-specific and the wire format is already JSON. Accessors normalize
//! numeric forms (JSON numbers read back as `i64` where the caller needs an
//! integer) and document the type they require.

use serde_json::{Map, Value};
use thiserror::Error;

pub type JsonMap = Map<String, Value>;

#[derive(Debug, Error, PartialEq)]
pub enum FieldError {
    #[error("missing required field '{0}'")]
    Missing(String),
    #[error("field '{field}' has the wrong type: expected {expected}, got {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: String,
    },
}

/// Read a required string field.
pub fn require_str<'a>(map: &'a JsonMap, field: &str) -> Result<&'a str, FieldError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(FieldError::Missing(field.to_string())),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(FieldError::WrongType {
            field: field.to_string(),
            expected: "string",
            found: type_name(other),
        }),
    }
}

/// Read an optional string field.
pub fn get_str<'a>(map: &'a JsonMap, field: &str) -> Option<&'a str> {
    match map.get(field) {
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Read a required integer field. JSON numbers (including those that arrived
/// as floats with no fractional part) are normalized to `i64`.
pub fn require_i64(map: &JsonMap, field: &str) -> Result<i64, FieldError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(FieldError::Missing(field.to_string())),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| FieldError::WrongType {
            field: field.to_string(),
            expected: "integer",
            found: "non-integral number".to_string(),
        }),
        Some(other) => Err(FieldError::WrongType {
            field: field.to_string(),
            expected: "integer",
            found: type_name(other),
        }),
    }
}

/// Read an optional integer field, normalizing like [`require_i64`].
pub fn get_i64(map: &JsonMap, field: &str) -> Option<i64> {
    match map.get(field) {
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    }
}

pub fn get_bool(map: &JsonMap, field: &str) -> Option<bool> {
    match map.get(field) {
        Some(Value::Bool(b)) => Some(*b),
        _ => None,
    }
}

fn type_name(v: &Value) -> String {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

/// Serialize a `JsonMap` to its canonical stored-spec string form.
pub fn to_spec_string(map: &JsonMap) -> String {
    Value::Object(map.clone()).to_string()
}

/// Parse a stored-spec string back into a `JsonMap`.
pub fn from_spec_string(s: &str) -> serde_json::Result<JsonMap> {
    match serde_json::from_str(s)? {
        Value::Object(map) => Ok(map),
        other => Ok(Map::from_iter([( "value".to_string(), other )])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> JsonMap {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn reads_required_fields() {
        let m = map(json!({"bucket": "b", "byte_offset": 10}));
        assert_eq!(require_str(&m, "bucket").unwrap(), "b");
        assert_eq!(require_i64(&m, "byte_offset").unwrap(), 10);
    }

    #[test]
    fn missing_field_is_an_error() {
        let m = map(json!({}));
        assert_eq!(
            require_str(&m, "bucket").unwrap_err(),
            FieldError::Missing("bucket".to_string())
        );
    }

    #[test]
    fn wrong_type_is_an_error() {
        let m = map(json!({"byte_offset": "not a number"}));
        assert!(matches!(
            require_i64(&m, "byte_offset").unwrap_err(),
            FieldError::WrongType { .. }
        ));
    }

    #[test]
    fn float_without_fraction_normalizes_to_i64() {
        let m = map(json!({"n": 42.0}));
        assert_eq!(require_i64(&m, "n").unwrap(), 42);
    }

    #[test]
    fn round_trips_through_spec_string() {
        let m = map(json!({"a": 1, "b": "x"}));
        let s = to_spec_string(&m);
        let back = from_spec_string(&s).unwrap();
        assert_eq!(m, back);
    }
}
