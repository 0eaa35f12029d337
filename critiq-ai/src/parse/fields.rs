//! Typed accessors for validating extracted objects
//!
//! Each accessor returns a violation message on failure so validators can
//! report every problem of a response at once.

use serde_json::{Map, Value};

pub type Object = Map<String, Value>;

pub fn required_string<'a>(obj: &'a Object, key: &str) -> Result<&'a str, String> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(format!("field '{}' must be a string, got {}", key, type_name(other))),
        None => Err(format!("missing required field '{}'", key)),
    }
}

/// Absent and `null` both read as `None`
pub fn optional_string<'a>(obj: &'a Object, key: &str) -> Result<Option<&'a str>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(format!("field '{}' must be a string, got {}", key, type_name(other))),
    }
}

pub fn required_number(obj: &Object, key: &str) -> Result<f64, String> {
    match obj.get(key) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| format!("field '{}' is not representable as a number", key)),
        Some(other) => Err(format!("field '{}' must be a number, got {}", key, type_name(other))),
        None => Err(format!("missing required field '{}'", key)),
    }
}

/// Non-negative integer count; absent and `null` read as `None`
pub fn optional_count(obj: &Object, key: &str) -> Result<Option<u64>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("field '{}' must be a non-negative integer", key)),
        Some(other) => Err(format!("field '{}' must be an integer, got {}", key, type_name(other))),
    }
}

pub fn required_array<'a>(obj: &'a Object, key: &str) -> Result<&'a [Value], String> {
    match obj.get(key) {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(format!("field '{}' must be an array, got {}", key, type_name(other))),
        None => Err(format!("missing required field '{}'", key)),
    }
}

/// Absent and `null` read as an empty array
pub fn optional_array<'a>(obj: &'a Object, key: &str) -> Result<&'a [Value], String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(format!("field '{}' must be an array, got {}", key, type_name(other))),
    }
}

/// Keep at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Object {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_accessors() {
        let o = obj(json!({"s": "x", "n": 0.5, "c": 3, "a": [1], "nul": null, "bad": true}));
        assert_eq!(required_string(&o, "s").unwrap(), "x");
        assert!(required_string(&o, "n").is_err());
        assert!(required_string(&o, "missing").unwrap_err().contains("missing"));
        assert_eq!(optional_string(&o, "nul").unwrap(), None);
        assert!(optional_string(&o, "bad").is_err());
        assert_eq!(required_number(&o, "n").unwrap(), 0.5);
        assert_eq!(optional_count(&o, "c").unwrap(), Some(3));
        assert!(optional_count(&o, "n").is_err());
        assert_eq!(required_array(&o, "a").unwrap().len(), 1);
        assert!(optional_array(&o, "missing").unwrap().is_empty());
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
