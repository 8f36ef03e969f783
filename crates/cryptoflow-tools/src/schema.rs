//! Argument validation against the JSON Schema subset tools declare.
//!
//! Supported keywords: `type`, `required`, `properties`, `additionalProperties: false`,
//! `enum`, `minimum`, `maximum`. Anything else is accepted as-is.

use serde_json::{Map, Value};

/// Check `args` against `schema`, collecting every violation.
pub fn validate(schema: &Value, args: &Value) -> Result<(), Vec<String>> {
    let mut violations = Vec::new();
    check(schema, args, "", &mut violations);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn check(schema: &Value, value: &Value, path: &str, out: &mut Vec<String>) {
    let here = if path.is_empty() { "arguments" } else { path };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            out.push(format!("{here}: expected {expected}, got {}", type_name(value)));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            out.push(format!("{here}: {value} is not one of {}", Value::Array(allowed.clone())));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                out.push(format!("{here}: {n} is below minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                out.push(format!("{here}: {n} is above maximum {max}"));
            }
        }
    }

    if let Some(obj) = value.as_object() {
        check_object(schema, obj, path, out);
    }
}

fn check_object(schema: &Value, obj: &Map<String, Value>, path: &str, out: &mut Vec<String>) {
    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                out.push(format!("missing required field: {}", join(path, key)));
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
    for (key, value) in obj {
        match properties.and_then(|p| p.get(key)) {
            Some(sub) => check(sub, value, &join(path, key), out),
            None if closed => out.push(format!("unexpected field: {}", join(path, key))),
            None => {}
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
