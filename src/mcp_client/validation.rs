//! Parameter validation against a tool's input schema.
//!
//! Covers the structural subset of JSON Schema that tool servers actually
//! use: `type` (single or union), `required`, `enum`, `properties`,
//! `additionalProperties: false` and array `items`. Anything richer is left
//! for the server to enforce.

use serde_json::{Map, Value};

use super::errors::McpError;
use super::types::ToolDescriptor;

/// Check `params` against the tool's input schema. Fails on the first
/// violation, naming the offending field by its dotted path.
pub fn validate_params(tool: &ToolDescriptor, params: &Map<String, Value>) -> Result<(), McpError> {
    validate_object(&tool.name, "", &tool.input_schema, params)
}

fn field_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn violation(tool: &str, field: &str, reason: impl Into<String>) -> McpError {
    McpError::Validation {
        tool: tool.to_string(),
        field: if field.is_empty() { "(params)".into() } else { field.to_string() },
        reason: reason.into(),
    }
}

fn validate_object(
    tool: &str,
    path: &str,
    schema: &Value,
    object: &Map<String, Value>,
) -> Result<(), McpError> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                return Err(violation(
                    tool,
                    &field_path(path, name),
                    "missing required parameter",
                ));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, value) in object {
        let child = field_path(path, key);
        match properties.and_then(|p| p.get(key)) {
            Some(prop) => validate_value(tool, &child, prop, value)?,
            None if closed => return Err(violation(tool, &child, "unexpected parameter")),
            None => {}
        }
    }
    Ok(())
}

fn validate_value(tool: &str, path: &str, schema: &Value, value: &Value) -> Result<(), McpError> {
    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
            return Err(violation(
                tool,
                path,
                format!("expected {}, got {}", allowed.join(" or "), type_name(value)),
            ));
        }
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            let shown: Vec<String> = options.iter().map(Value::to_string).collect();
            return Err(violation(
                tool,
                path,
                format!("must be one of {}", shown.join(", ")),
            ));
        }
    }

    match value {
        Value::Object(inner) if schema.get("properties").is_some() || schema.get("required").is_some() => {
            validate_object(tool, path, schema, inner)
        }
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) if item_schema.is_object() => {
                for (i, item) in items.iter().enumerate() {
                    validate_value(tool, &format!("{path}[{i}]"), item_schema, item)?;
                }
                Ok(())
            }
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to reject.
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

// ─── Sample Parameters ───────────────────────────────────────────────────────

/// Build placeholder arguments for a smoke-test call: the schema's
/// `default` where given, the first `enum` option, otherwise a fixed value
/// per type.
pub fn sample_params(schema: &Value) -> Map<String, Value> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Map::new();
    };
    properties
        .iter()
        .map(|(name, prop)| (name.clone(), sample_value(prop)))
        .collect()
}

fn sample_value(schema: &Value) -> Value {
    if let Some(default) = schema.get("default") {
        return default.clone();
    }
    if let Some(first) = schema.get("enum").and_then(Value::as_array).and_then(|o| o.first()) {
        return first.clone();
    }

    let ty = match schema.get("type") {
        Some(Value::String(t)) => t.as_str(),
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .unwrap_or("string"),
        _ => "string",
    };
    match ty {
        "integer" => schema
            .get("minimum")
            .filter(|m| m.is_i64() || m.is_u64())
            .cloned()
            .unwrap_or(Value::from(1)),
        "number" => Value::from(1.0),
        "boolean" => Value::Bool(true),
        "array" => Value::Array(Vec::new()),
        "object" => Value::Object(sample_params(schema)),
        "null" => Value::Null,
        _ => Value::String("test".into()),
    }
}
