//! Basic conformance checks of tool arguments against a tool's `inputSchema`.
//!
//! Only the subset the tool macros emit is understood: `required`, per-property
//! `type` (single or list) and array `items`. Anything else is accepted.

use serde_json::{Map, Value};

pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let Some(arguments) = arguments.as_object() else {
        return Err("arguments must be an object".to_string());
    };

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    for name in &required {
        if arguments.get(*name).map_or(true, Value::is_null) {
            return Err(format!("missing required argument: {name}"));
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    check_properties(properties, arguments, &required)
}

fn check_properties(
    properties: &Map<String, Value>,
    arguments: &Map<String, Value>,
    required: &[&str],
) -> Result<(), String> {
    for (name, value) in arguments {
        let Some(property) = properties.get(name) else {
            continue;
        };
        if value.is_null() && !required.contains(&name.as_str()) {
            continue;
        }
        if !matches_schema(property, value) {
            return Err(format!(
                "argument {name} must be of type {}",
                describe_type(property)
            ));
        }
    }
    Ok(())
}

fn matches_schema(property: &Value, value: &Value) -> bool {
    let type_ok = match property.get("type") {
        Some(Value::String(kind)) => matches_type(kind, value),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .any(|kind| matches_type(kind, value)),
        _ => true,
    };
    if !type_ok {
        return false;
    }

    match (property.get("items"), value.as_array()) {
        (Some(items), Some(elements)) => elements.iter().all(|element| matches_schema(items, element)),
        _ => true,
    }
}

fn matches_type(kind: &str, value: &Value) -> bool {
    match kind {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(property: &Value) -> String {
    match property.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        _ => "any".to_string(),
    }
}
