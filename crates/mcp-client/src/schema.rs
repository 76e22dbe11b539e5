//! JSON Schema helpers for tool input schemas
//!
//! Builders for hand-written schemas and a validator checking tool
//! arguments before they are sent to a server.

use serde_json::{Map, Value, json};

/// Create a JSON Schema object type
///
/// # Example
///
/// ```
/// use mcp_client::schema::{integer, object, string};
/// use serde_json::json;
///
/// let schema = object(
///     json!({
///         "path": string(Some("File to read")),
///         "limit": integer(None),
///     }),
///     vec!["path"],
/// );
/// assert_eq!(schema["required"][0], "path");
/// ```
pub fn object(properties: Value, required: Vec<&str>) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn typed(kind: &str, description: Option<&str>) -> Value {
    let mut schema = json!({"type": kind});
    if let Some(d) = description {
        schema["description"] = json!(d);
    }
    schema
}

pub fn string(description: Option<&str>) -> Value {
    typed("string", description)
}

pub fn number(description: Option<&str>) -> Value {
    typed("number", description)
}

pub fn integer(description: Option<&str>) -> Value {
    typed("integer", description)
}

pub fn boolean(description: Option<&str>) -> Value {
    typed("boolean", description)
}

/// Create a JSON Schema array type with the given item schema
pub fn array(items: Value, description: Option<&str>) -> Value {
    let mut schema = typed("array", description);
    schema["items"] = items;
    schema
}

/// Create an enum schema (string with allowed values)
pub fn enum_string(values: Vec<&str>, description: Option<&str>) -> Value {
    let mut schema = typed("string", description);
    schema["enum"] = json!(values);
    schema
}

/// Validate tool arguments against an input schema
///
/// Supports the subset servers use in practice: `type` (single or list),
/// `required`, `properties`, `items`, `enum`, `minLength`/`maxLength` and
/// `minimum`/`maximum`. Unknown keywords are ignored. Returns every
/// problem found, each prefixed with the JSON path of the offending value.
pub fn validate_arguments(arguments: &Value, schema: &Value) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();
    validate_at("$", arguments, schema, &mut problems);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn validate_at(path: &str, value: &Value, schema: &Value, problems: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(value, expected) {
            problems.push(format!(
                "{}: expected {}, got {}",
                path,
                describe_type(expected),
                type_name(value)
            ));
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            problems.push(format!("{}: {} is not one of {}", path, value, Value::Array(allowed.clone())));
        }
    }

    match value {
        Value::String(s) => check_length(path, s, schema, problems),
        Value::Number(n) => {
            if let Some(n) = n.as_f64() {
                check_range(path, n, schema, problems);
            }
        }
        Value::Object(fields) => check_object(path, fields, schema, problems),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_at(&format!("{path}[{i}]"), item, item_schema, problems);
                }
            }
        }
        _ => {}
    }
}

fn check_object(
    path: &str,
    fields: &Map<String, Value>,
    schema: &Map<String, Value>,
    problems: &mut Vec<String>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                problems.push(format!("{}: missing required property '{}'", path, name));
            }
        }
    }

    if let Some(Value::Object(properties)) = schema.get("properties") {
        for (name, value) in fields {
            if let Some(property_schema) = properties.get(name) {
                validate_at(&format!("{path}.{name}"), value, property_schema, problems);
            }
        }
    }
}

fn check_length(path: &str, s: &str, schema: &Map<String, Value>, problems: &mut Vec<String>) {
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            problems.push(format!("{}: shorter than {} characters", path, min));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            problems.push(format!("{}: longer than {} characters", path, max));
        }
    }
}

fn check_range(path: &str, n: f64, schema: &Map<String, Value>, problems: &mut Vec<String>) {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            problems.push(format!("{}: {} is below the minimum {}", path, n, min));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            problems.push(format!("{}: {} is above the maximum {}", path, n, max));
        }
    }
}

fn type_matches(value: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(kind) => is_type(value, kind),
        Value::Array(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .any(|kind| is_type(value, kind)),
        // Malformed type keyword, nothing to check against
        _ => true,
    }
}

fn is_type(value: &Value, kind: &str) -> bool {
    match kind {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(kind) => kind.clone(),
        Value::Array(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let schema = string(Some("A path"));
        assert_eq!(schema["type"], "string");
        assert_eq!(schema["description"], "A path");
        assert!(string(None).get("description").is_none());

        let schema = array(integer(None), Some("Line numbers"));
        assert_eq!(schema["items"]["type"], "integer");

        let schema = enum_string(vec!["asc", "desc"], None);
        assert_eq!(schema["enum"].as_array().unwrap().len(), 2);
    }

    fn read_file_schema() -> Value {
        object(
            json!({
                "path": {"type": "string", "minLength": 1, "maxLength": 256},
                "encoding": enum_string(vec!["utf-8", "latin1"], None),
                "limit": {"type": "integer", "minimum": 1, "maximum": 1000},
                "ranges": array(
                    object(json!({"start": integer(None), "end": integer(None)}), vec!["start"]),
                    None,
                ),
                "follow": boolean(None),
            }),
            vec!["path"],
        )
    }

    #[test]
    fn test_valid_arguments() {
        let args = json!({
            "path": "/workspace/src/main.rs",
            "encoding": "utf-8",
            "limit": 10,
            "ranges": [{"start": 1, "end": 5}, {"start": 9}],
            "follow": true,
            "extra": "ignored"
        });
        assert_eq!(validate_arguments(&args, &read_file_schema()), Ok(()));
    }

    #[test]
    fn test_missing_required_and_wrong_type() {
        let problems = validate_arguments(&json!({"limit": "ten"}), &read_file_schema()).unwrap_err();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("missing required property 'path'")));
        assert!(problems.iter().any(|p| p.starts_with("$.limit: expected integer")));
    }

    #[test]
    fn test_enum_length_and_range() {
        let args = json!({"path": "", "encoding": "ascii", "limit": 5000});
        let problems = validate_arguments(&args, &read_file_schema()).unwrap_err();
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems.iter().any(|p| p.starts_with("$.path: shorter")));
        assert!(problems.iter().any(|p| p.starts_with("$.encoding:")));
        assert!(problems.iter().any(|p| p.contains("above the maximum")));
    }

    #[test]
    fn test_nested_items_report_paths() {
        let args = json!({"path": "a", "ranges": [{"start": 1}, {"end": "x"}]});
        let problems = validate_arguments(&args, &read_file_schema()).unwrap_err();
        assert!(problems.contains(&"$.ranges[1]: missing required property 'start'".to_string()));
        assert!(problems.iter().any(|p| p.starts_with("$.ranges[1].end: expected integer")));
    }

    #[test]
    fn test_permissive_schemas() {
        assert!(validate_arguments(&json!({"anything": 1}), &json!({"type": "object"})).is_ok());
        assert!(validate_arguments(&json!(null), &json!({})).is_ok());
        assert!(validate_arguments(&json!(3), &json!({"type": ["string", "integer"]})).is_ok());
        assert!(validate_arguments(&json!([]), &json!({"type": "object"})).is_err());
    }
}
