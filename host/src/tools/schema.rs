//! Input schema sanitization
//!
//! The calling agent's schema consumer only understands a subset of JSON
//! schema string formats, so external schemas are cleaned before they are
//! registered.

use serde_json::{Map, Value};

/// String formats the agent understands
pub const ACCEPTED_STRING_FORMATS: &[&str] = &["enum", "date-time"];

/// Recursively drop unsupported `format`s from string schemas
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(object) => Value::Object(sanitize_object(object)),
        other => other.clone(),
    }
}

fn sanitize_object(object: &Map<String, Value>) -> Map<String, Value> {
    let mut cleaned = Map::new();

    for (key, value) in object {
        let value = match key.as_str() {
            "format" if is_string_schema(object) => {
                let accepted = value
                    .as_str()
                    .map(|f| ACCEPTED_STRING_FORMATS.contains(&f))
                    .unwrap_or(false);
                if !accepted {
                    continue;
                }
                value.clone()
            }
            // name -> schema
            "properties" | "patternProperties" | "$defs" | "definitions" => match value {
                Value::Object(schemas) => Value::Object(
                    schemas
                        .iter()
                        .map(|(name, schema)| (name.clone(), sanitize_schema(schema)))
                        .collect(),
                ),
                other => other.clone(),
            },
            // schema or list of schemas
            "items" | "prefixItems" | "anyOf" | "oneOf" | "allOf" => match value {
                Value::Array(schemas) => Value::Array(schemas.iter().map(sanitize_schema).collect()),
                other => sanitize_schema(other),
            },
            "additionalProperties" | "not" => sanitize_schema(value),
            _ => value.clone(),
        };
        cleaned.insert(key.clone(), value);
    }

    cleaned
}

/// `"type": "string"` or a type list that includes it (`["string", "null"]`)
fn is_string_schema(object: &Map<String, Value>) -> bool {
    match object.get("type") {
        Some(Value::String(t)) => t == "string",
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some("string")),
        _ => false,
    }
}
