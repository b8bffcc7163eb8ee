//! Structural payload validator.
//!
//! A recursive validator over a JSON-Schema-like subset (`type`, `required`,
//! `properties`, `items`, `minimum`/`maximum`, `minLength`/`maxLength`,
//! `pattern`, `enum`, `additionalProperties`). `validate` is total: it never
//! panics, and pathological nesting fails closed with a depth error instead
//! of exhausting the stack.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Maximum nesting depth the validator will recurse into.
pub const MAX_SCHEMA_DEPTH: usize = 64;

/// Value types a schema node can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl SchemaType {
    fn name(self) -> &'static str {
        match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Null => "null",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            SchemaType::Object => value.is_object(),
            SchemaType::Array => value.is_array(),
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value.is_i64() || value.is_u64(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Null => value.is_null(),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
    }
}

fn default_additional() -> bool {
    true
}

/// One schema node. Unknown keywords are rejected at registration time
/// (strict parsing, as the config layer does).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schema {
    #[serde(rename = "type", default)]
    pub schema_type: Option<SchemaType>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default)]
    pub items: Option<Box<Schema>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(rename = "minLength", default)]
    pub min_length: Option<usize>,
    #[serde(rename = "maxLength", default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<Value>>,
    #[serde(rename = "additionalProperties", default = "default_additional")]
    pub additional_properties: bool,
}

impl Schema {
    /// Parse a schema from a JSON value, rejecting unknown keywords.
    pub fn parse(value: Value) -> crate::Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| crate::PortLinkError::Validation(format!("invalid schema: {e}")))
    }
}

/// One validation failure, addressed by a JSON-pointer-ish path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Path to the offending node (`$`, `$.a`, `$.items[3].x`).
    pub path: String,
    pub message: String,
}

/// Validation outcome. `valid` iff `errors` is empty.
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

/// Validate `value` against `schema`. Never panics.
pub fn validate(value: &Value, schema: &Schema) -> Validation {
    let mut errors = Vec::new();
    check_node(value, schema, "$", 0, &mut errors);
    Validation {
        valid: errors.is_empty(),
        errors,
    }
}

fn push(errors: &mut Vec<ValidationError>, path: &str, message: String) {
    errors.push(ValidationError {
        path: path.to_string(),
        message,
    });
}

fn check_node(
    value: &Value,
    schema: &Schema,
    path: &str,
    depth: usize,
    errors: &mut Vec<ValidationError>,
) {
    if depth >= MAX_SCHEMA_DEPTH {
        push(
            errors,
            path,
            format!("maximum validation depth {MAX_SCHEMA_DEPTH} exceeded"),
        );
        return;
    }

    // A type mismatch short-circuits every other check for this node; further
    // constraint errors on a wrongly-typed node would be noise.
    if let Some(expected) = schema.schema_type {
        if !expected.matches(value) {
            push(
                errors,
                path,
                format!("expected {}, got {}", expected.name(), type_name(value)),
            );
            return;
        }
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.contains(value) {
            push(errors, path, "value not in enum".to_string());
        }
    }

    match value {
        Value::Object(map) => {
            for key in &schema.required {
                if !map.contains_key(key) {
                    push(errors, path, format!("missing required property '{key}'"));
                }
            }
            for (key, sub) in &schema.properties {
                if let Some(child) = map.get(key) {
                    check_node(child, sub, &format!("{path}.{key}"), depth + 1, errors);
                }
            }
            if !schema.additional_properties {
                for key in map.keys() {
                    if !schema.properties.contains_key(key) {
                        push(errors, path, format!("undeclared property '{key}'"));
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = &schema.items {
                for (i, item) in items.iter().enumerate() {
                    check_node(item, item_schema, &format!("{path}[{i}]"), depth + 1, errors);
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count();
            if let Some(min) = schema.min_length {
                if len < min {
                    push(errors, path, format!("length {len} below minLength {min}"));
                }
            }
            if let Some(max) = schema.max_length {
                if len > max {
                    push(errors, path, format!("length {len} above maxLength {max}"));
                }
            }
            if let Some(pattern) = &schema.pattern {
                match Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(s) {
                            push(errors, path, format!("does not match pattern {pattern:?}"));
                        }
                    }
                    Err(_) => push(errors, path, format!("invalid pattern {pattern:?}")),
                }
            }
        }
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(0.0);
            if let Some(min) = schema.minimum {
                if f < min {
                    push(errors, path, format!("{f} below minimum {min}"));
                }
            }
            if let Some(max) = schema.maximum {
                if f > max {
                    push(errors, path, format!("{f} above maximum {max}"));
                }
            }
        }
        _ => {}
    }
}
