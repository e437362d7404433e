use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use shield_core::{Check, CheckError, ValidationMessage, ValidationResult};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("read schema {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parse JSON schema: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parse YAML schema: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid schema: {0}")]
    Invalid(String),
}

/// One schema violation, addressed by a dotted path into the data.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaViolation {
    pub keyword: &'static str,
    pub path: String,
    pub message: String,
}

/// Validates data against a JSON-Schema subset:
/// `type`, `required`, `properties`, `additionalProperties: false`, `items`,
/// `enum`, `minimum`/`maximum`, `minLength`/`maxLength`, `minItems`/`maxItems`.
#[derive(Clone, Debug)]
pub struct SchemaCheck {
    schema: Value,
}

impl SchemaCheck {
    pub fn new(schema: Value) -> Result<Self, SchemaError> {
        if !schema.is_object() {
            return Err(SchemaError::Invalid("schema root must be an object".into()));
        }
        check_schema_shape(&schema, "$")?;
        Ok(Self { schema })
    }

    /// Loads a schema from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| SchemaError::Io { path: path.display().to_string(), source })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
            Some("yaml" | "yml")
        );
        let schema: Value = if is_yaml { serde_yaml::from_str(&text)? } else { serde_json::from_str(&text)? };
        Self::new(schema)
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn violations(&self, data: &Value) -> Vec<SchemaViolation> {
        let mut out = vec![];
        validate_node(&self.schema, data, "", &mut out);
        out
    }
}

#[async_trait]
impl Check for SchemaCheck {
    fn name(&self) -> &str {
        "schema"
    }

    async fn validate(&self, data: &Value, result: &mut ValidationResult) -> Result<(), CheckError> {
        let violations = self.violations(data);
        if violations.is_empty() {
            result.set_data(data.clone());
            return Ok(());
        }
        for v in violations {
            let mut msg = ValidationMessage::error(format!("SCHEMA_{}", v.keyword.to_ascii_uppercase()), v.message)
                .with_validator(self.name());
            if !v.path.is_empty() {
                msg = msg.with_field(v.path);
            }
            result.add_message(msg);
        }
        Ok(())
    }
}

fn check_schema_shape(schema: &Value, at: &str) -> Result<(), SchemaError> {
    let Some(obj) = schema.as_object() else {
        return Err(SchemaError::Invalid(format!("{at} must be an object")));
    };
    if let Some(t) = obj.get("type") {
        let names: Vec<&Value> = match t {
            Value::Array(a) => a.iter().collect(),
            other => vec![other],
        };
        for n in names {
            match n.as_str() {
                Some("string" | "integer" | "number" | "boolean" | "object" | "array" | "null") => {}
                _ => return Err(SchemaError::Invalid(format!("{at}.type has unsupported value {n}"))),
            }
        }
    }
    if let Some(props) = obj.get("properties") {
        let Some(props) = props.as_object() else {
            return Err(SchemaError::Invalid(format!("{at}.properties must be an object")));
        };
        for (k, sub) in props {
            check_schema_shape(sub, &format!("{at}.properties.{k}"))?;
        }
    }
    if let Some(items) = obj.get("items") {
        check_schema_shape(items, &format!("{at}.items"))?;
    }
    if let Some(req) = obj.get("required") {
        if !req.as_array().is_some_and(|a| a.iter().all(Value::is_string)) {
            return Err(SchemaError::Invalid(format!("{at}.required must be a list of strings")));
        }
    }
    Ok(())
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(expected: &str, v: &Value) -> bool {
    match expected {
        "integer" => v.as_f64().is_some_and(|f| f.fract() == 0.0),
        "number" => v.is_number(),
        other => type_name(v) == other,
    }
}

fn validate_node(schema: &Value, data: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
    let Some(s) = schema.as_object() else { return };
    let mut push = |keyword: &'static str, p: &str, message: String| {
        out.push(SchemaViolation { keyword, path: p.to_string(), message })
    };

    if let Some(t) = s.get("type") {
        let allowed: Vec<&str> = match t {
            Value::Array(a) => a.iter().filter_map(Value::as_str).collect(),
            Value::String(one) => vec![one.as_str()],
            _ => vec![],
        };
        if !allowed.is_empty() && !allowed.iter().any(|a| matches_type(a, data)) {
            push("type", path, format!("{} is not of type {}", short(data), allowed.join(" or ")));
            // Further keywords would only restate the type mismatch.
            return;
        }
    }

    if let Some(options) = s.get("enum").and_then(Value::as_array) {
        if !options.contains(data) {
            push("enum", path, format!("{} is not one of {}", short(data), Value::Array(options.clone())));
        }
    }

    match data {
        Value::Number(n) => {
            let x = n.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = s.get("minimum").and_then(Value::as_f64) {
                if x < min {
                    push("minimum", path, format!("{n} is less than the minimum of {min}"));
                }
            }
            if let Some(max) = s.get("maximum").and_then(Value::as_f64) {
                if x > max {
                    push("maximum", path, format!("{n} is greater than the maximum of {max}"));
                }
            }
        }
        Value::String(text) => {
            let len = text.chars().count() as u64;
            if let Some(min) = s.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    push("minLength", path, format!("{} is shorter than {min} characters", short(data)));
                }
            }
            if let Some(max) = s.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    push("maxLength", path, format!("{} is longer than {max} characters", short(data)));
                }
            }
        }
        Value::Array(items) => {
            let len = items.len() as u64;
            if let Some(min) = s.get("minItems").and_then(Value::as_u64) {
                if len < min {
                    push("minItems", path, format!("array has {len} items, fewer than {min}"));
                }
            }
            if let Some(max) = s.get("maxItems").and_then(Value::as_u64) {
                if len > max {
                    push("maxItems", path, format!("array has {len} items, more than {max}"));
                }
            }
            if let Some(item_schema) = s.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_node(item_schema, item, &join(path, &i.to_string()), out);
                }
            }
        }
        Value::Object(obj) => validate_object(s, obj, path, out),
        _ => {}
    }
}

fn validate_object(s: &Map<String, Value>, obj: &Map<String, Value>, path: &str, out: &mut Vec<SchemaViolation>) {
    if let Some(required) = s.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                out.push(SchemaViolation {
                    keyword: "required",
                    path: join(path, key),
                    message: format!("'{key}' is a required property"),
                });
            }
        }
    }

    let props = s.get("properties").and_then(Value::as_object);
    if let Some(props) = props {
        for (key, sub) in props {
            if let Some(v) = obj.get(key) {
                validate_node(sub, v, &join(path, key), out);
            }
        }
    }

    if s.get("additionalProperties") == Some(&Value::Bool(false)) {
        for key in obj.keys() {
            if !props.is_some_and(|p| p.contains_key(key)) {
                out.push(SchemaViolation {
                    keyword: "additionalProperties",
                    path: join(path, key),
                    message: format!("additional property '{key}' is not allowed"),
                });
            }
        }
    }
}

fn short(v: &Value) -> String {
    let s = v.to_string();
    if s.chars().count() > 60 {
        let head: String = s.chars().take(57).collect();
        format!("{head}...")
    } else {
        s
    }
}
