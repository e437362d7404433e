use serde_json::Value;
use tracing::debug;

use shield_core::{ExtractError, Extractor, Source, ValidationMessage, ValidationResult};

pub const JSON_PARSE_ERROR: &str = "JSON_PARSE_ERROR";

/// Parses `.json` documents and `.jsonl`/`.ndjson` record streams.
///
/// Line-delimited input becomes an array with one element per non-blank line.
#[derive(Clone, Debug)]
pub struct JsonExtractor {
    max_depth_warning: usize,
}

impl JsonExtractor {
    pub fn new() -> Self {
        Self { max_depth_warning: 10 }
    }

    /// Nesting deeper than `depth` adds a `JSON_DEEP_NESTING` warning.
    pub fn warn_above_depth(mut self, depth: usize) -> Self {
        self.max_depth_warning = depth;
        self
    }
}

impl Default for JsonExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_lines(text: &str) -> Result<Value, ExtractError> {
    let mut records = vec![];
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let v: Value = serde_json::from_str(line)
            .map_err(|e| ExtractError::parse(JSON_PARSE_ERROR, format!("line {}: {e}", i + 1)))?;
        records.push(v);
    }
    Ok(Value::Array(records))
}

/// Containers on the deepest path; scalars are depth 0.
pub fn depth(v: &Value) -> usize {
    match v {
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

pub fn count_keys(v: &Value) -> usize {
    match v {
        Value::Array(items) => items.iter().map(count_keys).sum(),
        Value::Object(map) => map.len() + map.values().map(count_keys).sum::<usize>(),
        _ => 0,
    }
}

fn root_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Extractor for JsonExtractor {
    fn name(&self) -> &str {
        "json"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &[".json", ".jsonl", ".ndjson"]
    }

    fn process(&self, source: &Source, result: &mut ValidationResult) -> Result<(), ExtractError> {
        let text = source.text()?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        if text.trim().is_empty() {
            return Err(ExtractError::Empty(source.name.clone()));
        }

        let lines = matches!(source.extension().as_deref(), Some(".jsonl" | ".ndjson"));
        let value = if lines {
            parse_lines(text)?
        } else {
            serde_json::from_str(text).map_err(|e| ExtractError::parse(JSON_PARSE_ERROR, e.to_string()))?
        };

        let d = depth(&value);
        result.set_meta("json_format", if lines { "jsonl" } else { "json" });
        result.set_meta("root_type", root_type(&value));
        result.set_meta("max_depth", d);
        result.set_meta("total_keys", count_keys(&value));
        if let Value::Array(items) = &value {
            result.set_meta("record_count", items.len());
        }
        if d > self.max_depth_warning {
            result.add_message(
                ValidationMessage::warning(
                    "JSON_DEEP_NESTING",
                    format!("nesting depth {d} exceeds {}", self.max_depth_warning),
                )
                .with_validator(self.name())
                .with_detail("max_depth", d),
            );
        }
        debug!(source = %source.name, depth = d, "json extracted");
        result.set_data(value);
        Ok(())
    }
}
