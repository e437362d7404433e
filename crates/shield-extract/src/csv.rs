use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Number, Value};
use tracing::debug;

use shield_core::{ExtractError, Extractor, MetaValue, Source, ValidationMessage, ValidationResult};

pub const CSV_PARSE_ERROR: &str = "CSV_PARSE_ERROR";
pub const CSV_EMPTY: &str = "CSV_EMPTY";

const NULL_MARKERS: [&str; 8] = ["", "NA", "N/A", "null", "NULL", "None", "nan", "NaN"];

/// Reads delimited text with a header row into an array of objects.
///
/// Fields follow RFC 4180 quoting: a quoted field may contain the delimiter,
/// newlines, and `""` for a literal quote.
#[derive(Clone, Debug)]
pub struct CsvExtractor {
    null_rate_warning: f64,
}

impl CsvExtractor {
    pub fn new() -> Self {
        Self { null_rate_warning: 0.2 }
    }

    pub fn warn_above_null_rate(mut self, rate: f64) -> Self {
        self.null_rate_warning = rate;
        self
    }
}

impl Default for CsvExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `text` into rows of raw fields.
pub fn parse_rows(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut rows = vec![];
    let mut row: Vec<String> = vec![];
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1usize;
    let mut quote_line = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                line += 1;
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            c if c == delimiter => row.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(ExtractError::parse(CSV_PARSE_ERROR, format!("unterminated quote opened on line {quote_line}")));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| !(r.len() == 1 && r[0].trim().is_empty()));
    Ok(rows)
}

/// Best-effort scalar typing of one raw field.
pub fn infer(raw: &str) -> Value {
    let s = raw.trim();
    if NULL_MARKERS.contains(&s) {
        return Value::Null;
    }
    if s.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if s.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(n) = s.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

fn type_label(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() => "integer",
        Value::Number(_) => "float",
        _ => "string",
    }
}

impl Extractor for CsvExtractor {
    fn name(&self) -> &str {
        "csv"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &[".csv", ".tsv"]
    }

    fn process(&self, source: &Source, result: &mut ValidationResult) -> Result<(), ExtractError> {
        let text = source.text()?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        if text.trim().is_empty() {
            return Err(ExtractError::Empty(source.name.clone()));
        }
        let delimiter = if source.extension().as_deref() == Some(".tsv") { '\t' } else { ',' };

        let mut rows = parse_rows(text, delimiter)?.into_iter();
        let header: Vec<String> = match rows.next() {
            Some(h) => h.into_iter().map(|c| c.trim().to_string()).collect(),
            None => return Err(ExtractError::parse(CSV_EMPTY, "no header row")),
        };
        let body: Vec<Vec<String>> = rows.collect();
        if body.is_empty() {
            return Err(ExtractError::parse(CSV_EMPTY, "header row only, no data"));
        }

        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        let mut ragged = 0usize;
        let mut nulls = 0usize;
        let mut column_types: Vec<BTreeMap<&'static str, usize>> = vec![BTreeMap::new(); header.len()];
        let mut records = Vec::with_capacity(body.len());

        for raw in &body {
            if raw.len() != header.len() {
                ragged += 1;
            }
            if !seen.insert(raw.clone()) {
                duplicates += 1;
            }
            let mut obj = Map::new();
            for (i, col) in header.iter().enumerate() {
                let v = raw.get(i).map_or(Value::Null, |f| infer(f));
                if v.is_null() {
                    nulls += 1;
                } else {
                    *column_types[i].entry(type_label(&v)).or_default() += 1;
                }
                obj.insert(col.clone(), v);
            }
            records.push(Value::Object(obj));
        }

        let cells = body.len() * header.len();
        let null_rate = if cells == 0 { 0.0 } else { nulls as f64 / cells as f64 };
        let types: BTreeMap<String, MetaValue> = header
            .iter()
            .zip(&column_types)
            .map(|(col, counts)| {
                let label = match counts.len() {
                    0 => "null",
                    1 => counts.keys().next().copied().unwrap_or("null"),
                    _ if counts.keys().all(|k| *k == "integer" || *k == "float") => "float",
                    _ => "mixed",
                };
                (col.clone(), MetaValue::from(label))
            })
            .collect();

        result.set_meta("row_count", body.len());
        result.set_meta("column_count", header.len());
        result.set_meta("columns", header.clone());
        result.set_meta("column_types", MetaValue::Map(types));
        result.set_meta("null_rate", null_rate);
        result.set_meta("duplicate_rows", duplicates);

        if null_rate > self.null_rate_warning {
            result.add_message(
                ValidationMessage::warning(
                    "CSV_HIGH_NULL_RATE",
                    format!("{:.1}% of cells are empty", null_rate * 100.0),
                )
                .with_validator(self.name())
                .with_detail("null_rate", null_rate),
            );
        }
        if duplicates > 0 {
            result.add_message(
                ValidationMessage::warning("CSV_DUPLICATE_ROWS", format!("{duplicates} duplicate row(s)"))
                    .with_validator(self.name())
                    .with_detail("duplicate_rows", duplicates),
            );
        }
        if ragged > 0 {
            result.add_message(
                ValidationMessage::warning(
                    "CSV_COLUMN_MISMATCH",
                    format!("{ragged} row(s) do not have {} fields", header.len()),
                )
                .with_validator(self.name()),
            );
        }

        debug!(source = %source.name, rows = body.len(), columns = header.len(), "csv extracted");
        result.set_data(Value::Array(records));
        Ok(())
    }
}
