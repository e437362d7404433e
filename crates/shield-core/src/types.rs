use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome of a validation run.
///
/// Variants are declared in rank order so the derived `Ord` matches
/// escalation: `Skipped < Passed < Warning < Failed < Error`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Skipped,
    Passed,
    Warning,
    Failed,
    Error,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Passed,
        Status::Warning,
        Status::Failed,
        Status::Error,
        Status::Skipped,
    ];

    pub fn rank(self) -> u8 {
        match self {
            Status::Skipped => 0,
            Status::Passed => 1,
            Status::Warning => 2,
            Status::Failed => 3,
            Status::Error => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Skipped => "skipped",
            Status::Passed => "passed",
            Status::Warning => "warning",
            Status::Failed => "failed",
            Status::Error => "error",
        }
    }

    pub fn is_passing(self) -> bool {
        matches!(self, Status::Passed | Status::Warning)
    }

    pub fn is_failing(self) -> bool {
        matches!(self, Status::Failed | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.as_str().to_ascii_uppercase())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skipped" => Ok(Status::Skipped),
            "passed" => Ok(Status::Passed),
            "warning" => Ok(Status::Warning),
            "failed" => Ok(Status::Failed),
            "error" => Ok(Status::Error),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Status a message of this severity escalates its result to.
    pub fn implied_status(self) -> Option<Status> {
        match self {
            Severity::Error => Some(Status::Failed),
            Severity::Warning => Some(Status::Warning),
            Severity::Info => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.as_str().to_ascii_uppercase())
    }
}

/// Metadata value. Closed on purpose so audit serialization stays deterministic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

pub type Metadata = BTreeMap<String, MetaValue>;

impl MetaValue {
    /// Converts a JSON value; `null` has no representation and yields `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(MetaValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(MetaValue::Int(i)),
                None => n.as_f64().map(MetaValue::Float),
            },
            Value::String(s) => Some(MetaValue::Str(s.clone())),
            Value::Array(items) => Some(MetaValue::List(items.iter().filter_map(Self::from_json).collect())),
            Value::Object(map) => Some(MetaValue::Map(
                map.iter()
                    .filter_map(|(k, v)| Self::from_json(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Int(i) => Some(*i as f64),
            MetaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// False if a `Float` anywhere inside is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match self {
            MetaValue::Float(f) => f.is_finite(),
            MetaValue::List(items) => items.iter().all(Self::is_finite),
            MetaValue::Map(map) => map.values().all(Self::is_finite),
            _ => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Int(i) => write!(f, "{i}"),
            MetaValue::Float(x) => write!(f, "{x}"),
            MetaValue::Str(s) => f.write_str(s),
            MetaValue::List(_) | MetaValue::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<i32> for MetaValue {
    fn from(v: i32) -> Self {
        MetaValue::Int(v as i64)
    }
}

impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        MetaValue::Int(v as i64)
    }
}

/// NaN and the infinities have no JSON form; they are kept as their string spelling.
impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        if v.is_finite() {
            MetaValue::Float(v)
        } else {
            MetaValue::Str(v.to_string())
        }
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}

impl<T: Into<MetaValue>> From<Vec<T>> for MetaValue {
    fn from(v: Vec<T>) -> Self {
        MetaValue::List(v.into_iter().map(Into::into).collect())
    }
}
