use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shield_core::{Metadata, ResultId, Severity, Status, ValidationMessage, ValidationResult};

use crate::store::AuditError;

/// Compact copy of a validation message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditMessage {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl From<&ValidationMessage> for AuditMessage {
    fn from(m: &ValidationMessage) -> Self {
        Self { severity: m.severity, code: m.code.clone(), message: m.message.clone(), field: m.field.clone() }
    }
}

/// One line of the audit log. Never edited once written.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: ResultId,
    pub status: Status,
    pub source_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub messages: Vec<AuditMessage>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators_run: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl AuditEntry {
    /// Builds an entry stamped now. `extra` is merged over the result's metadata.
    pub fn from_result(result: &ValidationResult, extra: Option<&Metadata>) -> Self {
        let mut metadata = result.metadata().clone();
        if let Some(extra) = extra {
            metadata.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Self {
            id: result.id().clone(),
            status: result.status(),
            source_id: result.source_id().map(str::to_string),
            timestamp: Utc::now(),
            messages: result.messages().iter().map(AuditMessage::from).collect(),
            metadata,
            validators_run: result.validators_run().to_vec(),
            duration_ms: result.duration_ms(),
        }
    }

    /// Rejects entries JSON cannot carry. serde_json writes NaN and infinities as
    /// `null`, which would make the stored line unreadable.
    pub fn check_encodable(&self) -> Result<(), AuditError> {
        let bad_meta = self.metadata.iter().find(|(_, v)| !v.is_finite()).map(|(k, _)| format!("metadata {k:?}"));
        let bad_duration = self.duration_ms.filter(|d| !d.is_finite()).map(|_| "duration_ms".to_string());
        match bad_meta.or(bad_duration) {
            Some(what) => Err(AuditError::Encode(<serde_json::Error as serde::ser::Error>::custom(format!(
                "{what} is not a finite number"
            )))),
            None => Ok(()),
        }
    }

    pub fn error_count(&self) -> usize {
        self.messages.iter().filter(|m| m.severity == Severity::Error).count()
    }

    pub fn warning_count(&self) -> usize {
        self.messages.iter().filter(|m| m.severity == Severity::Warning).count()
    }
}

/// Filters for [`crate::AuditTrail::query`]. All set filters must match; time bounds are inclusive.
#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub status: Option<Status>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub source_id: Option<String>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn since(mut self, t: DateTime<Utc>) -> Self {
        self.start_time = Some(t);
        self
    }

    pub fn until(mut self, t: DateTime<Utc>) -> Self {
        self.end_time = Some(t);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn matches(&self, e: &AuditEntry) -> bool {
        self.status.map_or(true, |s| e.status == s)
            && self.start_time.map_or(true, |t| e.timestamp >= t)
            && self.end_time.map_or(true, |t| e.timestamp <= t)
            && self.source_id.as_deref().map_or(true, |s| e.source_id.as_deref() == Some(s))
    }
}
