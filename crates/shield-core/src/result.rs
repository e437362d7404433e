use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::ids::ResultId;
use crate::message::ValidationMessage;
use crate::provenance::Provenance;
use crate::types::{MetaValue, Metadata, Severity, Status};

/// Accumulated outcome of running checks against one data item.
///
/// Mutable while a pipeline owns it, sealed by [`ValidationResult::complete`].
/// Status only ever escalates; once sealed every mutator is a logged no-op.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    id: ResultId,
    status: Status,
    messages: Vec<ValidationMessage>,
    validators_run: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provenance: Option<Provenance>,
    started_at: DateTime<Utc>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    duration_ms: Option<f64>,
    #[serde(default)]
    metadata: Metadata,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            id: ResultId::new(),
            status: Status::Passed,
            messages: vec![],
            validators_run: vec![],
            data: None,
            original_data: None,
            provenance: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            metadata: Metadata::new(),
        }
    }

    /// Result over `data`, keeping a pristine copy as `original_data`.
    pub fn for_data(data: Value) -> Self {
        let mut r = Self::new();
        r.original_data = Some(data.clone());
        r.data = Some(data);
        r
    }

    /// A result for an item that was deliberately not validated.
    pub fn skipped(reason: impl Into<String>) -> Self {
        let mut r = Self::new();
        r.status = Status::Skipped;
        r.messages.push(ValidationMessage::info("SKIPPED", reason));
        r
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.set_provenance(provenance);
        self
    }

    pub fn id(&self) -> &ResultId {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn messages(&self) -> &[ValidationMessage] {
        &self.messages
    }

    pub fn validators_run(&self) -> &[String] {
        &self.validators_run
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn original_data(&self) -> Option<&Value> {
        self.original_data.as_ref()
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    pub fn source_id(&self) -> Option<&str> {
        self.provenance.as_ref().map(|p| p.source_id.as_str())
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.duration_ms
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    pub fn is_sealed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// True iff status is PASSED or WARNING.
    pub fn passed(&self) -> bool {
        self.status.is_passing()
    }

    /// True iff status is FAILED or ERROR.
    pub fn failed(&self) -> bool {
        self.status.is_failing()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages.iter().filter(|m| m.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages.iter().filter(|m| m.severity == Severity::Warning)
    }

    fn writable(&self, op: &str) -> bool {
        if self.is_sealed() {
            warn!(result_id = %self.id, op, "ignoring mutation of sealed result");
            return false;
        }
        true
    }

    /// Appends a message and escalates status to what its severity implies.
    pub fn add_message(&mut self, message: ValidationMessage) {
        if !self.writable("add_message") {
            return;
        }
        if let Some(s) = message.severity.implied_status() {
            self.raise(s);
        }
        self.messages.push(message);
    }

    /// Raises status to `status` if it is worse than the current one. Never lowers.
    pub fn escalate(&mut self, status: Status) {
        if self.writable("escalate") {
            self.raise(status);
        }
    }

    fn raise(&mut self, status: Status) {
        if status > self.status {
            self.status = status;
        }
    }

    /// Records a fault: an error message tagged with the validator, status forced to ERROR.
    pub fn record_fault(&mut self, validator: &str, code: &str, description: impl Into<String>) {
        if !self.writable("record_fault") {
            return;
        }
        self.messages
            .push(ValidationMessage::error(code, description).with_validator(validator));
        self.raise(Status::Error);
    }

    pub fn set_data(&mut self, data: Value) {
        if self.writable("set_data") {
            self.data = Some(data);
        }
    }

    /// Sets the pristine input. Only the first call has an effect.
    pub fn set_original_data(&mut self, data: Value) {
        if self.writable("set_original_data") && self.original_data.is_none() {
            self.original_data = Some(data);
        }
    }

    /// Attaches provenance. Only the first call has an effect.
    pub fn set_provenance(&mut self, provenance: Provenance) {
        if self.writable("set_provenance") && self.provenance.is_none() {
            self.provenance = Some(provenance);
        }
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        if self.writable("set_meta") {
            self.metadata.insert(key.into(), value.into());
        }
    }

    pub fn mark_run(&mut self, validator: impl Into<String>) {
        if self.writable("mark_run") {
            self.validators_run.push(validator.into());
        }
    }

    /// Seals the result and finalizes timing. Idempotent.
    pub fn complete(&mut self) {
        if self.is_sealed() {
            return;
        }
        let now = Utc::now();
        let elapsed = now - self.started_at;
        let micros = elapsed.num_microseconds().unwrap_or(i64::MAX);
        self.completed_at = Some(now);
        self.duration_ms = Some(micros.max(0) as f64 / 1000.0);
    }

    /// Folds `other` into this result: messages and validators appended in order,
    /// status is the worse of both, metadata is last-write-wins.
    pub fn merge(&mut self, other: ValidationResult) {
        if !self.writable("merge") {
            return;
        }
        self.raise(other.status);
        self.messages.extend(other.messages);
        self.validators_run.extend(other.validators_run);
        if other.data.is_some() {
            self.data = other.data;
        }
        self.metadata.extend(other.metadata);
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidationResult[{}] - {} message(s)", self.status, self.messages.len())?;
        if let Some(ms) = self.duration_ms {
            write!(f, " ({ms:.1}ms)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_escalate_status() {
        let mut r = ValidationResult::new();
        r.add_message(ValidationMessage::info("I", "note"));
        assert_eq!(r.status(), Status::Passed);
        r.add_message(ValidationMessage::warning("W", "hmm"));
        assert_eq!(r.status(), Status::Warning);
        r.add_message(ValidationMessage::error("E", "bad"));
        assert_eq!(r.status(), Status::Failed);
        r.add_message(ValidationMessage::warning("W2", "again"));
        assert_eq!(r.status(), Status::Failed);
        assert!(r.failed());
        assert!(!r.passed());
    }

    #[test]
    fn error_cannot_be_downgraded() {
        let mut r = ValidationResult::new();
        r.record_fault("schema", "PIPELINE_ERROR", "boom");
        r.escalate(Status::Passed);
        r.escalate(Status::Failed);
        assert_eq!(r.status(), Status::Error);
        assert_eq!(r.errors().count(), 1);
    }

    #[test]
    fn original_data_set_once() {
        let mut r = ValidationResult::for_data(json!({"a": 1}));
        r.set_original_data(json!({"b": 2}));
        r.set_data(json!({"c": 3}));
        assert_eq!(r.original_data(), Some(&json!({"a": 1})));
        assert_eq!(r.data(), Some(&json!({"c": 3})));
    }

    #[test]
    fn complete_seals_once() {
        let mut r = ValidationResult::new();
        r.complete();
        let first = r.completed_at();
        assert!(first.is_some());
        assert!(r.duration_ms().unwrap() >= 0.0);
        r.complete();
        assert_eq!(r.completed_at(), first);

        r.add_message(ValidationMessage::error("E", "late"));
        r.mark_run("late");
        assert_eq!(r.status(), Status::Passed);
        assert!(r.messages().is_empty());
        assert!(r.validators_run().is_empty());
    }

    #[test]
    fn merge_takes_worse_status_and_appends() {
        let mut a = ValidationResult::new();
        a.mark_run("a");
        a.set_meta("k", 1);
        let mut b = ValidationResult::new();
        b.mark_run("b");
        b.add_message(ValidationMessage::warning("W", "w"));
        b.set_meta("k", 2);
        a.merge(b);
        assert_eq!(a.status(), Status::Warning);
        assert_eq!(a.validators_run(), ["a".to_string(), "b".to_string()]);
        assert_eq!(a.meta("k"), Some(&MetaValue::Int(2)));
    }

    #[test]
    fn skipped_result_escalates_from_bottom() {
        let mut r = ValidationResult::skipped("disabled");
        assert_eq!(r.status(), Status::Skipped);
        assert!(!r.passed() && !r.failed());
        r.add_message(ValidationMessage::warning("W", "w"));
        assert_eq!(r.status(), Status::Warning);
    }
}
