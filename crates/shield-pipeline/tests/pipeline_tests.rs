use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use shield_core::{
    Check, CheckError, ExtractError, Extractor, Severity, Source, Status, ValidationMessage, ValidationResult,
};
use shield_pipeline::{
    CancelToken, Pipeline, PipelineConfig, PipelineError, RunControl, SourceRef, UnknownExtension,
};

/// Adds one message of the given severity (or none).
struct Emit {
    name: &'static str,
    severity: Option<Severity>,
}

#[async_trait]
impl Check for Emit {
    fn name(&self) -> &str {
        self.name
    }

    async fn validate(&self, _data: &Value, result: &mut ValidationResult) -> Result<(), CheckError> {
        if let Some(sev) = self.severity {
            result.add_message(ValidationMessage::new(sev, "EMIT", self.name).with_validator(self.name));
        }
        Ok(())
    }
}

fn pass(name: &'static str) -> Emit {
    Emit { name, severity: None }
}

fn warn(name: &'static str) -> Emit {
    Emit { name, severity: Some(Severity::Warning) }
}

fn fail(name: &'static str) -> Emit {
    Emit { name, severity: Some(Severity::Error) }
}

struct Panics;

#[async_trait]
impl Check for Panics {
    fn name(&self) -> &str {
        "panics"
    }

    async fn validate(&self, _data: &Value, _result: &mut ValidationResult) -> Result<(), CheckError> {
        panic!("check blew up");
    }
}

struct Errs;

#[async_trait]
impl Check for Errs {
    fn name(&self) -> &str {
        "errs"
    }

    async fn validate(&self, _data: &Value, _result: &mut ValidationResult) -> Result<(), CheckError> {
        Err(CheckError::InvalidInput("not an object".into()))
    }
}

struct Sleeps(Duration);

#[async_trait]
impl Check for Sleeps {
    fn name(&self) -> &str {
        "sleeps"
    }

    async fn validate(&self, _data: &Value, _result: &mut ValidationResult) -> Result<(), CheckError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Holds the executor thread instead of awaiting.
struct Blocks(Duration);

#[async_trait]
impl Check for Blocks {
    fn name(&self) -> &str {
        "blocks"
    }

    async fn validate(&self, _data: &Value, _result: &mut ValidationResult) -> Result<(), CheckError> {
        std::thread::sleep(self.0);
        Ok(())
    }
}

/// Warns when an earlier check already failed the result.
struct ReactsToFailure;

#[async_trait]
impl Check for ReactsToFailure {
    fn name(&self) -> &str {
        "reacts"
    }

    async fn validate(&self, _data: &Value, result: &mut ValidationResult) -> Result<(), CheckError> {
        if result.failed() {
            result.add_message(ValidationMessage::warning("UPSTREAM_FAILED", "earlier check failed"));
        }
        Ok(())
    }
}

struct OnlyObjects;

#[async_trait]
impl Check for OnlyObjects {
    fn name(&self) -> &str {
        "only_objects"
    }

    fn should_run(&self, data: &Value, _result: &ValidationResult) -> bool {
        data.is_object()
    }

    async fn validate(&self, _data: &Value, _result: &mut ValidationResult) -> Result<(), CheckError> {
        Ok(())
    }
}

/// Wraps text content as `{"text": ...}`; fails on empty input.
struct TextExtractor;

impl Extractor for TextExtractor {
    fn name(&self) -> &str {
        "text"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &[".txt"]
    }

    fn process(&self, source: &Source, result: &mut ValidationResult) -> Result<(), ExtractError> {
        let text = source.text()?;
        if text.is_empty() {
            return Err(ExtractError::parse("TEXT_EMPTY", "empty document"));
        }
        result.set_data(json!({ "text": text }));
        Ok(())
    }
}

/// Extractor that blocks for the given time before producing content.
struct SlowExtractor(Duration);

impl Extractor for SlowExtractor {
    fn name(&self) -> &str {
        "slow"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &[".slow"]
    }

    fn process(&self, _source: &Source, result: &mut ValidationResult) -> Result<(), ExtractError> {
        std::thread::sleep(self.0);
        result.set_data(json!({"done": true}));
        Ok(())
    }
}

fn fail_fast() -> PipelineConfig {
    PipelineConfig { fail_fast: true, ..Default::default() }
}

#[tokio::test]
async fn fail_fast_stops_after_first_failure() {
    let p = Pipeline::new(fail_fast()).with_check(fail("a")).with_check(pass("b")).with_check(pass("c"));
    let r = p.validate(json!({}), None).await.unwrap();
    assert_eq!(r.validators_run(), ["a"]);
    assert!(r.status() >= Status::Failed);
    assert_eq!(r.messages().len(), 1);
}

#[tokio::test]
async fn default_mode_runs_every_check() {
    let p = Pipeline::default().with_check(fail("a")).with_check(pass("b")).with_check(pass("c"));
    let r = p.validate(json!({}), None).await.unwrap();
    assert_eq!(r.validators_run(), ["a", "b", "c"]);
    assert_eq!(r.status(), Status::Failed);
}

#[tokio::test]
async fn status_is_worst_contributed() {
    let p = Pipeline::default()
        .with_check(warn("w"))
        .with_check(fail("f"))
        .with_check(pass("p"))
        .with_check(warn("w2"));
    let r = p.validate(json!({"x": 1}), None).await.unwrap();
    assert_eq!(r.status(), Status::Failed);
    let codes: Vec<_> = r.messages().iter().map(|m| m.message.as_str()).collect();
    assert_eq!(codes, vec!["w", "f", "w2"]);
    assert!(r.completed_at().is_some());
    assert!(r.is_sealed());
}

#[tokio::test]
async fn panicking_check_becomes_error_and_run_continues() {
    let p = Pipeline::default().with_check(Panics).with_check(pass("after"));
    let r = p.validate(json!({}), None).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert_eq!(r.validators_run(), ["after"]);
    let m = &r.messages()[0];
    assert_eq!(m.code, "PIPELINE_ERROR");
    assert_eq!(m.validator.as_deref(), Some("panics"));
    assert!(m.message.contains("check blew up"));
}

#[tokio::test]
async fn check_error_is_recorded_and_stops_under_fail_fast() {
    let p = Pipeline::new(fail_fast()).with_check(Errs).with_check(pass("never"));
    let r = p.validate(json!(1), None).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert!(r.validators_run().is_empty());
    assert!(r.messages()[0].message.contains("not an object"));
}

#[tokio::test]
async fn passing_check_never_lowers_failed() {
    let p = Pipeline::default().with_check(fail("f")).with_check(pass("p"));
    let r = p.validate(json!({}), None).await.unwrap();
    assert_eq!(r.status(), Status::Failed);
}

#[tokio::test]
async fn later_check_sees_earlier_failure() {
    let p = Pipeline::default().with_check(fail("f")).with_check(ReactsToFailure);
    let r = p.validate(json!({}), None).await.unwrap();
    assert!(r.messages().iter().any(|m| m.code == "UPSTREAM_FAILED"));
    assert_eq!(r.status(), Status::Failed);
}

#[tokio::test]
async fn opted_out_check_is_not_recorded() {
    let p = Pipeline::default().with_check(OnlyObjects).with_check(pass("p"));
    let r = p.validate(json!([1, 2]), None).await.unwrap();
    assert_eq!(r.validators_run(), ["p"]);
}

#[tokio::test]
async fn per_check_timeout_converts_hang_to_error() {
    let cfg = PipelineConfig { check_timeout_ms: Some(10), ..Default::default() };
    let p = Pipeline::new(cfg).with_check(Sleeps(Duration::from_secs(5))).with_check(pass("after"));
    let r = p.validate(json!({}), None).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert_eq!(r.messages()[0].code, "CHECK_TIMEOUT");
    assert_eq!(r.validators_run(), ["after"]);
}

#[tokio::test]
async fn blocking_check_past_its_timeout_is_still_flagged() {
    let cfg = PipelineConfig { check_timeout_ms: Some(10), ..Default::default() };
    let p = Pipeline::new(cfg).with_check(Blocks(Duration::from_millis(60))).with_check(pass("after"));
    let r = p.validate(json!({}), None).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert_eq!(r.messages()[0].code, "CHECK_TIMEOUT");
    assert_eq!(r.messages()[0].validator.as_deref(), Some("blocks"));
    assert_eq!(r.validators_run(), ["after"]);
}

#[tokio::test]
async fn blocking_check_within_its_timeout_passes() {
    let cfg = PipelineConfig { check_timeout_ms: Some(2_000), ..Default::default() };
    let p = Pipeline::new(cfg).with_check(Blocks(Duration::from_millis(5)));
    let r = p.validate(json!({}), None).await.unwrap();
    assert_eq!(r.status(), Status::Passed);
    assert_eq!(r.validators_run(), ["blocks"]);
}

#[tokio::test]
async fn deadline_cuts_slow_extraction_short() {
    let p = Pipeline::default().with_extractor(SlowExtractor(Duration::from_millis(500))).with_check(pass("a"));
    let src = SourceRef::Named { name: "big.slow".into(), bytes: b"x".to_vec() };
    let started = std::time::Instant::now();
    let r = p.validate_with(Value::Null, Some(src), &RunControl::with_deadline(Duration::from_millis(20))).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(r.status(), Status::Error);
    assert_eq!(r.messages().len(), 1);
    assert_eq!(r.messages()[0].code, "PIPELINE_TIMEOUT");
    assert!(r.validators_run().is_empty());
}

#[tokio::test]
async fn cancel_during_extraction_is_recorded() {
    let p = Pipeline::default().with_extractor(SlowExtractor(Duration::from_millis(500))).with_check(pass("a"));
    let token = CancelToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let src = SourceRef::Named { name: "big.slow".into(), bytes: b"x".to_vec() };
    let r = p.validate_with(Value::Null, Some(src), &RunControl::with_cancel(token)).await.unwrap();
    assert_eq!(r.messages()[0].code, "PIPELINE_CANCELLED");
    assert!(r.validators_run().is_empty());
}

#[tokio::test]
async fn quick_extraction_runs_off_the_executor() {
    let p = Pipeline::default().with_extractor(SlowExtractor(Duration::from_millis(5))).with_check(pass("a"));
    let src = SourceRef::Named { name: "small.slow".into(), bytes: b"x".to_vec() };
    let r = p.validate_with(Value::Null, Some(src), &RunControl::with_deadline(Duration::from_secs(5))).await.unwrap();
    assert_eq!(r.status(), Status::Passed);
    assert_eq!(r.data(), Some(&json!({"done": true})));
    assert_eq!(r.provenance().unwrap().processor_chain, vec!["slow".to_string()]);
}

#[tokio::test]
async fn deadline_halts_before_stalled_check_finishes() {
    let cfg = PipelineConfig { check_timeout_ms: Some(10), ..Default::default() };
    let p = Pipeline::new(cfg).with_check(Sleeps(Duration::from_millis(50))).with_check(pass("after"));
    let ctl = RunControl::with_deadline(Duration::from_millis(5));
    let r = p.validate_with(json!({}), None, &ctl).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert!(r.validators_run().is_empty());
    assert_eq!(r.messages().len(), 1);
    assert_eq!(r.messages()[0].code, "PIPELINE_TIMEOUT");
    assert!(r.is_sealed());
}

#[tokio::test]
async fn cancellation_mid_run_is_recorded() {
    let p = Pipeline::default()
        .with_check(pass("first"))
        .with_check(Sleeps(Duration::from_secs(30)))
        .with_check(pass("never"));
    let token = CancelToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let r = p.validate_with(json!({}), None, &RunControl::with_cancel(token)).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert_eq!(r.validators_run(), ["first"]);
    let last = r.messages().last().unwrap();
    assert_eq!(last.code, "PIPELINE_CANCELLED");
    assert_eq!(last.validator.as_deref(), Some("pipeline"));
}

#[tokio::test]
async fn pre_cancelled_run_executes_nothing() {
    let p = Pipeline::default().with_check(pass("a"));
    let token = CancelToken::new();
    token.cancel();
    let r = p.validate_with(json!({}), None, &RunControl::with_cancel(token)).await.unwrap();
    assert!(r.validators_run().is_empty());
    assert_eq!(r.status(), Status::Error);
}

#[tokio::test]
async fn unknown_extension_yields_error_result() {
    let p = Pipeline::default().with_check(pass("a"));
    let src = SourceRef::Named { name: "scan.pdf".into(), bytes: b"%PDF".to_vec() };
    let r = p.validate(Value::Null, Some(src)).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert_eq!(r.messages().len(), 1);
    assert_eq!(r.messages()[0].code, "NO_EXTRACTOR");
    assert!(r.validators_run().is_empty());
    assert_eq!(r.source_id(), Some("scan.pdf"));
}

#[tokio::test]
async fn unknown_extension_can_be_rejected() {
    let cfg = PipelineConfig { unknown_extension: UnknownExtension::Reject, ..Default::default() };
    let p = Pipeline::new(cfg);
    let src = SourceRef::Named { name: "scan.pdf".into(), bytes: vec![] };
    let err = p.validate(Value::Null, Some(src)).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoExtractor { ref extension, .. } if extension == ".pdf"));
}

#[tokio::test]
async fn extraction_fault_skips_checks() {
    let p = Pipeline::default().with_extractor(TextExtractor).with_check(pass("a"));
    let src = SourceRef::Named { name: "empty.TXT".into(), bytes: vec![] };
    let r = p.validate(Value::Null, Some(src)).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert_eq!(r.messages()[0].code, "TEXT_EMPTY");
    assert_eq!(r.messages()[0].validator.as_deref(), Some("text"));
    assert!(r.validators_run().is_empty());
}

#[tokio::test]
async fn validate_file_extracts_and_records_provenance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt");
    std::fs::write(&path, "hello").unwrap();

    let p = Pipeline::default().with_extractor(TextExtractor).with_check(pass("a"));
    let r = p.validate_file(&path).await.unwrap();
    assert_eq!(r.status(), Status::Passed);
    assert_eq!(r.data(), Some(&json!({"text": "hello"})));
    assert_eq!(r.original_data(), Some(&json!({"text": "hello"})));
    let prov = r.provenance().unwrap();
    assert_eq!(prov.source_id, path.display().to_string());
    assert_eq!(prov.processor_chain, vec!["text".to_string()]);
    assert_eq!(prov.checksum.as_ref().map(|c| c.len()), Some(64));
}

#[tokio::test]
async fn missing_file_is_an_error_result() {
    let dir = tempfile::tempdir().unwrap();
    let p = Pipeline::default().with_extractor(TextExtractor);
    let r = p.validate_file(dir.path().join("nope.txt")).await.unwrap();
    assert_eq!(r.status(), Status::Error);
    assert_eq!(r.messages()[0].code, "FILE_NOT_FOUND");
}

#[tokio::test]
async fn inline_source_sets_provenance_only() {
    let cfg = PipelineConfig { include_original_data: false, ..Default::default() };
    let p = Pipeline::new(cfg).with_check(pass("a"));
    let r = p.validate(json!({"k": 1}), Some(SourceRef::Id("rec-9".into()))).await.unwrap();
    assert_eq!(r.source_id(), Some("rec-9"));
    assert_eq!(r.provenance().unwrap().origin_type.as_deref(), Some("inline"));
    assert!(r.original_data().is_none());
}

#[tokio::test]
async fn shared_pipeline_serves_concurrent_callers() {
    let p = Arc::new(Pipeline::default().with_check(warn("w")).with_check(pass("p")));
    let mut handles = vec![];
    for i in 0..16 {
        let p = p.clone();
        handles.push(tokio::spawn(async move { p.validate(json!({ "i": i }), None).await }));
    }
    for h in handles {
        let r = h.await.unwrap().unwrap();
        assert_eq!(r.status(), Status::Warning);
        assert_eq!(r.validators_run(), ["w", "p"]);
    }
}
