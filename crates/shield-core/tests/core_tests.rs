use async_trait::async_trait;
use serde_json::{json, Value};
use shield_core::{
    Check, CheckError, MetaValue, Provenance, ResultId, Severity, Status, ValidationMessage, ValidationResult,
};

struct RequiresName;

#[async_trait]
impl Check for RequiresName {
    fn name(&self) -> &str {
        "requires_name"
    }

    async fn validate(&self, data: &Value, result: &mut ValidationResult) -> Result<(), CheckError> {
        if data.get("name").is_none() {
            result.add_message(
                ValidationMessage::error("MISSING_NAME", "name is required")
                    .with_field("name")
                    .with_validator(self.name()),
            );
        }
        Ok(())
    }
}

#[test]
fn test_result_id_new() {
    let a = ResultId::new();
    let b = ResultId::new();
    assert_ne!(a, b);
}

#[test]
fn test_new_result_starts_passed() {
    let r = ValidationResult::new();
    assert_eq!(r.status(), Status::Passed);
    assert!(r.passed());
    assert!(r.messages().is_empty());
    assert!(r.completed_at().is_none());
}

#[tokio::test]
async fn test_check_contract_mutates_result() {
    let data = json!({"id": 1});
    let mut r = ValidationResult::for_data(data.clone());
    RequiresName.validate(&data, &mut r).await.unwrap();
    assert_eq!(r.status(), Status::Failed);
    let err = r.errors().next().unwrap();
    assert_eq!(err.field.as_deref(), Some("name"));
    assert_eq!(err.severity, Severity::Error);
}

#[test]
fn test_result_serializes_with_lowercase_status() {
    let mut r = ValidationResult::for_data(json!({"a": 1})).with_provenance(Provenance::inline("rec-1"));
    r.set_meta("rows", 3);
    r.complete();
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["status"], "passed");
    assert_eq!(v["provenance"]["source_id"], "rec-1");
    assert_eq!(v["metadata"]["rows"], 3);

    let back: ValidationResult = serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
    assert_eq!(back, r);
    assert_eq!(back.meta("rows"), Some(&MetaValue::Int(3)));
}
