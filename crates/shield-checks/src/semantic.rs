use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use shield_core::{sha256_hex, Check, CheckError, ValidationMessage, ValidationResult};

const SYSTEM_PROMPT: &str = "You are a data validation assistant. Evaluate the data against the criteria \
and reply with JSON only, shaped as {\"valid\": bool, \"confidence\": number between 0 and 1, \
\"issues\": [{\"criterion\": string, \"passed\": bool, \"message\": string}], \"summary\": string}.";

const MAX_DATA_CHARS: usize = 10_000;

/// Something that can answer a prompt, usually a hosted language model.
///
/// Provider, model and credentials belong to the implementation.
#[async_trait]
pub trait SemanticScorer: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, CheckError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CriterionOutcome {
    pub criterion: String,
    pub passed: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub valid: bool,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<CriterionOutcome>,
    #[serde(default)]
    pub summary: Option<String>,
}

fn full_confidence() -> f64 {
    1.0
}

/// Pulls the JSON object out of a reply that may be wrapped in prose or code fences.
pub fn parse_verdict(reply: &str) -> Result<Verdict, serde_json::Error> {
    let body = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if end > start => &reply[start..=end],
        _ => reply,
    };
    serde_json::from_str(body)
}

/// Asks a [`SemanticScorer`] whether the data meets free-text criteria.
pub struct SemanticCheck {
    scorer: Arc<dyn SemanticScorer>,
    prompt: String,
    criteria: Vec<String>,
    cache: Option<Mutex<HashMap<String, Verdict>>>,
}

impl SemanticCheck {
    pub fn new(scorer: Arc<dyn SemanticScorer>, prompt: impl Into<String>) -> Self {
        Self { scorer, prompt: prompt.into(), criteria: vec![], cache: Some(Mutex::new(HashMap::new())) }
    }

    pub fn with_criteria<S: Into<String>>(mut self, criteria: impl IntoIterator<Item = S>) -> Self {
        self.criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    fn user_prompt(&self, data: &str) -> String {
        let mut out = format!("Task: {}\n", self.prompt);
        if !self.criteria.is_empty() {
            out.push_str("\nCriteria:\n");
            for c in &self.criteria {
                out.push_str(&format!("- {c}\n"));
            }
        }
        out.push_str("\nData:\n");
        out.push_str(data);
        out
    }

    fn cache_key(&self, data: &str) -> String {
        let raw = format!("{}:{}:{}", self.prompt, self.criteria.join("|"), data);
        sha256_hex(raw.as_bytes())[..16].to_string()
    }

    fn cached(&self, key: &str) -> Option<Verdict> {
        self.cache.as_ref()?.lock().ok()?.get(key).cloned()
    }

    fn remember(&self, key: String, verdict: &Verdict) {
        if let Some(Ok(mut cache)) = self.cache.as_ref().map(|c| c.lock()) {
            cache.insert(key, verdict.clone());
        }
    }

    fn apply(&self, verdict: &Verdict, result: &mut ValidationResult) {
        for issue in verdict.issues.iter().filter(|i| !i.passed) {
            let text = if issue.message.is_empty() {
                format!("criterion not met: {}", issue.criterion)
            } else {
                issue.message.clone()
            };
            let msg = if verdict.confidence > 0.5 {
                ValidationMessage::warning("SEMANTIC_CRITERION_FAILED", text)
            } else {
                ValidationMessage::error("SEMANTIC_CRITERION_FAILED", text)
            };
            result.add_message(msg.with_validator(self.name()).with_field(issue.criterion.as_str()));
        }

        if !verdict.valid {
            let text = verdict
                .summary
                .clone()
                .unwrap_or_else(|| "data does not meet the semantic criteria".to_string());
            let msg = if verdict.confidence < 0.5 {
                ValidationMessage::error("SEMANTIC_INVALID", text)
            } else {
                ValidationMessage::warning("SEMANTIC_INVALID", text)
            };
            result.add_message(msg.with_validator(self.name()).with_detail("confidence", verdict.confidence));
        }

        result.set_meta("semantic_confidence", verdict.confidence);
        if let Some(summary) = &verdict.summary {
            result.set_meta("semantic_summary", summary.as_str());
        }
    }
}

impl std::fmt::Debug for SemanticCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticCheck")
            .field("prompt", &self.prompt)
            .field("criteria", &self.criteria)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

#[async_trait]
impl Check for SemanticCheck {
    fn name(&self) -> &str {
        "semantic"
    }

    async fn validate(&self, data: &Value, result: &mut ValidationResult) -> Result<(), CheckError> {
        let rendered = match data {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).map_err(|e| CheckError::InvalidInput(e.to_string()))?,
        };
        let rendered: String = rendered.chars().take(MAX_DATA_CHARS).collect();
        let key = self.cache_key(&rendered);

        if let Some(verdict) = self.cached(&key) {
            debug!(key = %key, "semantic verdict served from cache");
            result.set_meta("semantic_cached", true);
            self.apply(&verdict, result);
            return Ok(());
        }

        let reply = match self.scorer.complete(SYSTEM_PROMPT, &self.user_prompt(&rendered)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "semantic scorer failed");
                result.record_fault(self.name(), "SEMANTIC_SCORER_ERROR", e.to_string());
                return Ok(());
            }
        };
        let verdict = match parse_verdict(&reply) {
            Ok(v) => v,
            Err(e) => {
                result.record_fault(self.name(), "SEMANTIC_PARSE_ERROR", format!("unreadable scorer reply: {e}"));
                return Ok(());
            }
        };

        self.remember(key, &verdict);
        self.apply(&verdict, result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shield_core::{MetaValue, Status};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Canned {
        reply: Result<String, String>,
        calls: AtomicUsize,
    }

    impl Canned {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self { reply: Ok(reply.to_string()), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl SemanticScorer for Canned {
        async fn complete(&self, system: &str, user: &str) -> Result<String, CheckError> {
            assert!(system.contains("JSON"));
            assert!(user.contains("Data:"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(CheckError::Upstream)
        }
    }

    #[test]
    fn parses_fenced_reply() {
        let v = parse_verdict("```json\n{\"valid\": true}\n```").unwrap();
        assert!(v.valid);
        assert_eq!(v.confidence, 1.0);
        assert!(parse_verdict("no idea").is_err());
    }

    #[tokio::test]
    async fn confident_failure_is_a_warning() {
        let scorer = Canned::ok(
            r#"{"valid": true, "confidence": 0.9, "issues": [{"criterion": "tone", "passed": false, "message": "too curt"}], "summary": "mostly fine"}"#,
        );
        let check = SemanticCheck::new(scorer, "Is this a polite reply?").with_criteria(["tone"]);
        let mut r = ValidationResult::new();
        check.validate(&json!("ok."), &mut r).await.unwrap();
        assert_eq!(r.status(), Status::Warning);
        assert_eq!(r.messages()[0].field.as_deref(), Some("tone"));
        assert_eq!(r.meta("semantic_summary"), Some(&MetaValue::from("mostly fine")));
    }

    #[tokio::test]
    async fn unsure_invalid_verdict_fails() {
        let scorer = Canned::ok(r#"{"valid": false, "confidence": 0.3, "issues": []}"#);
        let check = SemanticCheck::new(scorer, "Is this an address?");
        let mut r = ValidationResult::new();
        check.validate(&json!({"line1": "??"}), &mut r).await.unwrap();
        assert_eq!(r.status(), Status::Failed);
        assert_eq!(r.messages()[0].code, "SEMANTIC_INVALID");
    }

    #[tokio::test]
    async fn repeated_input_hits_cache() {
        let scorer = Canned::ok(r#"{"valid": true, "confidence": 0.8}"#);
        let check = SemanticCheck::new(scorer.clone(), "check");
        for _ in 0..3 {
            let mut r = ValidationResult::new();
            check.validate(&json!({"a": 1}), &mut r).await.unwrap();
            assert_eq!(r.status(), Status::Passed);
        }
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);

        let uncached = SemanticCheck::new(scorer.clone(), "check").without_cache();
        let mut r = ValidationResult::new();
        uncached.validate(&json!({"a": 1}), &mut r).await.unwrap();
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scorer_failures_are_faults() {
        let scorer = Arc::new(Canned { reply: Err("rate limited".into()), calls: AtomicUsize::new(0) });
        let mut r = ValidationResult::new();
        SemanticCheck::new(scorer, "check").validate(&json!(1), &mut r).await.unwrap();
        assert_eq!(r.status(), Status::Error);
        assert_eq!(r.messages()[0].code, "SEMANTIC_SCORER_ERROR");

        let garbled = Canned::ok("I think it's fine");
        let mut r = ValidationResult::new();
        SemanticCheck::new(garbled, "check").validate(&json!(1), &mut r).await.unwrap();
        assert_eq!(r.messages()[0].code, "SEMANTIC_PARSE_ERROR");
    }
}
