//! Regulatory content scanning.
//!
//! A [`ComplianceCheck`] flattens every string in the data into
//! `(field path, text)` pairs and hands them to each configured
//! [`ComplianceRule`]. Rules report [`Violation`]s; the check turns them into
//! `COMPLIANCE_*` messages.

mod gdpr;
mod hipaa;
mod pii;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use shield_core::{Check, CheckError, MetaValue, Severity, ValidationMessage, ValidationResult};

pub use gdpr::GdprRules;
pub use hipaa::HipaaRules;
pub use pii::{PiiDetector, PiiPattern};

/// Rule pack names accepted by [`rule_by_name`].
pub const RULE_PACKS: [&str; 3] = ["pii", "hipaa", "gdpr"];

const MATCHED_VALUE_LIMIT: usize = 50;

/// One finding reported by a rule.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub category: String,
    pub field: Option<String>,
    /// Redacted form of the matched text.
    pub matched_value: Option<String>,
    pub recommendation: Option<String>,
}

impl Violation {
    pub fn new(code: impl Into<String>, message: impl Into<String>, severity: Severity, category: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            category: category.into(),
            field: None,
            matched_value: None,
            recommendation: None,
        }
    }

    /// Empty paths (a bare string at the root) carry no field.
    pub fn at(mut self, field: &str) -> Self {
        self.field = (!field.is_empty()).then(|| field.to_string());
        self
    }

    pub fn matched(mut self, redacted: impl Into<String>) -> Self {
        self.matched_value = Some(redacted.into());
        self
    }

    pub fn recommend(mut self, text: impl Into<String>) -> Self {
        self.recommendation = Some(text.into());
        self
    }
}

/// A pack of related content rules.
pub trait ComplianceRule: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// `text` holds every string in `data` with its field path.
    fn check(&self, data: &Value, text: &[(String, String)]) -> Vec<Violation>;
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown rule pack {0:?}; available: pii, hipaa, gdpr")]
pub struct UnknownRulePack(pub String);

/// Builds a rule pack with default options. Names are case-insensitive.
pub fn rule_by_name(name: &str) -> Result<Box<dyn ComplianceRule>, UnknownRulePack> {
    match name.to_ascii_lowercase().as_str() {
        "pii" => Ok(Box::new(PiiDetector::new())),
        "hipaa" => Ok(Box::new(HipaaRules::new())),
        "gdpr" => Ok(Box::new(GdprRules::new())),
        _ => Err(UnknownRulePack(name.to_string())),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Report warning-level violations as errors.
    pub fail_on_warning: bool,
    pub max_depth: usize,
    /// When false only top-level strings are scanned.
    pub scan_nested: bool,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self { fail_on_warning: false, max_depth: 10, scan_nested: true }
    }
}

pub struct ComplianceCheck {
    rules: Vec<Box<dyn ComplianceRule>>,
    config: ComplianceConfig,
}

impl ComplianceCheck {
    pub fn new() -> Self {
        Self { rules: vec![], config: ComplianceConfig::default() }
    }

    /// Loads each named pack; fails on the first unknown name.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownRulePack> {
        let mut check = Self::new();
        for n in names {
            check.rules.push(rule_by_name(n.as_ref())?);
        }
        Ok(check)
    }

    pub fn with_rule(mut self, rule: impl ComplianceRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn with_config(mut self, config: ComplianceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    fn to_message(&self, rule: &str, v: Violation) -> ValidationMessage {
        let severity = match v.severity {
            Severity::Warning if self.config.fail_on_warning => Severity::Error,
            s => s,
        };
        let mut msg = ValidationMessage::new(severity, format!("COMPLIANCE_{}", v.code), v.message)
            .with_validator(self.name())
            .with_detail("rule", rule)
            .with_detail("category", v.category);
        if let Some(field) = v.field {
            msg = msg.with_field(field);
        }
        if let Some(m) = v.matched_value {
            msg = msg.with_detail("matched_value", m.chars().take(MATCHED_VALUE_LIMIT).collect::<String>());
        }
        if let Some(r) = v.recommendation {
            msg = msg.with_detail("recommendation", r);
        }
        msg
    }
}

impl Default for ComplianceCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ComplianceCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceCheck")
            .field("rules", &self.rule_names())
            .field("config", &self.config)
            .finish()
    }
}

/// Every string in `data` paired with its path (`key.sub`, `items[0].name`).
/// Strings deeper than `max_depth` containers are not visited.
pub fn collect_text(data: &Value, max_depth: usize) -> Vec<(String, String)> {
    let mut out = vec![];
    walk(data, String::new(), 0, max_depth, &mut out);
    out
}

fn walk(v: &Value, path: String, depth: usize, max_depth: usize, out: &mut Vec<(String, String)>) {
    match v {
        Value::String(s) => out.push((path, s.clone())),
        Value::Object(map) if depth < max_depth => {
            for (k, child) in map {
                let p = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                walk(child, p, depth + 1, max_depth, out);
            }
        }
        Value::Array(items) if depth < max_depth => {
            for (i, child) in items.iter().enumerate() {
                walk(child, format!("{path}[{i}]"), depth + 1, max_depth, out);
            }
        }
        _ => {}
    }
}

#[async_trait]
impl Check for ComplianceCheck {
    fn name(&self) -> &str {
        "compliance"
    }

    async fn validate(&self, data: &Value, result: &mut ValidationResult) -> Result<(), CheckError> {
        if self.rules.is_empty() {
            result.add_message(
                ValidationMessage::warning("COMPLIANCE_NO_RULES", "no compliance rules configured")
                    .with_validator(self.name()),
            );
            return Ok(());
        }

        let depth = if self.config.scan_nested { self.config.max_depth } else { 1 };
        let text = collect_text(data, depth);

        let mut errors = 0usize;
        let mut warnings = 0usize;
        for rule in &self.rules {
            let violations = rule.check(data, &text);
            debug!(rule = rule.name(), count = violations.len(), "compliance rule evaluated");
            for v in violations {
                match v.severity {
                    Severity::Error => errors += 1,
                    Severity::Warning => warnings += 1,
                    Severity::Info => {}
                }
                result.add_message(self.to_message(rule.name(), v));
            }
        }

        let names: Vec<MetaValue> = self.rules.iter().map(|r| r.name().into()).collect();
        result.set_meta("compliance_rules_run", MetaValue::List(names));
        result.set_meta("compliance_violations", errors);
        result.set_meta("compliance_warnings", warnings);
        Ok(())
    }
}

/// Masks all but the first `keep_head` and last `keep_tail` characters.
/// Values of four characters or fewer are fully masked.
pub(crate) fn mask(value: &str, keep_head: usize, keep_tail: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 || keep_head + keep_tail >= chars.len() {
        return "*".repeat(chars.len());
    }
    let mut out: String = chars[..keep_head].iter().collect();
    out.push_str(&"*".repeat(chars.len() - keep_head - keep_tail));
    out.extend(&chars[chars.len() - keep_tail..]);
    out
}
