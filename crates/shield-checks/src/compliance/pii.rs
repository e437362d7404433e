use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use shield_core::Severity;

use super::{mask, ComplianceRule, Violation};

/// A named personal-data pattern.
#[derive(Debug)]
pub struct PiiPattern {
    pub name: &'static str,
    pub code: &'static str,
    pub message: &'static str,
    pub category: &'static str,
    pub severity: Severity,
    pub recommendation: &'static str,
    pub regex: Regex,
}

fn pattern(
    name: &'static str,
    re: &str,
    code: &'static str,
    message: &'static str,
    category: &'static str,
    severity: Severity,
    recommendation: &'static str,
) -> PiiPattern {
    let regex = Regex::new(&format!("(?i){re}")).expect("valid PII pattern");
    PiiPattern { name, code, message, category, severity, recommendation, regex }
}

static PATTERNS: LazyLock<Vec<PiiPattern>> = LazyLock::new(|| {
    use Severity::{Error, Warning};
    vec![
        pattern(
            "ssn",
            r"\b\d{3}[-.\s]?\d{2}[-.\s]?\d{4}\b",
            "PII_SSN",
            "Social Security Number detected",
            "ssn",
            Error,
            "Remove or encrypt SSN before processing",
        ),
        pattern(
            "credit_card",
            r"\b(?:4[0-9]{12}(?:[0-9]{3})?|5[1-5][0-9]{14}|3[47][0-9]{13}|6(?:011|5[0-9]{2})[0-9]{12})\b",
            "PII_CREDIT_CARD",
            "Credit card number detected",
            "financial",
            Error,
            "Remove or tokenize credit card numbers",
        ),
        pattern(
            "email",
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            "PII_EMAIL",
            "Email address detected",
            "contact",
            Warning,
            "Consider if email is necessary or should be hashed",
        ),
        pattern(
            "phone_us",
            r"\b(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b",
            "PII_PHONE",
            "Phone number detected",
            "contact",
            Warning,
            "Consider if phone number is necessary",
        ),
        pattern(
            "ip_address",
            r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
            "PII_IP_ADDRESS",
            "IP address detected",
            "technical",
            Warning,
            "Consider anonymizing IP addresses",
        ),
        pattern(
            "passport_us",
            r"\b[A-Z]{1,2}[0-9]{6,9}\b",
            "PII_PASSPORT",
            "Potential passport number detected",
            "identity",
            Error,
            "Remove passport numbers from data",
        ),
        pattern(
            "date_of_birth",
            r"\b(?:0[1-9]|1[0-2])[-/](?:0[1-9]|[12][0-9]|3[01])[-/](?:19|20)\d{2}\b",
            "PII_DOB",
            "Date of birth detected",
            "identity",
            Warning,
            "Consider if full DOB is necessary (year might suffice)",
        ),
        pattern(
            "drivers_license",
            r"\b[A-Z][0-9]{7,8}\b",
            "PII_DRIVERS_LICENSE",
            "Potential driver's license number detected",
            "identity",
            Error,
            "Remove driver's license numbers",
        ),
    ]
});

/// Built-in pattern bank, in scan order.
pub fn patterns() -> &'static [PiiPattern] {
    &PATTERNS
}

/// Pattern-based detector for common personal identifiers.
#[derive(Clone, Debug, Default)]
pub struct PiiDetector {
    /// `None` scans with every pattern.
    enabled: Option<Vec<String>>,
    severity_overrides: BTreeMap<String, Severity>,
}

impl PiiDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts scanning to the named patterns (`ssn`, `email`, ...).
    pub fn only<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.enabled = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_severity(mut self, pattern: impl Into<String>, severity: Severity) -> Self {
        self.severity_overrides.insert(pattern.into(), severity);
        self
    }

    fn active(&self) -> impl Iterator<Item = &'static PiiPattern> + '_ {
        patterns()
            .iter()
            .filter(|p| self.enabled.as_ref().map_or(true, |names| names.iter().any(|n| n == p.name)))
    }
}

/// Keeps enough of a match to recognise it without exposing it.
fn redact(value: &str, pattern: &str) -> String {
    let len = value.chars().count();
    if len <= 4 {
        return "*".repeat(len);
    }
    match pattern {
        "ssn" | "credit_card" | "phone_us" => mask(value, 0, 4),
        "email" => match value.find('@') {
            Some(at) if at > 0 => {
                let (local, domain) = value.split_at(at);
                let mut chars = local.chars();
                let first = chars.next().map(String::from).unwrap_or_default();
                format!("{first}{}{domain}", "*".repeat(chars.count()))
            }
            _ => "*".repeat(len),
        },
        _ => mask(value, 1, 1),
    }
}

impl ComplianceRule for PiiDetector {
    fn name(&self) -> &str {
        "pii"
    }

    fn description(&self) -> &str {
        "Detects personally identifiable information"
    }

    fn check(&self, _data: &Value, text: &[(String, String)]) -> Vec<Violation> {
        let mut seen: HashSet<(&str, &str, &str)> = HashSet::new();
        let mut out = vec![];
        for (field, value) in text {
            for p in self.active() {
                for m in p.regex.find_iter(value) {
                    if !seen.insert((field.as_str(), p.code, m.as_str())) {
                        continue;
                    }
                    let severity = self.severity_overrides.get(p.name).copied().unwrap_or(p.severity);
                    out.push(
                        Violation::new(p.code, p.message, severity, p.category)
                            .at(field)
                            .matched(redact(m.as_str(), p.name))
                            .recommend(p.recommendation),
                    );
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scan(d: &PiiDetector, field: &str, text: &str) -> Vec<Violation> {
        d.check(&json!(null), &[(field.to_string(), text.to_string())])
    }

    #[test]
    fn finds_ssn_and_email() {
        let v = scan(&PiiDetector::new(), "note", "SSN 123-45-6789, mail jane.doe@example.com");
        let codes: Vec<&str> = v.iter().map(|v| v.code.as_str()).collect();
        assert!(codes.contains(&"PII_SSN"));
        assert!(codes.contains(&"PII_EMAIL"));
        let ssn = v.iter().find(|v| v.code == "PII_SSN").unwrap();
        assert_eq!(ssn.matched_value.as_deref(), Some("*******6789"));
        assert_eq!(ssn.severity, Severity::Error);
        assert_eq!(ssn.field.as_deref(), Some("note"));
        let email = v.iter().find(|v| v.code == "PII_EMAIL").unwrap();
        assert_eq!(email.matched_value.as_deref(), Some("j*******@example.com"));
    }

    #[test]
    fn credit_card_is_detected() {
        let v = scan(&PiiDetector::new().only(["credit_card"]), "card", "4111111111111111");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].matched_value.as_deref(), Some("************1111"));
    }

    #[test]
    fn duplicates_in_one_field_are_reported_once() {
        let d = PiiDetector::new().only(["email"]);
        assert_eq!(scan(&d, "a", "x@y.io and x@y.io").len(), 1);
        let both = d.check(&json!(null), &[("a".into(), "x@y.io".into()), ("b".into(), "x@y.io".into())]);
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn overrides_and_filters() {
        let d = PiiDetector::new().only(["email"]).with_severity("email", Severity::Error);
        let v = scan(&d, "", "call 555-123-4567 or a@b.co");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].severity, Severity::Error);
        assert_eq!(v[0].field, None);
    }

    #[test]
    fn clean_text_has_no_findings() {
        assert!(scan(&PiiDetector::new(), "name", "Widget deluxe").is_empty());
    }

    #[test]
    fn redaction_rules() {
        assert_eq!(redact("1234", "ssn"), "****");
        assert_eq!(redact("A1234567", "drivers_license"), "A******7");
    }
}
