use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use shield_core::Severity;

use super::{ComplianceRule, PiiDetector, Violation};

struct GdprPattern {
    code: &'static str,
    message: &'static str,
    category: &'static str,
    severity: Severity,
    recommendation: &'static str,
    regex: Regex,
}

static PATTERNS: LazyLock<Vec<GdprPattern>> = LazyLock::new(|| {
    let p = |re: &str,
             code: &'static str,
             message: &'static str,
             category: &'static str,
             severity: Severity,
             recommendation: &'static str| GdprPattern {
        code,
        message,
        category,
        severity,
        recommendation,
        regex: Regex::new(&format!("(?i){re}")).expect("valid GDPR pattern"),
    };
    vec![
        p(
            r"\b[A-Z]{2}[0-9]{8,12}\b",
            "GDPR_NATIONAL_ID",
            "Potential EU national ID number detected",
            "personal_data",
            Severity::Error,
            "National IDs require explicit consent and purpose limitation",
        ),
        p(
            r"\b[A-Z]{2}[0-9]{2}[A-Z0-9]{4}[0-9]{7}([A-Z0-9]?){0,16}\b",
            "GDPR_IBAN",
            "IBAN (bank account) detected",
            "financial",
            Severity::Warning,
            "Financial data requires appropriate safeguards",
        ),
        p(
            r"\b[A-Z]{2}[0-9A-Z]{8,12}\b",
            "GDPR_VAT",
            "Potential VAT number detected",
            "business",
            Severity::Info,
            "VAT numbers may be processed for legitimate business purposes",
        ),
    ]
});

/// Article 9 special categories and the phrases that suggest them.
const SPECIAL_CATEGORIES: [(&str, &[&str]); 8] = [
    ("racial_ethnic", &["race", "ethnicity", "ethnic origin", "nationality", "national origin"]),
    ("political", &["political opinion", "political party", "political view", "voting", "election"]),
    ("religious", &["religion", "religious belief", "faith", "church", "mosque", "synagogue", "temple"]),
    ("trade_union", &["trade union", "labor union", "union member", "union membership"]),
    ("genetic", &["genetic data", "dna", "genome", "genetic test", "hereditary"]),
    ("biometric", &["fingerprint", "facial recognition", "iris scan", "biometric", "voice print"]),
    ("health", &["health data", "medical condition", "diagnosis", "treatment", "prescription", "disability"]),
    ("sexual", &["sexual orientation", "sex life", "sexual preference", "gender identity"]),
];

const CONSENT_FIELDS: [&str; 9] = [
    "consent",
    "consent_given",
    "gdpr_consent",
    "data_consent",
    "privacy_consent",
    "marketing_consent",
    "opted_in",
    "consent_date",
    "consent_timestamp",
];

const PERSONAL_KEY_HINTS: [&str; 9] = ["name", "email", "phone", "address", "birth", "age", "gender", "salary", "income"];

const MINIMIZATION_THRESHOLD: usize = 10;

/// EU data protection checks: identifier patterns, special category data,
/// missing consent, and over-collection.
#[derive(Clone, Debug)]
pub struct GdprRules {
    pub check_consent: bool,
    pub check_special_categories: bool,
    pub check_data_minimization: bool,
}

impl GdprRules {
    pub fn new() -> Self {
        Self { check_consent: true, check_special_categories: true, check_data_minimization: true }
    }

    fn special_categories(&self, text: &[(String, String)]) -> Vec<Violation> {
        let all = text.iter().map(|(_, t)| t.to_lowercase()).collect::<Vec<_>>().join(" ");
        SPECIAL_CATEGORIES
            .iter()
            .filter(|(_, words)| words.iter().any(|w| all.contains(w)))
            .map(|(cat, _)| {
                Violation::new(
                    format!("GDPR_SPECIAL_CATEGORY_{}", cat.to_ascii_uppercase()),
                    format!("Special category data detected: {}", cat.replace('_', " ")),
                    Severity::Error,
                    "special_category",
                )
                .recommend("Article 9 data requires explicit consent and one of the specific lawful bases for processing")
            })
            .collect()
    }

    fn consent(&self, data: &Value, text: &[(String, String)]) -> Option<Violation> {
        let personal = PiiDetector::new().only(["email", "phone_us", "ssn"]);
        if personal.check(data, text).is_empty() {
            return None;
        }
        let consented = data
            .as_object()
            .is_some_and(|obj| CONSENT_FIELDS.iter().filter_map(|f| obj.get(*f)).any(is_affirmative));
        if consented {
            return None;
        }
        Some(
            Violation::new(
                "GDPR_NO_CONSENT",
                "Personal data found without consent indicator",
                Severity::Warning,
                "consent",
            )
            .recommend("Ensure valid consent is obtained and recorded, or document another lawful basis for processing"),
        )
    }

    fn minimization(&self, data: &Value) -> Option<Violation> {
        let count = data.as_object().map_or(0, |obj| {
            obj.keys()
                .filter(|k| {
                    let k = k.to_lowercase();
                    PERSONAL_KEY_HINTS.iter().any(|h| k.contains(h))
                })
                .count()
        });
        (count > MINIMIZATION_THRESHOLD).then(|| {
            Violation::new(
                "GDPR_DATA_MINIMIZATION",
                format!("Potential data minimization issue: {count} personal data fields"),
                Severity::Warning,
                "data_minimization",
            )
            .recommend("Review if all personal data fields are necessary for the stated purpose (Article 5(1)(c))")
        })
    }
}

impl Default for GdprRules {
    fn default() -> Self {
        Self::new()
    }
}

fn is_affirmative(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(s.as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

impl ComplianceRule for GdprRules {
    fn name(&self) -> &str {
        "gdpr"
    }

    fn description(&self) -> &str {
        "GDPR compliance rules for EU data protection"
    }

    fn check(&self, data: &Value, text: &[(String, String)]) -> Vec<Violation> {
        let mut out: Vec<Violation> = text
            .iter()
            .flat_map(|(field, value)| {
                PATTERNS.iter().filter(|p| p.regex.is_match(value)).map(move |p| {
                    Violation::new(p.code, p.message, p.severity, p.category)
                        .at(field)
                        .recommend(p.recommendation)
                })
            })
            .collect();
        if self.check_special_categories {
            out.extend(self.special_categories(text));
        }
        if self.check_consent {
            out.extend(self.consent(data, text));
        }
        if self.check_data_minimization {
            out.extend(self.minimization(data));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(rules: &GdprRules, data: Value) -> Vec<Violation> {
        let text = super::super::collect_text(&data, 10);
        rules.check(&data, &text)
    }

    fn codes(v: &[Violation]) -> Vec<&str> {
        v.iter().map(|v| v.code.as_str()).collect()
    }

    #[test]
    fn email_without_consent_is_flagged() {
        let v = run(&GdprRules::new(), json!({"email": "a@b.eu"}));
        assert_eq!(codes(&v), vec!["GDPR_NO_CONSENT"]);
    }

    #[test]
    fn affirmative_consent_clears_the_warning() {
        for consent in [json!(true), json!("yes"), json!(1), json!("1")] {
            let v = run(&GdprRules::new(), json!({"email": "a@b.eu", "gdpr_consent": consent}));
            assert!(v.is_empty(), "{v:?}");
        }
        let v = run(&GdprRules::new(), json!({"email": "a@b.eu", "consent": "no"}));
        assert_eq!(codes(&v), vec!["GDPR_NO_CONSENT"]);
    }

    #[test]
    fn special_category_reported_once_per_category() {
        let v = run(&GdprRules::new(), json!({"notes": "Religion: none. Attends church and temple."}));
        assert_eq!(codes(&v), vec!["GDPR_SPECIAL_CATEGORY_RELIGIOUS"]);
        assert_eq!(v[0].category, "special_category");
        assert_eq!(v[0].field, None);
    }

    #[test]
    fn iban_matches_per_field() {
        let v = run(&GdprRules::new(), json!({"account": "DE89370400440532013000"}));
        let c = codes(&v);
        assert!(c.contains(&"GDPR_IBAN"));
        assert!(v.iter().all(|v| v.field.as_deref() == Some("account")));
    }

    #[test]
    fn too_many_personal_fields() {
        let mut obj = serde_json::Map::new();
        for i in 0..11 {
            obj.insert(format!("name_{i}"), json!(i));
        }
        let v = run(&GdprRules::new(), Value::Object(obj));
        assert_eq!(codes(&v), vec!["GDPR_DATA_MINIMIZATION"]);

        let off = GdprRules { check_data_minimization: false, ..GdprRules::new() };
        let mut obj = serde_json::Map::new();
        for i in 0..11 {
            obj.insert(format!("name_{i}"), json!(i));
        }
        assert!(run(&off, Value::Object(obj)).is_empty());
    }
}
