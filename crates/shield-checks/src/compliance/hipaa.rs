use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use shield_core::Severity;

use super::{mask, ComplianceRule, PiiDetector, Violation};

struct PhiPattern {
    code: &'static str,
    message: &'static str,
    category: &'static str,
    severity: Severity,
    recommendation: &'static str,
    regex: Regex,
}

fn phi(
    re: &str,
    code: &'static str,
    message: &'static str,
    category: &'static str,
    severity: Severity,
    recommendation: &'static str,
) -> PhiPattern {
    let regex = Regex::new(&format!("(?i){re}")).expect("valid PHI pattern");
    PhiPattern { code, message, category, severity, recommendation, regex }
}

static PATTERNS: LazyLock<Vec<PhiPattern>> = LazyLock::new(|| {
    use Severity::{Error, Warning};
    vec![
        phi(
            r"\b(?:MRN|Medical Record|Record #|Patient ID)[:\s#]*([A-Z0-9]{6,12})\b",
            "HIPAA_MRN",
            "Medical Record Number (MRN) detected",
            "phi",
            Error,
            "Remove or encrypt MRN per HIPAA requirements",
        ),
        phi(
            r"\b(?:Health Plan|Insurance|Plan ID|Member ID)[:\s#]*([A-Z0-9]{8,15})\b",
            "HIPAA_HEALTH_PLAN",
            "Health plan beneficiary number detected",
            "phi",
            Error,
            "Remove or encrypt health plan identifiers",
        ),
        phi(
            r"\b(?:ICD-?10|ICD-?9|Diagnosis)[:\s]*([A-Z][0-9]{2}\.?[0-9A-Z]{0,4})\b",
            "HIPAA_DIAGNOSIS",
            "Diagnosis code detected (ICD)",
            "clinical",
            Warning,
            "Ensure diagnosis codes are de-identified when required",
        ),
        phi(
            r"\b(?:Rx|Prescription|NDC)[:\s#]*([0-9]{10,11})\b",
            "HIPAA_PRESCRIPTION",
            "Prescription/NDC number detected",
            "clinical",
            Warning,
            "Review if prescription details need de-identification",
        ),
        phi(
            r"\b(?:NPI|Provider ID)[:\s#]*([0-9]{10})\b",
            "HIPAA_NPI",
            "National Provider Identifier (NPI) detected",
            "provider",
            Warning,
            "NPI may be included but verify context",
        ),
        phi(
            r"\b(?:DEA)[:\s#]*([A-Z]{2}[0-9]{7})\b",
            "HIPAA_DEA",
            "DEA number detected",
            "provider",
            Error,
            "DEA numbers should not be exposed",
        ),
    ]
});

const CONTEXT_KEYWORDS: [&str; 22] = [
    "patient",
    "diagnosis",
    "treatment",
    "prescription",
    "medical",
    "health",
    "hospital",
    "doctor",
    "physician",
    "nurse",
    "clinic",
    "symptom",
    "medication",
    "allergy",
    "procedure",
    "surgery",
    "lab result",
    "test result",
    "vital sign",
    "blood pressure",
    "heart rate",
    "temperature",
];

/// Protected health information identifiers.
///
/// In strict mode, data that reads like a clinical record (two or more
/// healthcare keywords) is also scanned for SSNs, emails, phone numbers and
/// birth dates, all reported as errors.
#[derive(Clone, Debug)]
pub struct HipaaRules {
    strict: bool,
}

impl HipaaRules {
    pub fn new() -> Self {
        Self { strict: true }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Default for HipaaRules {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn is_healthcare_context(text: &[(String, String)]) -> bool {
    let all = text.iter().map(|(_, t)| t.to_lowercase()).collect::<Vec<_>>().join(" ");
    CONTEXT_KEYWORDS.iter().filter(|k| all.contains(*k)).count() >= 2
}

impl ComplianceRule for HipaaRules {
    fn name(&self) -> &str {
        "hipaa"
    }

    fn description(&self) -> &str {
        "HIPAA protected health information"
    }

    fn check(&self, data: &Value, text: &[(String, String)]) -> Vec<Violation> {
        let mut out = vec![];
        for (field, value) in text {
            for p in PATTERNS.iter() {
                for caps in p.regex.captures_iter(value) {
                    let Some(m) = caps.get(1).or_else(|| caps.get(0)) else { continue };
                    out.push(
                        Violation::new(p.code, p.message, p.severity, p.category)
                            .at(field)
                            .matched(mask(m.as_str(), 2, 2))
                            .recommend(p.recommendation),
                    );
                }
            }
        }

        if self.strict && is_healthcare_context(text) {
            let pii = PiiDetector::new()
                .only(["ssn", "email", "phone_us", "date_of_birth"])
                .with_severity("ssn", Severity::Error)
                .with_severity("email", Severity::Error)
                .with_severity("phone_us", Severity::Error)
                .with_severity("date_of_birth", Severity::Error);
            for mut v in pii.check(data, text) {
                v.code = format!("HIPAA_{}", v.code);
                v.message = format!("{} (in healthcare context)", v.message);
                v.recommendation = v
                    .recommendation
                    .map(|r| format!("HIPAA requires protection of this data. {r}"));
                out.push(v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(f, t)| (f.to_string(), t.to_string())).collect()
    }

    #[test]
    fn mrn_and_dea_are_errors() {
        let text = pairs(&[("chart", "MRN: ABC123456"), ("prescriber", "DEA AB1234567")]);
        let v = HipaaRules::new().strict(false).check(&json!({}), &text);
        let mrn = v.iter().find(|v| v.code == "HIPAA_MRN").unwrap();
        assert_eq!(mrn.severity, Severity::Error);
        assert_eq!(mrn.matched_value.as_deref(), Some("AB*****56"));
        assert!(v.iter().any(|v| v.code == "HIPAA_DEA"));
    }

    #[test]
    fn diagnosis_code_is_a_warning() {
        let v = HipaaRules::new().strict(false).check(&json!({}), &pairs(&[("dx", "ICD-10: E11.9")]));
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].code, "HIPAA_DIAGNOSIS");
        assert_eq!(v[0].severity, Severity::Warning);
    }

    #[test]
    fn context_needs_two_keywords() {
        assert!(!is_healthcare_context(&pairs(&[("a", "patient name")])));
        assert!(is_healthcare_context(&pairs(&[("a", "Patient"), ("b", "Hospital stay")])));
    }

    #[test]
    fn strict_mode_elevates_contact_details() {
        let text = pairs(&[("note", "patient seen by doctor"), ("email", "pat@example.com")]);
        let v = HipaaRules::new().check(&json!({}), &text);
        let e = v.iter().find(|v| v.code == "HIPAA_PII_EMAIL").unwrap();
        assert_eq!(e.severity, Severity::Error);
        assert!(e.message.ends_with("(in healthcare context)"));
        assert!(e.recommendation.as_deref().unwrap().starts_with("HIPAA requires"));

        let relaxed = HipaaRules::new().strict(false).check(&json!({}), &text);
        assert!(relaxed.is_empty());
    }
}
