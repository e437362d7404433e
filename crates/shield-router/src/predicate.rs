use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use shield_core::{MetaValue, Severity, Status, ValidationMessage, ValidationResult};

/// Closure predicate for rules that cannot be expressed declaratively.
#[derive(Clone)]
pub struct CustomPredicate(pub Arc<dyn Fn(&ValidationResult) -> bool + Send + Sync>);

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<custom>")
    }
}

/// Matches messages; every field that is set must match.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessageFilter {
    pub severity: Option<Severity>,
    pub code_prefix: Option<String>,
    pub validator: Option<String>,
    pub field: Option<String>,
}

impl MessageFilter {
    pub fn matches(&self, m: &ValidationMessage) -> bool {
        self.severity.map_or(true, |s| m.severity == s)
            && self.code_prefix.as_deref().map_or(true, |p| m.code.starts_with(p))
            && self.validator.as_deref().map_or(true, |v| m.validator.as_deref() == Some(v))
            && self.field.as_deref().map_or(true, |f| m.field.as_deref() == Some(f))
    }
}

/// Condition over a result. Pure: depends only on the result's current state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Predicate {
    Always,
    StatusIn { statuses: Vec<Status> },
    AnyMessage(MessageFilter),
    MetadataEquals { key: String, value: MetaValue },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
    #[serde(skip)]
    Custom(CustomPredicate),
}

impl Predicate {
    pub fn status(status: Status) -> Self {
        Predicate::StatusIn { statuses: vec![status] }
    }

    pub fn status_in(statuses: impl IntoIterator<Item = Status>) -> Self {
        Predicate::StatusIn { statuses: statuses.into_iter().collect() }
    }

    pub fn any_message(filter: MessageFilter) -> Self {
        Predicate::AnyMessage(filter)
    }

    pub fn custom(f: impl Fn(&ValidationResult) -> bool + Send + Sync + 'static) -> Self {
        Predicate::Custom(CustomPredicate(Arc::new(f)))
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::All { of: vec![self, other] }
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Any { of: vec![self, other] }
    }

    pub fn negate(self) -> Self {
        Predicate::Not { predicate: Box::new(self) }
    }

    pub fn matches(&self, r: &ValidationResult) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::StatusIn { statuses } => statuses.contains(&r.status()),
            Predicate::AnyMessage(filter) => r.messages().iter().any(|m| filter.matches(m)),
            Predicate::MetadataEquals { key, value } => r.meta(key) == Some(value),
            Predicate::All { of } => of.iter().all(|p| p.matches(r)),
            Predicate::Any { of } => of.iter().any(|p| p.matches(r)),
            Predicate::Not { predicate } => !predicate.matches(r),
            Predicate::Custom(f) => (f.0)(r),
        }
    }
}
