use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use shield_core::{ResultId, Status, ValidationResult};

use crate::predicate::Predicate;

/// Where an item goes next. Ordered so grouped output is stable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Pass,
    Review,
    Quarantine,
    Retry,
    Drop,
}

impl Action {
    pub const ALL: [Action; 5] = [Action::Pass, Action::Review, Action::Quarantine, Action::Retry, Action::Drop];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Pass => "pass",
            Action::Review => "review",
            Action::Quarantine => "quarantine",
            Action::Retry => "retry",
            Action::Drop => "drop",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.as_str().to_ascii_uppercase())
    }
}

/// A named first-match rule.
///
/// `reason` is a template; `{route}`, `{action}`, `{status}`, `{id}`, `{source}`,
/// `{errors}` and `{warnings}` are substituted when a decision is made.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub predicate: Predicate,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl Route {
    pub fn new(name: impl Into<String>, predicate: Predicate, action: Action) -> Self {
        Self { name: name.into(), predicate, action, reason: None, destination: None }
    }

    pub fn with_reason(mut self, template: impl Into<String>) -> Self {
        self.reason = Some(template.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub route: String,
    pub action: Action,
    pub reason: String,
    pub result_id: ResultId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// True when no configured route matched and the built-in default applied.
    pub is_default: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Append a `review_warnings` route sending WARNING results to REVIEW.
    pub review_warnings: bool,
    pub routes: Vec<Route>,
}

#[derive(Debug, Error)]
pub enum RouteConfigError {
    #[error("route name cannot be empty")]
    EmptyName,
    #[error("duplicate route name: {0}")]
    DuplicateName(String),
    #[error("route {0} has an empty status list and can never match")]
    EmptyStatusList(String),
}

const DEFAULT_REASON: &str = "no route matched; default for {status} is {action}";
const REVIEW_WARNINGS: &str = "review_warnings";

/// Ordered first-match router with an unconditional status-based fallback.
#[derive(Clone, Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &RouterConfig) -> Result<Self, RouteConfigError> {
        let mut seen = HashSet::new();
        for r in &cfg.routes {
            if r.name.trim().is_empty() {
                return Err(RouteConfigError::EmptyName);
            }
            if !seen.insert(r.name.as_str()) {
                return Err(RouteConfigError::DuplicateName(r.name.clone()));
            }
            if matches!(&r.predicate, Predicate::StatusIn { statuses } if statuses.is_empty()) {
                return Err(RouteConfigError::EmptyStatusList(r.name.clone()));
            }
        }

        let mut router = Router { routes: cfg.routes.clone() };
        if cfg.review_warnings && !seen.contains(REVIEW_WARNINGS) {
            router.add_route(
                Route::new(REVIEW_WARNINGS, Predicate::status(Status::Warning), Action::Review)
                    .with_reason("{warnings} warning(s) need review"),
            );
        }
        Ok(router)
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.add_route(route);
        self
    }

    /// Appends a route. Declaration order is evaluation order.
    pub fn add_route(&mut self, route: Route) -> &mut Self {
        self.routes.push(route);
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// First matching route wins; otherwise the status default applies.
    pub fn route(&self, result: &ValidationResult) -> RoutingDecision {
        if let Some(r) = self.routes.iter().find(|r| r.predicate.matches(result)) {
            debug!(result_id = %result.id(), route = %r.name, action = %r.action, "route matched");
            let template = r.reason.as_deref().unwrap_or("matched route {route}");
            return RoutingDecision {
                route: r.name.clone(),
                action: r.action,
                reason: render(template, &r.name, r.action, result),
                result_id: result.id().clone(),
                destination: r.destination.clone(),
                is_default: false,
            };
        }

        let (route, action) = default_route(result.status());
        debug!(result_id = %result.id(), route, action = %action, "default route");
        RoutingDecision {
            route: route.to_string(),
            action,
            reason: render(DEFAULT_REASON, route, action, result),
            result_id: result.id().clone(),
            destination: None,
            is_default: true,
        }
    }

    /// Routes each result independently and groups by action. Every action is
    /// present in the map; input order is kept within each group.
    pub fn route_batch<'a, I>(&self, results: I) -> BTreeMap<Action, Vec<RoutingDecision>>
    where
        I: IntoIterator<Item = &'a ValidationResult>,
    {
        let mut groups: BTreeMap<Action, Vec<RoutingDecision>> = Action::ALL.iter().map(|a| (*a, vec![])).collect();
        for r in results {
            let d = self.route(r);
            groups.entry(d.action).or_default().push(d);
        }
        groups
    }
}

/// Built-in fallback. Exhaustive over `Status`, so every result gets a decision.
pub fn default_route(status: Status) -> (&'static str, Action) {
    match status {
        Status::Passed | Status::Warning => ("default_pass", Action::Pass),
        Status::Failed | Status::Error => ("default_quarantine", Action::Quarantine),
        Status::Skipped => ("default_drop", Action::Drop),
    }
}

/// Substitutes placeholders in one pass; values are never re-scanned and unknown
/// names stay as written.
fn render(template: &str, route: &str, action: Action, r: &ValidationResult) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            rest = &rest[open..];
            break;
        };
        let name = &after[..close];
        match name {
            "route" => out.push_str(route),
            "action" => out.push_str(&action.to_string()),
            "status" => out.push_str(&r.status().to_string()),
            "id" => out.push_str(r.id().as_str()),
            "source" => out.push_str(r.source_id().unwrap_or("-")),
            "errors" => out.push_str(&r.errors().count().to_string()),
            "warnings" => out.push_str(&r.warnings().count().to_string()),
            _ => {
                // Not a placeholder; keep the brace and rescan after it.
                out.push('{');
                rest = after;
                continue;
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
