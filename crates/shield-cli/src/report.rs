use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::Serialize;

use shield_audit::{AuditEntry, AuditStats};
use shield_core::{Status, ValidationResult};
use shield_router::{Action, RoutingDecision};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    #[default]
    Table,
    Json,
    Summary,
}

/// One validated source and where it was routed.
#[derive(Debug, Serialize)]
pub struct Outcome {
    pub path: PathBuf,
    pub result: ValidationResult,
    pub decision: RoutingDecision,
}

pub fn render(outcomes: &[Outcome], format: Format) -> anyhow::Result<String> {
    Ok(match format {
        Format::Json => serde_json::to_string_pretty(outcomes)? + "\n",
        Format::Table => table(outcomes),
        Format::Summary => summary(outcomes),
    })
}

pub fn line(o: &Outcome) -> String {
    format!(
        "{:<8} {:<10} {}  ({} error(s), {} warning(s))",
        o.result.status(),
        o.decision.action,
        o.path.display(),
        o.result.errors().count(),
        o.result.warnings().count()
    )
}

fn table(outcomes: &[Outcome]) -> String {
    let mut out = String::new();
    for o in outcomes {
        let _ = writeln!(out, "{}", line(o));
        for m in o.result.messages() {
            let _ = writeln!(out, "    {m}");
        }
    }
    out.push_str(&summary(outcomes));
    out
}

fn summary(outcomes: &[Outcome]) -> String {
    let mut by_status: BTreeMap<Status, usize> = Status::ALL.iter().map(|s| (*s, 0)).collect();
    let mut by_action: BTreeMap<Action, usize> = Action::ALL.iter().map(|a| (*a, 0)).collect();
    for o in outcomes {
        *by_status.entry(o.result.status()).or_default() += 1;
        *by_action.entry(o.decision.action).or_default() += 1;
    }
    let join = |parts: Vec<String>| parts.join(", ");
    format!(
        "{} source(s): {}\nrouted: {}\n",
        outcomes.len(),
        join(by_status.iter().filter(|(_, n)| **n > 0).map(|(s, n)| format!("{n} {s}")).collect()),
        join(by_action.iter().filter(|(_, n)| **n > 0).map(|(a, n)| format!("{n} {a}")).collect()),
    )
}

pub fn entry_line(e: &AuditEntry) -> String {
    format!(
        "{}  {:<8} {}  {} error(s), {} warning(s)",
        e.timestamp.format("%Y-%m-%d %H:%M:%S"),
        e.status,
        e.source_id.as_deref().unwrap_or("-"),
        e.error_count(),
        e.warning_count()
    )
}

pub fn stats_text(s: &AuditStats) -> String {
    let mut out = format!("entries: {}\n", s.total);
    for (status, n) in &s.by_status {
        let _ = writeln!(out, "  {status:<8} {n}");
    }
    let _ = writeln!(out, "errors: {}\nwarnings: {}", s.total_errors, s.total_warnings);
    if let Some(avg) = s.avg_duration_ms {
        let _ = writeln!(out, "avg duration: {avg:.2}ms");
    }
    if s.corrupt_lines > 0 {
        let _ = writeln!(out, "corrupt lines skipped: {}", s.corrupt_lines);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use shield_core::ValidationMessage;
    use shield_router::Router;

    fn outcome(path: &str, fail: bool) -> Outcome {
        let mut result = ValidationResult::new();
        if fail {
            result.add_message(ValidationMessage::error("SCHEMA_TYPE", "bad").with_field("id"));
        }
        result.complete();
        let decision = Router::new().route(&result);
        Outcome { path: PathBuf::from(path), result, decision }
    }

    #[test]
    fn summary_counts_statuses_and_actions() {
        let s = render(&[outcome("a.json", false), outcome("b.json", true)], Format::Summary).unwrap();
        assert!(s.starts_with("2 source(s): 1 PASSED, 1 FAILED"));
        assert!(s.contains("routed: 1 PASS, 1 QUARANTINE"));
    }

    #[test]
    fn table_lists_messages() {
        let s = render(&[outcome("b.json", true)], Format::Table).unwrap();
        assert!(s.contains("b.json"));
        assert!(s.contains("[ERROR]"));
    }

    #[test]
    fn json_is_an_array() {
        let s = render(&[outcome("a.json", false)], Format::Json).unwrap();
        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v[0]["decision"]["action"], "pass");
        assert_eq!(v[0]["result"]["status"], "passed");
    }
}
