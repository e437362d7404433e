use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use shield_core::{Check, CheckError, MetaValue, ValidationMessage, ValidationResult};

#[derive(Debug, Error, PartialEq)]
#[error("invalid duration {0:?}; use forms like '7d', '2 weeks', '30 minutes'")]
pub struct DurationError(pub String);

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*([A-Za-z]+)\s*$").expect("valid duration regex"));

/// Parses `"7d"`, `"2 weeks"`, `"30m"`, `"1M"`. Only upper-case `M` means months;
/// every other unit is case-insensitive. A month is 30 days, a year 365.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let caps = DURATION_RE.captures(s).ok_or_else(|| DurationError(s.to_string()))?;
    let n: i64 = caps[1].parse().map_err(|_| DurationError(s.to_string()))?;
    let unit = &caps[2];
    let unit = if unit == "M" { "month".to_string() } else { unit.to_ascii_lowercase() };
    let secs_per = match unit.as_str() {
        "s" | "sec" | "second" | "seconds" => 1,
        "m" | "min" | "minute" | "minutes" => 60,
        "h" | "hr" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 7 * 86_400,
        "month" | "months" => 30 * 86_400,
        "y" | "year" | "years" => 365 * 86_400,
        _ => return Err(DurationError(s.to_string())),
    };
    n.checked_mul(secs_per)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| DurationError(s.to_string()))
}

/// Compact human rendering, e.g. `3d 4h`, `12m 5s`.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.num_seconds().max(0);
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let mins = secs / 60;
    secs %= 60;
    let parts: Vec<String> = [(days, "d"), (hours, "h"), (mins, "m"), (secs, "s")]
        .iter()
        .filter(|(n, _)| *n > 0)
        .take(2)
        .map(|(n, u)| format!("{n}{u}"))
        .collect();
    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

const DEFAULT_FIELDS: [&str; 5] = ["timestamp", "created_at", "updated_at", "date", "datetime"];

/// Flags records whose timestamp is older than `max_age`.
#[derive(Clone, Debug)]
pub struct FreshnessCheck {
    max_age: Duration,
    timestamp_fields: Vec<String>,
    warn_ratio: f64,
    now: Option<DateTime<Utc>>,
}

impl FreshnessCheck {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            timestamp_fields: DEFAULT_FIELDS.iter().map(|s| s.to_string()).collect(),
            warn_ratio: 0.8,
            now: None,
        }
    }

    pub fn parse(max_age: &str) -> Result<Self, DurationError> {
        Ok(Self::new(parse_duration(max_age)?))
    }

    /// Only look at these fields. Dotted paths reach into nested objects.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.timestamp_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_warn_ratio(mut self, ratio: f64) -> Self {
        self.warn_ratio = ratio;
        self
    }

    /// Fixes the reference time instead of reading the clock.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn find<'a>(&self, obj: &'a Map<String, Value>) -> Option<(&'a Value, &str)> {
        self.timestamp_fields.iter().find_map(|field| {
            let v = obj.get(field).or_else(|| lookup_dotted(obj, field))?;
            (!v.is_null()).then_some((v, field.as_str()))
        })
    }
}

fn lookup_dotted<'a>(obj: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return None;
    }
    let mut parts = path.split('.');
    let mut cur = obj.get(parts.next()?)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

/// Accepts RFC 3339, common date/datetime layouts, and unix seconds.
pub fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => {
            let f = n.as_f64()?;
            let secs = f.trunc() as i64;
            let nanos = ((f - f.trunc()) * 1e9).round() as u32;
            DateTime::from_timestamp(secs, nanos.min(999_999_999))
        }
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

#[async_trait]
impl Check for FreshnessCheck {
    fn name(&self) -> &str {
        "freshness"
    }

    async fn validate(&self, data: &Value, result: &mut ValidationResult) -> Result<(), CheckError> {
        let Some(obj) = data.as_object() else {
            result.add_message(
                ValidationMessage::warning("FRESHNESS_NOT_DICT", "freshness needs an object with a timestamp field")
                    .with_validator(self.name()),
            );
            return Ok(());
        };

        let Some((raw, field)) = self.find(obj) else {
            let searched: Vec<MetaValue> = self.timestamp_fields.iter().map(|f| f.as_str().into()).collect();
            result.add_message(
                ValidationMessage::warning("FRESHNESS_NO_TIMESTAMP", "no timestamp field found")
                    .with_validator(self.name())
                    .with_detail("searched_fields", MetaValue::List(searched)),
            );
            return Ok(());
        };

        let Some(ts) = parse_timestamp(raw) else {
            result.add_message(
                ValidationMessage::warning("FRESHNESS_PARSE_ERROR", format!("cannot parse timestamp {raw}"))
                    .with_validator(self.name())
                    .with_field(field),
            );
            return Ok(());
        };

        let now = self.now.unwrap_or_else(Utc::now);
        let age = now - ts;
        let age_secs = age.num_milliseconds() as f64 / 1000.0;
        let max_secs = self.max_age.num_milliseconds() as f64 / 1000.0;
        result.set_meta("data_age_seconds", age_secs);
        result.set_meta("max_age_seconds", max_secs);
        result.set_meta("timestamp_value", ts.to_rfc3339());

        if age_secs > max_secs {
            result.add_message(
                ValidationMessage::error(
                    "FRESHNESS_STALE",
                    format!(
                        "data is stale: age is {}, max allowed is {}",
                        format_duration(age),
                        format_duration(self.max_age)
                    ),
                )
                .with_validator(self.name())
                .with_field(field)
                .with_detail("age_seconds", age_secs)
                .with_detail("max_age_seconds", max_secs),
            );
        } else if max_secs > 0.0 && age_secs > max_secs * self.warn_ratio {
            result.add_message(
                ValidationMessage::warning(
                    "FRESHNESS_NEAR_STALE",
                    format!(
                        "data is approaching staleness: age is {} ({:.0}% of max)",
                        format_duration(age),
                        age_secs / max_secs * 100.0
                    ),
                )
                .with_validator(self.name())
                .with_field(field),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use shield_core::Status;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("7d").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("2 weeks").unwrap(), Duration::weeks(2));
        assert_eq!(parse_duration("30m").unwrap(), Duration::minutes(30));
        assert_eq!(parse_duration("30 Minutes").unwrap(), Duration::minutes(30));
        assert_eq!(parse_duration("1M").unwrap(), Duration::days(30));
        assert_eq!(parse_duration("1y").unwrap(), Duration::days(365));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5 fortnights").is_err());
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::seconds(0)), "0s");
        assert_eq!(format_duration(Duration::seconds(90)), "1m 30s");
        assert_eq!(format_duration(Duration::hours(76)), "3d 4h");
    }

    #[test]
    fn parses_timestamp_layouts() {
        let want = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        for s in ["2024-01-15", "2024/01/15", "2024-01-15T00:00:00Z", "2024-01-15T00:00:00", "01/15/2024"] {
            assert_eq!(parse_timestamp(&json!(s)), Some(want), "{s}");
        }
        assert_eq!(parse_timestamp(&json!(want.timestamp())), Some(want));
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }

    async fn run(check: &FreshnessCheck, data: Value) -> ValidationResult {
        let mut r = ValidationResult::new();
        check.validate(&data, &mut r).await.unwrap();
        r
    }

    #[tokio::test]
    async fn fresh_stale_and_near_stale() {
        let check = FreshnessCheck::new(Duration::days(10)).at(now());
        let fresh = run(&check, json!({"updated_at": "2024-06-14T12:00:00Z"})).await;
        assert_eq!(fresh.status(), Status::Passed);
        assert_eq!(fresh.meta("max_age_seconds"), Some(&MetaValue::Float(864000.0)));

        let near = run(&check, json!({"updated_at": "2024-06-06T12:00:00Z"})).await;
        assert_eq!(near.status(), Status::Warning);
        assert_eq!(near.messages()[0].code, "FRESHNESS_NEAR_STALE");

        let stale = run(&check, json!({"timestamp": "2024-05-01"})).await;
        assert_eq!(stale.status(), Status::Failed);
        assert_eq!(stale.messages()[0].code, "FRESHNESS_STALE");
        assert_eq!(stale.messages()[0].field.as_deref(), Some("timestamp"));
    }

    #[tokio::test]
    async fn nested_field_and_missing_cases() {
        let check = FreshnessCheck::new(Duration::days(1)).at(now()).with_fields(["meta.seen"]);
        let r = run(&check, json!({"meta": {"seen": "2024-06-15T06:00:00Z"}})).await;
        assert_eq!(r.status(), Status::Passed);

        let r = run(&check, json!({"meta": {}})).await;
        assert_eq!(r.messages()[0].code, "FRESHNESS_NO_TIMESTAMP");
        assert_eq!(r.status(), Status::Warning);

        let r = run(&check, json!([1, 2])).await;
        assert_eq!(r.messages()[0].code, "FRESHNESS_NOT_DICT");

        let r = run(&check, json!({"meta": {"seen": "last tuesday"}})).await;
        assert_eq!(r.messages()[0].code, "FRESHNESS_PARSE_ERROR");
    }
}
