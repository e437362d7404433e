use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a file-like source whose extension has no extractor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownExtension {
    /// Return an ERROR result carrying a `NO_EXTRACTOR` message.
    #[default]
    ErrorResult,
    /// Fail the call with `PipelineError::NoExtractor`.
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub fail_fast: bool,
    pub include_original_data: bool,
    pub auto_detect_extractor: bool,
    pub unknown_extension: UnknownExtension,
    /// Per-check time limit. `None` means checks may run unbounded.
    pub check_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            include_original_data: true,
            auto_detect_extractor: true,
            unknown_extension: UnknownExtension::ErrorResult,
            check_timeout_ms: None,
        }
    }
}

/// Partial configuration; every `Some` field replaces the base value.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineOverrides {
    pub fail_fast: Option<bool>,
    pub include_original_data: Option<bool>,
    pub auto_detect_extractor: Option<bool>,
    pub unknown_extension: Option<UnknownExtension>,
    pub check_timeout_ms: Option<u64>,
}

impl PipelineConfig {
    pub fn merged(&self, o: &PipelineOverrides) -> Self {
        Self {
            fail_fast: o.fail_fast.unwrap_or(self.fail_fast),
            include_original_data: o.include_original_data.unwrap_or(self.include_original_data),
            auto_detect_extractor: o.auto_detect_extractor.unwrap_or(self.auto_detect_extractor),
            unknown_extension: o.unknown_extension.unwrap_or(self.unknown_extension),
            check_timeout_ms: o.check_timeout_ms.or(self.check_timeout_ms),
        }
    }

    pub fn check_timeout(&self) -> Option<Duration> {
        self.check_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_overrides_keep_defaults() {
        let base = PipelineConfig::default();
        assert_eq!(base.merged(&PipelineOverrides::default()), base);
    }

    #[test]
    fn overrides_replace_only_set_fields() {
        let base = PipelineConfig { check_timeout_ms: Some(500), ..Default::default() };
        let merged = base.merged(&PipelineOverrides {
            fail_fast: Some(true),
            unknown_extension: Some(UnknownExtension::Reject),
            ..Default::default()
        });
        assert!(merged.fail_fast);
        assert_eq!(merged.unknown_extension, UnknownExtension::Reject);
        assert!(merged.include_original_data);
        assert_eq!(merged.check_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: PipelineConfig = serde_json::from_str(r#"{"fail_fast": true, "check_timeout_ms": 250}"#).unwrap();
        assert!(cfg.fail_fast);
        assert!(cfg.auto_detect_extractor);
        assert_eq!(cfg.check_timeout_ms, Some(250));
    }
}
