use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::result::ValidationResult;

/// A pluggable unit that inspects data and contributes messages to a result.
///
/// Checks run one at a time, in pipeline order, each with exclusive access to
/// the shared result. A later check can see everything earlier checks added.
///
/// `validate` runs on the async executor and must not block. Timeouts and
/// cancellation only take effect at `.await` points; a check that blocks past
/// its timeout still gets `CHECK_TIMEOUT` once it returns, but holds the worker
/// until then. Move heavy work to `tokio::task::spawn_blocking`.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    /// Lets a check opt out for a given input. Skipped checks are not recorded as run.
    fn should_run(&self, _data: &Value, _result: &ValidationResult) -> bool {
        true
    }

    async fn validate(&self, data: &Value, result: &mut ValidationResult) -> Result<(), CheckError>;
}

/// Converts raw source bytes into content for checks. Sets `result.data`.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Lower-case extensions with the leading dot, e.g. `".json"`.
    fn supported_extensions(&self) -> &[&'static str];

    fn process(&self, source: &Source, result: &mut ValidationResult) -> Result<(), ExtractError>;
}

/// Raw, file-like input handed to an extractor.
#[derive(Clone, Debug)]
pub struct Source {
    pub name: String,
    pub path: Option<PathBuf>,
    pub bytes: Vec<u8>,
}

impl Source {
    pub fn from_path(path: &Path, bytes: Vec<u8>) -> Self {
        Self { name: path.display().to_string(), path: Some(path.to_path_buf()), bytes }
    }

    pub fn named(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), path: None, bytes }
    }

    /// Lower-cased extension with a leading dot, if the name has one.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }

    pub fn text(&self) -> Result<&str, ExtractError> {
        std::str::from_utf8(&self.bytes).map_err(|e| ExtractError::Encoding(e.to_string()))
    }
}

pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("check misconfigured: {0}")]
    Config(String),
    #[error("upstream call failed: {0}")]
    Upstream(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{detail}")]
    Parse { code: &'static str, detail: String },
    #[error("source produced no content: {0}")]
    Empty(String),
    #[error("source is not valid utf-8: {0}")]
    Encoding(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn parse(code: &'static str, detail: impl Into<String>) -> Self {
        ExtractError::Parse { code, detail: detail.into() }
    }

    /// Message code recorded on the failed result.
    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::Parse { code, .. } => code,
            ExtractError::Empty(_) => "EXTRACT_EMPTY",
            ExtractError::Encoding(_) => "EXTRACT_ENCODING",
            ExtractError::Io(_) => "EXTRACTION_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(extension_of("Report.JSON").as_deref(), Some(".json"));
        assert_eq!(extension_of("dir/x.tar.csv").as_deref(), Some(".csv"));
        assert_eq!(extension_of("README"), None);
    }

    #[test]
    fn extract_error_codes() {
        assert_eq!(ExtractError::parse("JSON_PARSE_ERROR", "x").code(), "JSON_PARSE_ERROR");
        assert_eq!(ExtractError::Empty("a".into()).code(), "EXTRACT_EMPTY");
    }
}
