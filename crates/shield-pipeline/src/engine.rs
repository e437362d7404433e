use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use shield_core::{Check, CheckError, Extractor, Provenance, Source, ValidationResult};

use crate::cancel::{CancelToken, RunControl};
use crate::config::{PipelineConfig, UnknownExtension};

/// Validator name on messages the engine itself emits.
pub const ENGINE: &str = "pipeline";

pub const PIPELINE_ERROR: &str = "PIPELINE_ERROR";
pub const CHECK_TIMEOUT: &str = "CHECK_TIMEOUT";
pub const PIPELINE_TIMEOUT: &str = "PIPELINE_TIMEOUT";
pub const PIPELINE_CANCELLED: &str = "PIPELINE_CANCELLED";
pub const NO_EXTRACTOR: &str = "NO_EXTRACTOR";
pub const EXTRACTION_FAILED: &str = "EXTRACTION_FAILED";
pub const FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";
pub const FILE_READ_ERROR: &str = "FILE_READ_ERROR";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no extractor registered for extension {extension} (source {source_name})")]
    NoExtractor { extension: String, source_name: String },
}

/// Where the data being validated came from.
#[derive(Clone, Debug)]
pub enum SourceRef {
    /// A file on disk; read and dispatched to an extractor by extension.
    Path(PathBuf),
    /// In-memory file-like content, dispatched by the extension of `name`.
    Named { name: String, bytes: Vec<u8> },
    /// Logical identity only. The supplied data is validated as is.
    Id(String),
}

enum Outcome {
    Done(Result<(), CheckError>),
    Panicked(String),
    TimedOut(Duration),
    Cancelled,
    DeadlineExceeded,
}

/// Ordered list of checks plus extractors keyed by extension.
///
/// Registration (`add_check`, `add_extractor`, ...) takes `&mut self`, so a
/// pipeline shared across tasks behind an `Arc` is frozen by construction.
pub struct Pipeline {
    config: PipelineConfig,
    checks: Vec<Box<dyn Check>>,
    extractors: BTreeMap<String, Arc<dyn Extractor>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config, checks: vec![], extractors: BTreeMap::new() }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn with_check(mut self, check: impl Check + 'static) -> Self {
        self.add_check(Box::new(check));
        self
    }

    pub fn with_extractor(mut self, extractor: impl Extractor + 'static) -> Self {
        self.add_extractor(Arc::new(extractor));
        self
    }

    pub fn add_check(&mut self, check: Box<dyn Check>) -> &mut Self {
        debug!(check = check.name(), position = self.checks.len(), "registered check");
        self.checks.push(check);
        self
    }

    /// Registers `extractor` for every extension it supports. Later registrations win.
    pub fn add_extractor(&mut self, extractor: Arc<dyn Extractor>) -> &mut Self {
        for ext in extractor.supported_extensions() {
            self.register_extractor(ext, extractor.clone());
        }
        self
    }

    pub fn register_extractor(&mut self, extension: &str, extractor: Arc<dyn Extractor>) -> &mut Self {
        let ext = normalize_extension(extension);
        debug!(extension = %ext, extractor = extractor.name(), "registered extractor");
        self.extractors.insert(ext, extractor);
        self
    }

    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Registered extensions with the name of the extractor that handles each.
    pub fn extractor_names(&self) -> Vec<(&str, &str)> {
        self.extractors.iter().map(|(e, x)| (e.as_str(), x.name())).collect()
    }

    pub fn supports_extension(&self, extension: &str) -> bool {
        self.extractors.contains_key(&normalize_extension(extension))
    }

    pub async fn validate(&self, data: Value, source: Option<SourceRef>) -> Result<ValidationResult, PipelineError> {
        self.validate_with(data, source, &RunControl::default()).await
    }

    pub async fn validate_file(&self, path: impl AsRef<Path>) -> Result<ValidationResult, PipelineError> {
        self.validate_file_with(path, &RunControl::default()).await
    }

    pub async fn validate_file_with(
        &self,
        path: impl AsRef<Path>,
        ctl: &RunControl,
    ) -> Result<ValidationResult, PipelineError> {
        let source = SourceRef::Path(path.as_ref().to_path_buf());
        self.validate_with(Value::Null, Some(source), ctl).await
    }

    /// Runs every check in order and returns the sealed result.
    ///
    /// Check faults, timeouts and cancellation are recorded on the result. The
    /// only `Err` is an unknown extension under `UnknownExtension::Reject`.
    pub async fn validate_with(
        &self,
        data: Value,
        source: Option<SourceRef>,
        ctl: &RunControl,
    ) -> Result<ValidationResult, PipelineError> {
        let deadline = ctl.deadline.map(|d| Instant::now() + d);
        let mut result = ValidationResult::new();

        let data = match self.prepare(data, source, &mut result, ctl.cancel.as_ref(), deadline).await? {
            Some(d) => d,
            None => {
                result.complete();
                info!(result_id = %result.id(), status = %result.status(), "validation ended before checks");
                return Ok(result);
            }
        };

        if self.config.include_original_data {
            result.set_original_data(data.clone());
        }
        result.set_data(data);

        for check in &self.checks {
            let name = check.name();
            if let Some(stop) = interrupted(ctl.cancel.as_ref(), deadline) {
                record_interrupt(&mut result, stop, name);
                break;
            }

            let current = result.data().cloned().unwrap_or(Value::Null);
            if !check.should_run(&current, &result) {
                debug!(check = name, "check opted out");
                continue;
            }

            match self.run_check(check.as_ref(), &current, &mut result, ctl.cancel.as_ref(), deadline).await {
                Outcome::Done(Ok(())) => result.mark_run(name),
                Outcome::Done(Err(e)) => {
                    warn!(check = name, error = %e, "check failed");
                    result.record_fault(name, PIPELINE_ERROR, format!("check '{name}' failed: {e}"));
                }
                Outcome::Panicked(msg) => {
                    warn!(check = name, panic = %msg, "check panicked");
                    result.record_fault(name, PIPELINE_ERROR, format!("check '{name}' panicked: {msg}"));
                }
                Outcome::TimedOut(limit) => {
                    warn!(check = name, limit_ms = limit.as_millis() as u64, "check timed out");
                    result.record_fault(
                        name,
                        CHECK_TIMEOUT,
                        format!("check '{name}' exceeded {}ms", limit.as_millis()),
                    );
                }
                stop @ (Outcome::Cancelled | Outcome::DeadlineExceeded) => {
                    record_interrupt(&mut result, stop, name);
                    break;
                }
            }

            if self.config.fail_fast && result.failed() {
                debug!(check = name, status = %result.status(), "fail-fast: skipping remaining checks");
                break;
            }
        }

        result.complete();
        info!(
            result_id = %result.id(),
            status = %result.status(),
            checks = result.validators_run().len(),
            messages = result.messages().len(),
            "validation complete"
        );
        Ok(result)
    }

    /// Resolves the source into the data checks will see. `None` means the result
    /// already carries a terminal error and no checks should run.
    async fn prepare(
        &self,
        data: Value,
        source: Option<SourceRef>,
        result: &mut ValidationResult,
        cancel: Option<&CancelToken>,
        deadline: Option<Instant>,
    ) -> Result<Option<Value>, PipelineError> {
        let source = match source {
            None => return Ok(Some(data)),
            Some(SourceRef::Id(id)) => {
                result.set_provenance(Provenance::inline(id));
                return Ok(Some(data));
            }
            Some(SourceRef::Named { name, bytes }) => Source::named(name, bytes),
            Some(SourceRef::Path(path)) => match tokio::fs::read(&path).await {
                Ok(bytes) => Source::from_path(&path, bytes),
                Err(e) => {
                    let code = if e.kind() == std::io::ErrorKind::NotFound { FILE_NOT_FOUND } else { FILE_READ_ERROR };
                    warn!(path = %path.display(), error = %e, "cannot read source");
                    let mut prov = Provenance::new(path.display().to_string());
                    prov.origin_type = Some("file".to_string());
                    prov.source_path = Some(path.display().to_string());
                    result.set_provenance(prov);
                    result.record_fault(ENGINE, code, format!("cannot read {}: {e}", path.display()));
                    return Ok(None);
                }
            },
        };
        self.extract(source, data, result, cancel, deadline).await
    }

    /// Extraction is synchronous, so it runs on the blocking pool where the
    /// deadline and cancel token can still end the wait for it.
    async fn extract(
        &self,
        source: Source,
        data: Value,
        result: &mut ValidationResult,
        cancel: Option<&CancelToken>,
        deadline: Option<Instant>,
    ) -> Result<Option<Value>, PipelineError> {
        let prov = Provenance::for_file(Path::new(&source.name), &source.bytes);

        if !self.config.auto_detect_extractor {
            result.set_provenance(prov);
            if data.is_null() {
                return Ok(Some(Value::String(String::from_utf8_lossy(&source.bytes).into_owned())));
            }
            return Ok(Some(data));
        }

        let ext = source.extension();
        let Some(extractor) = ext.as_deref().and_then(|e| self.extractors.get(e)) else {
            let ext = ext.unwrap_or_else(|| "<none>".to_string());
            if self.config.unknown_extension == UnknownExtension::Reject {
                return Err(PipelineError::NoExtractor { extension: ext, source_name: source.name });
            }
            result.set_provenance(prov);
            result.record_fault(
                ENGINE,
                NO_EXTRACTOR,
                format!("no extractor registered for extension {ext} ({})", source.name),
            );
            return Ok(None);
        };

        result.set_provenance(prov.with_processor(extractor.name()));
        let name = extractor.name().to_string();
        let source_name = source.name.clone();
        let worker = {
            let extractor = Arc::clone(extractor);
            tokio::task::spawn_blocking(move || {
                let mut scratch = ValidationResult::new();
                let outcome = extractor.process(&source, &mut scratch);
                (scratch, outcome)
            })
        };

        let joined = tokio::select! {
            biased;
            _ = wait_cancel(cancel) => {
                record_interrupt(result, Outcome::Cancelled, &name);
                return Ok(None);
            }
            _ = wait_deadline(deadline) => {
                record_interrupt(result, Outcome::DeadlineExceeded, &name);
                return Ok(None);
            }
            joined = worker => joined,
        };

        match joined {
            Ok((scratch, Ok(()))) => {
                result.merge(scratch);
                match result.data() {
                    Some(d) if !d.is_null() => Ok(Some(d.clone())),
                    _ => {
                        result.record_fault(&name, EXTRACTION_FAILED, "extractor produced no content");
                        Ok(None)
                    }
                }
            }
            Ok((scratch, Err(e))) => {
                result.merge(scratch);
                warn!(extractor = %name, source = %source_name, error = %e, "extraction failed");
                result.record_fault(&name, e.code(), format!("extraction failed: {e}"));
                Ok(None)
            }
            Err(join) => {
                let msg = match join.try_into_panic() {
                    Ok(panic) => panic_message(panic.as_ref()),
                    Err(join) => join.to_string(),
                };
                warn!(extractor = %name, panic = %msg, "extractor panicked");
                result.record_fault(&name, EXTRACTION_FAILED, format!("extractor panicked: {msg}"));
                Ok(None)
            }
        }
    }

    async fn run_check(
        &self,
        check: &dyn Check,
        data: &Value,
        result: &mut ValidationResult,
        cancel: Option<&CancelToken>,
        deadline: Option<Instant>,
    ) -> Outcome {
        let guarded = AssertUnwindSafe(check.validate(data, result)).catch_unwind();
        let limit = self.config.check_timeout();
        let bounded = async move {
            let caught = match limit {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(caught) => caught,
                    Err(_) => return Outcome::TimedOut(limit),
                },
                None => guarded.await,
            };
            match caught {
                Ok(r) => Outcome::Done(r),
                Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
            }
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = wait_cancel(cancel) => Outcome::Cancelled,
            _ = wait_deadline(deadline) => Outcome::DeadlineExceeded,
            outcome = bounded => outcome,
        };

        // A check that blocks never yields to the timers above; judge it by the clock.
        if let Outcome::Done(_) = outcome {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Outcome::DeadlineExceeded;
            }
            if let Some(limit) = limit.filter(|l| started.elapsed() > *l) {
                return Outcome::TimedOut(limit);
            }
        }
        outcome
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

fn interrupted(cancel: Option<&CancelToken>, deadline: Option<Instant>) -> Option<Outcome> {
    if cancel.is_some_and(|c| c.is_cancelled()) {
        return Some(Outcome::Cancelled);
    }
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return Some(Outcome::DeadlineExceeded);
    }
    None
}

fn record_interrupt(result: &mut ValidationResult, stop: Outcome, at_check: &str) {
    let (code, what) = match stop {
        Outcome::Cancelled => (PIPELINE_CANCELLED, "cancelled"),
        _ => (PIPELINE_TIMEOUT, "deadline exceeded"),
    };
    warn!(check = at_check, code, "pipeline interrupted");
    result.record_fault(ENGINE, code, format!("pipeline {what} at check '{at_check}'"));
}

async fn wait_cancel(cancel: Option<&CancelToken>) {
    match cancel {
        Some(c) => c.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_normalized() {
        assert_eq!(normalize_extension("JSON"), ".json");
        assert_eq!(normalize_extension(".Csv"), ".csv");
    }

    #[test]
    fn panic_payloads_are_readable() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
        let p: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(p.as_ref()), "unknown panic");
    }
}
