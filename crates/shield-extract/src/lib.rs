//! Extractors that turn raw source bytes into JSON values for checks.

pub mod csv;
pub mod json;
pub mod pdf;

pub use csv::CsvExtractor;
pub use json::JsonExtractor;
pub use pdf::PdfExtractor;

use std::sync::Arc;

use shield_core::Extractor;

/// Every built-in extractor, ready to register with a pipeline.
pub fn builtin() -> Vec<Arc<dyn Extractor>> {
    vec![Arc::new(JsonExtractor::new()), Arc::new(CsvExtractor::new()), Arc::new(PdfExtractor::new())]
}
