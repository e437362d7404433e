use lopdf::{Dictionary, Document, Object};
use serde_json::{json, Map, Value};
use tracing::debug;

use shield_core::{ExtractError, Extractor, Source, ValidationMessage, ValidationResult};

pub const PDF_PROCESSING_ERROR: &str = "PDF_PROCESSING_ERROR";
pub const PDF_ENCRYPTED: &str = "PDF_ENCRYPTED";

/// Document-information keys and the names they are reported under.
const INFO_FIELDS: [(&str, &str); 8] = [
    ("Title", "title"),
    ("Author", "author"),
    ("Subject", "subject"),
    ("Creator", "creator"),
    ("Producer", "producer"),
    ("CreationDate", "created_at"),
    ("ModDate", "modified_at"),
    ("Keywords", "keywords"),
];

/// Extracts page text and document information from PDF files.
///
/// The data handed to checks is `{"content", "page_count", "metadata"}` with
/// pages joined by a blank line.
#[derive(Clone, Debug, Default)]
pub struct PdfExtractor {
    max_pages: Option<usize>,
}

impl PdfExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the first `n` pages are read.
    pub fn max_pages(mut self, n: usize) -> Self {
        self.max_pages = Some(n);
        self
    }
}

impl Extractor for PdfExtractor {
    fn name(&self) -> &str {
        "pdf"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &[".pdf"]
    }

    fn process(&self, source: &Source, result: &mut ValidationResult) -> Result<(), ExtractError> {
        if source.bytes.is_empty() {
            return Err(ExtractError::Empty(source.name.clone()));
        }
        let doc = Document::load_mem(&source.bytes)
            .map_err(|e| ExtractError::parse(PDF_PROCESSING_ERROR, format!("failed to read PDF: {e}")))?;
        if doc.is_encrypted() {
            return Err(ExtractError::parse(PDF_ENCRYPTED, "PDF is encrypted; password-protected files are not supported"));
        }

        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        let page_count = pages.len();
        let wanted = self.max_pages.unwrap_or(page_count).min(page_count);

        let mut texts = Vec::with_capacity(wanted);
        let mut failed_pages = vec![];
        for &n in &pages[..wanted] {
            match doc.extract_text(&[n]) {
                Ok(t) => texts.push(t.trim_end().to_string()),
                Err(e) => {
                    debug!(page = n, error = %e, "pdf page text unavailable");
                    failed_pages.push(n);
                    texts.push(String::new());
                }
            }
        }
        if wanted > 0 && failed_pages.len() == wanted {
            return Err(ExtractError::parse(PDF_PROCESSING_ERROR, "no page text could be decoded"));
        }
        let content = texts.join("\n\n");

        let info = document_info(&doc);
        result.set_meta("pdf_pages", page_count);
        result.set_meta("pdf_text_length", content.chars().count());
        if wanted < page_count {
            result.set_meta("pdf_pages_extracted", wanted);
            result.add_message(
                ValidationMessage::info("PDF_PAGES_TRUNCATED", format!("read {wanted} of {page_count} pages"))
                    .with_validator(self.name()),
            );
        }
        if !failed_pages.is_empty() {
            let list: Vec<String> = failed_pages.iter().map(u32::to_string).collect();
            result.add_message(
                ValidationMessage::warning(
                    "PDF_PAGE_ERROR",
                    format!("text could not be decoded on page(s) {}", list.join(", ")),
                )
                .with_validator(self.name()),
            );
        }
        if content.trim().is_empty() {
            result.add_message(
                ValidationMessage::warning("PDF_NO_TEXT", "PDF has no extractable text; it may be a scanned image")
                    .with_validator(self.name()),
            );
        }

        result.set_data(json!({
            "content": content,
            "page_count": page_count,
            "metadata": Value::Object(info),
        }));
        Ok(())
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
    let info = doc.trailer.get(b"Info").ok()?;
    resolve(doc, info)?.as_dict().ok()
}

fn document_info(doc: &Document) -> Map<String, Value> {
    let mut out = Map::new();
    let Some(info) = info_dictionary(doc) else {
        return out;
    };
    for (key, label) in INFO_FIELDS {
        let value = info.get(key.as_bytes()).ok().and_then(|o| resolve(doc, o));
        if let Some(Object::String(bytes, _)) = value {
            let text = decode_text(bytes);
            if !text.trim().is_empty() {
                out.insert(label.to_string(), Value::String(text));
            }
        }
    }
    out
}

/// PDF text strings are UTF-16BE with a byte-order mark, or single-byte otherwise.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xfe, 0xff]) {
        let units = rest.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
        return char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)).collect();
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
