use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where validated data came from. Attached once when a result is created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    /// SHA-256 of the raw source bytes, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processor_chain: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            origin_type: None,
            source_path: None,
            checksum: None,
            processor_chain: vec![],
            created_at: Utc::now(),
        }
    }

    pub fn inline(source_id: impl Into<String>) -> Self {
        Self { origin_type: Some("inline".to_string()), ..Self::new(source_id) }
    }

    /// Provenance for file-like input: identity is the path, checksum covers `bytes`.
    pub fn for_file(path: &Path, bytes: &[u8]) -> Self {
        let p = path.display().to_string();
        Self {
            origin_type: Some("file".to_string()),
            source_path: Some(p.clone()),
            checksum: Some(sha256_hex(bytes)),
            ..Self::new(p)
        }
    }

    pub fn with_processor(mut self, name: impl Into<String>) -> Self {
        self.processor_chain.push(name.into());
        self
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
