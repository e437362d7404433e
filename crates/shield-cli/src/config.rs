use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use shield_audit::AuditConfig;
use shield_checks::ComplianceConfig;
use shield_pipeline::PipelineConfig;
use shield_router::RouterConfig;

pub const CONFIG_FILE: &str = "datashield.toml";

/// Contents of `datashield.toml`. Every section is optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub router: RouterConfig,
    pub audit: AuditConfig,
    pub checks: ChecksConfig,
}

/// Which built-in checks to run, in this order: schema, freshness, compliance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChecksConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<PathBuf>,
    /// e.g. "7d", "12 hours".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    /// Empty uses the freshness check's defaults.
    pub timestamp_fields: Vec<String>,
    /// Compliance rule packs: pii, hipaa, gdpr.
    pub rules: Vec<String>,
    pub compliance: ComplianceConfig,
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        cfg.expand_paths();
        Ok(cfg)
    }

    /// `explicit` must exist; otherwise `datashield.toml` in `dir` is used when
    /// present, and built-in defaults when not.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }
        let candidate = Self::config_path(dir);
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "using config file");
            return Self::load_from(&candidate);
        }
        let mut cfg = Self::default();
        cfg.expand_paths();
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize config")
    }

    pub fn config_path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    fn expand_paths(&mut self) {
        self.audit.path = expand(&self.audit.path);
        if let Some(schema) = &self.checks.schema {
            self.checks.schema = Some(expand(schema));
        }
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}
