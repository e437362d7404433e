use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use shield_audit::{AuditConfig, AuditError, AuditOverrides, AuditQuery, AuditTrail};
use shield_checks::{ComplianceCheck, FreshnessCheck, SchemaCheck, RULE_PACKS};
use shield_core::{MetaValue, Metadata, Status};
use shield_pipeline::{CancelToken, Pipeline, PipelineOverrides, RunControl};
use shield_router::Router;

use crate::config::{expand, Config};
use crate::report::{self, Format, Outcome};

/// Exit status when every source passed or only warned.
pub const EXIT_OK: u8 = 0;
/// Exit status when any source failed or errored.
pub const EXIT_FAILED: u8 = 1;

/// Flags shared by `validate` and `watch` that layer over the config file.
#[derive(Clone, Debug, Default)]
pub struct CheckFlags {
    pub schema: Option<PathBuf>,
    pub rules: Vec<String>,
    pub max_age: Option<String>,
    pub fail_fast: bool,
    pub audit: Option<PathBuf>,
}

impl CheckFlags {
    pub fn apply(&self, mut cfg: Config) -> Config {
        let po = PipelineOverrides { fail_fast: self.fail_fast.then_some(true), ..Default::default() };
        cfg.pipeline = cfg.pipeline.merged(&po);
        if let Some(s) = &self.schema {
            cfg.checks.schema = Some(expand(s));
        }
        if !self.rules.is_empty() {
            cfg.checks.rules = self.rules.clone();
        }
        if self.max_age.is_some() {
            cfg.checks.max_age = self.max_age.clone();
        }
        let ao = AuditOverrides { path: self.audit.as_deref().map(expand), ..Default::default() };
        cfg.audit = cfg.audit.merged(&ao);
        cfg
    }
}

/// Builds the pipeline described by `cfg`: built-in extractors plus schema,
/// freshness and compliance checks when configured.
pub fn build_pipeline(cfg: &Config) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new(cfg.pipeline.clone());
    for e in shield_extract::builtin() {
        pipeline.add_extractor(e);
    }
    if let Some(path) = &cfg.checks.schema {
        let schema = SchemaCheck::from_file(path).with_context(|| format!("load schema {}", path.display()))?;
        pipeline.add_check(Box::new(schema));
    }
    if let Some(age) = &cfg.checks.max_age {
        let mut freshness = FreshnessCheck::parse(age).context("invalid max_age")?;
        if !cfg.checks.timestamp_fields.is_empty() {
            freshness = freshness.with_fields(cfg.checks.timestamp_fields.clone());
        }
        pipeline.add_check(Box::new(freshness));
    }
    if !cfg.checks.rules.is_empty() {
        let compliance = ComplianceCheck::from_names(&cfg.checks.rules)?.with_config(cfg.checks.compliance.clone());
        pipeline.add_check(Box::new(compliance));
    }
    Ok(pipeline)
}

pub fn build_router(cfg: &Config) -> Result<Router> {
    Router::from_config(&cfg.router).context("invalid router configuration")
}

/// Files under `paths`; directories are walked for supported extensions.
/// Explicit files are kept whatever their extension.
pub fn collect_sources(paths: &[PathBuf], pipeline: &Pipeline) -> Result<Vec<PathBuf>> {
    let mut out = vec![];
    for p in paths {
        if p.is_dir() {
            walk(p, pipeline, &mut out).with_context(|| format!("read directory {}", p.display()))?;
        } else if p.exists() {
            out.push(p.clone());
        } else {
            bail!("no such file or directory: {}", p.display());
        }
    }
    Ok(out)
}

fn walk(dir: &Path, pipeline: &Pipeline, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?.map(|e| e.map(|e| e.path())).collect::<Result<_, _>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk(&path, pipeline, out)?;
        } else if supported(&path, pipeline) {
            out.push(path);
        }
    }
    Ok(())
}

fn supported(path: &Path, pipeline: &Pipeline) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| pipeline.supports_extension(e))
}

fn routing_metadata(o: &Outcome) -> Metadata {
    let mut extra = Metadata::new();
    extra.insert("route".into(), MetaValue::from(o.decision.route.as_str()));
    extra.insert("action".into(), MetaValue::from(o.decision.action.as_str()));
    if let Some(d) = &o.decision.destination {
        extra.insert("destination".into(), MetaValue::from(d.as_str()));
    }
    extra
}

async fn run_one(pipeline: &Pipeline, router: &Router, path: &Path, ctl: &RunControl) -> Result<Outcome> {
    let result = pipeline.validate_file_with(path, ctl).await?;
    let decision = router.route(&result);
    Ok(Outcome { path: path.to_path_buf(), result, decision })
}

/// Records `o`. A write that failed but left the entry queued is retried by the
/// next flush, so only entries that were refused outright are errors.
fn audit(trail: Option<&AuditTrail>, o: &Outcome) -> Result<()> {
    let Some(trail) = trail else {
        return Ok(());
    };
    match trail.log(&o.result, Some(&routing_metadata(o))) {
        Ok(_) => Ok(()),
        Err(AuditError::FlushPending { pending, source }) => {
            warn!(path = %o.path.display(), pending, error = %source, "audit write failed; entries stay queued");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("audit {}", o.path.display())),
    }
}

pub struct ValidateArgs {
    pub paths: Vec<PathBuf>,
    pub format: Format,
    pub output: Option<PathBuf>,
    pub allow_failures: bool,
    pub audit_enabled: bool,
}

pub async fn validate(cfg: &Config, args: ValidateArgs) -> Result<ExitCode> {
    let pipeline = build_pipeline(cfg)?;
    let router = build_router(cfg)?;
    let sources = collect_sources(&args.paths, &pipeline)?;
    if sources.is_empty() {
        bail!("no supported files found");
    }
    let trail = if args.audit_enabled { Some(AuditTrail::open(cfg.audit.clone())?) } else { None };

    let ctl = RunControl::default();
    let mut outcomes = Vec::with_capacity(sources.len());
    let mut audit_failure = None;
    for path in &sources {
        let o = run_one(&pipeline, &router, path, &ctl).await?;
        if let Err(e) = audit(trail.as_ref(), &o) {
            audit_failure.get_or_insert(e);
        }
        outcomes.push(o);
    }
    if let Some(trail) = &trail {
        if let Err(e) = trail.flush() {
            audit_failure.get_or_insert(anyhow::Error::new(e).context("flush audit trail"));
        }
    }

    let text = report::render(&outcomes, args.format)?;
    match &args.output {
        Some(path) => std::fs::write(path, &text).with_context(|| format!("write {}", path.display()))?,
        None => print!("{text}"),
    }
    // The report is still written; an incomplete audit log fails the run.
    if let Some(e) = audit_failure {
        return Err(e);
    }

    let failing = outcomes.iter().any(|o| o.result.status().is_failing());
    Ok(ExitCode::from(if failing && !args.allow_failures { EXIT_FAILED } else { EXIT_OK }))
}

/// Polls `dir` until Ctrl-C.
pub async fn watch(cfg: &Config, dir: &Path, interval: Duration, audit_enabled: bool) -> Result<ExitCode> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            cancel.cancel();
        });
    }
    watch_until(cfg, dir, interval, audit_enabled, cancel).await?;
    Ok(ExitCode::from(EXIT_OK))
}

/// Validates, routes and audits each new supported file under `dir` once, until
/// `cancel` fires. Returns how many files were processed.
pub async fn watch_until(
    cfg: &Config,
    dir: &Path,
    interval: Duration,
    audit_enabled: bool,
    cancel: CancelToken,
) -> Result<usize> {
    if !dir.is_dir() {
        bail!("not a directory: {}", dir.display());
    }
    let pipeline = build_pipeline(cfg)?;
    let router = build_router(cfg)?;
    let trail = if audit_enabled { Some(AuditTrail::open(cfg.audit.clone())?) } else { None };
    let ctl = RunControl::with_cancel(cancel.clone());

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut tick = tokio::time::interval(interval);
    info!(dir = %dir.display(), interval_ms = interval.as_millis() as u64, "watching");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let files = collect_sources(&[dir.to_path_buf()], &pipeline)?;
        for path in files {
            if seen.contains(&path) {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }
            let o = run_one(&pipeline, &router, &path, &ctl).await?;
            println!("{}", report::line(&o));
            audit(trail.as_ref(), &o)?;
            seen.insert(path);
        }
    }

    if let Some(trail) = &trail {
        let n = trail.flush().context("flush audit trail")?;
        info!(flushed = n, "audit trail flushed");
    }
    Ok(seen.len())
}

pub struct AuditArgs {
    pub file: PathBuf,
    pub status: Option<Status>,
    pub source: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<usize>,
    pub stats: bool,
    pub json: bool,
}

pub fn audit_report(args: AuditArgs) -> Result<ExitCode> {
    let path = expand(&args.file);
    if !path.is_file() {
        bail!("audit log not found: {}", path.display());
    }
    // A `.gz` suffix selects the gzip reader.
    let trail = AuditTrail::open_read_only(AuditConfig { path, ..Default::default() });

    if args.stats {
        let stats = trail.stats()?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            print!("{}", report::stats_text(&stats));
        }
        return Ok(ExitCode::from(EXIT_OK));
    }

    let mut q = AuditQuery::new();
    if let Some(s) = args.status {
        q = q.status(s);
    }
    if let Some(src) = args.source {
        q = q.source_id(src);
    }
    if let Some(t) = args.since {
        q = q.since(t);
    }
    if let Some(n) = args.limit {
        q = q.limit(n);
    }
    for entry in trail.query(&q)? {
        let entry = entry?;
        if args.json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            println!("{}", report::entry_line(&entry));
        }
    }
    Ok(ExitCode::from(EXIT_OK))
}

pub fn info(cfg: &Config) -> Result<ExitCode> {
    let pipeline = build_pipeline(cfg)?;
    let router = build_router(cfg)?;
    println!("datashield {}", env!("CARGO_PKG_VERSION"));
    println!("\nchecks:");
    for name in pipeline.check_names() {
        println!("  {name}");
    }
    println!("\nextractors:");
    for (ext, name) in pipeline.extractor_names() {
        println!("  {ext:<8} {name}");
    }
    println!("\nrule packs: {}", RULE_PACKS.join(", "));
    println!("\nroutes:");
    for r in router.routes() {
        println!("  {} -> {}", r.name, r.action);
    }
    println!("  (default) PASSED/WARNING -> PASS, FAILED/ERROR -> QUARANTINE, SKIPPED -> DROP");
    println!("\nconfiguration:\n{}", cfg.to_toml()?);
    Ok(ExitCode::from(EXIT_OK))
}
