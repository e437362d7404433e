#![forbid(unsafe_code)]

//! `datashield`: validate files, route the results, and keep an audit trail.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shield_core::Status;

mod commands;
mod config;
mod report;

use commands::{AuditArgs, CheckFlags, ValidateArgs};
use config::Config;
use report::Format;

/// Usage and configuration errors.
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "datashield", version, about = "Validate, route and audit data files")]
struct Cli {
    /// Config file (default: ./datashield.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter in env-filter syntax; defaults to RUST_LOG.
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(clap::Args, Clone, Debug, Default)]
struct CheckOpts {
    /// JSON Schema file (.json, .yaml or .yml).
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Compliance rule packs to run (pii, hipaa, gdpr). Repeat or comma-separate.
    #[arg(long, value_delimiter = ',', action = ArgAction::Append)]
    rules: Vec<String>,

    /// Maximum data age, e.g. 7d, 12h, "2 weeks".
    #[arg(long)]
    max_age: Option<String>,

    /// Append results to this audit log (JSON lines).
    #[arg(long)]
    audit: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate files or directories
    Validate {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        checks: CheckOpts,

        /// Stop at the first check that fails
        #[arg(long)]
        fail_fast: bool,

        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,

        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Exit 0 even when some sources fail
        #[arg(long)]
        allow_failures: bool,
    },

    /// Poll a directory and validate each new file once
    Watch {
        dir: PathBuf,

        #[command(flatten)]
        checks: CheckOpts,

        #[arg(long, default_value_t = 1_000)]
        interval_ms: u64,
    },

    /// Query or summarise an audit log
    Audit {
        file: PathBuf,

        #[arg(long)]
        status: Option<Status>,

        #[arg(long)]
        source: Option<String>,

        /// Only entries at or after this RFC 3339 time
        #[arg(long)]
        since: Option<chrono::DateTime<chrono::Utc>>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        stats: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show version, configuration, checks, extractors and routes
    Info,
}

impl CheckOpts {
    fn flags(&self, fail_fast: bool) -> CheckFlags {
        CheckFlags {
            schema: self.schema.clone(),
            rules: self.rules.clone(),
            max_age: self.max_age.clone(),
            fail_fast,
            audit: self.audit.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    let base = Config::discover(cli.config.as_deref(), &cwd)?;

    match cli.cmd {
        Command::Validate { paths, checks, fail_fast, format, output, allow_failures } => {
            let audit_enabled = checks.audit.is_some();
            let cfg = checks.flags(fail_fast).apply(base);
            let args = ValidateArgs { paths, format, output, allow_failures, audit_enabled };
            commands::validate(&cfg, args).await
        }
        Command::Watch { dir, checks, interval_ms } => {
            let cfg = checks.flags(false).apply(base);
            commands::watch(&cfg, &dir, Duration::from_millis(interval_ms.max(10)), true).await
        }
        Command::Audit { file, status, source, since, limit, stats, json } => {
            commands::audit_report(AuditArgs { file, status, source, since, limit, stats, json })
        }
        Command::Info => commands::info(&base),
    }
}
