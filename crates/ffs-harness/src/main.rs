#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ffs_harness::{EsWorkloadConfig, EsWorkloadReport, run_es_workload};
use std::env::VarError;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "FFS_LOG_FORMAT";

    fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {}={raw:?}; expected one of: human, json",
                Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(raw) => Self::parse(&raw).map(Some),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                anyhow::bail!("{} must be valid UTF-8", Self::ENV_KEY)
            }
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(default_env_filter())
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ffs-harness", about = "FrankenFS extent-status workload harness")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `FFS_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a seeded workload against one cache and verify it afterwards.
    EsWorkload {
        /// Files (trees) to open.
        #[arg(long)]
        files: Option<usize>,
        /// Operations per file.
        #[arg(long)]
        ops: Option<u64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Bound the record pool; unbounded when omitted.
        #[arg(long)]
        max_records: Option<usize>,
        /// Raise memory pressure every N operations per worker (0 = never).
        #[arg(long)]
        pressure_every: Option<u64>,
        /// Records requested per pressure signal.
        #[arg(long)]
        pressure_batch: Option<usize>,
        /// Logical blocks touched per file.
        #[arg(long)]
        logical_span: Option<u32>,
        #[arg(long)]
        threads: Option<usize>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;

    match cli.command {
        Command::EsWorkload {
            files,
            ops,
            seed,
            max_records,
            pressure_every,
            pressure_batch,
            logical_span,
            threads,
            json,
        } => {
            let defaults = EsWorkloadConfig::default();
            let config = EsWorkloadConfig {
                files: files.unwrap_or(defaults.files),
                ops: ops.unwrap_or(defaults.ops),
                seed: seed.unwrap_or(defaults.seed),
                max_records: max_records.or(defaults.max_records),
                pressure_every: pressure_every.unwrap_or(defaults.pressure_every),
                pressure_batch: pressure_batch.unwrap_or(defaults.pressure_batch),
                logical_span: logical_span.unwrap_or(defaults.logical_span),
                threads: threads.unwrap_or(defaults.threads),
            };
            info!(
                target: "ffs::harness",
                event = "es_workload_start",
                log_format = log_format.as_str(),
                files = config.files,
                ops = config.ops,
                seed = config.seed,
                threads = config.threads
            );
            let report = run_es_workload(&config).context("es-workload failed")?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize report")?
                );
            } else {
                print_report(&report);
            }
        }
    }
    Ok(())
}

fn print_report(report: &EsWorkloadReport) {
    let c = &report.counts;
    let s = &report.stats;
    println!("es-workload ok ({} us)", report.elapsed_us);
    println!(
        "  files={} ops/file={} threads={} seed={:#x} max_records={}",
        report.config.files,
        report.config.ops,
        report.config.threads,
        report.config.seed,
        report
            .config
            .max_records
            .map_or_else(|| "unbounded".to_owned(), |n| n.to_string())
    );
    println!(
        "  inserts={} hints={} removes={} alloc_failures={}",
        c.inserts, c.hints, c.removes, c.alloc_failures
    );
    println!(
        "  lookups={} hits={} hit_rate={:.1}% delayed={}/{}",
        c.lookups,
        c.lookup_hits,
        s.hit_rate() * 100.0,
        c.delayed_found,
        c.delayed_queries
    );
    println!(
        "  pressure signals={} reclaimed={} shrunk={} scans={} avg_scan={}ns max_scan={}ns",
        c.pressure_signals, c.pressure_reclaimed, s.shrunk, s.scans, s.avg_scan_ns, s.max_scan_ns
    );
    println!(
        "  records={} reclaimable={} pending_checked={}",
        report.final_records, s.reclaimable, report.pending_blocks_checked
    );
}
