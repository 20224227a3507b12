use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{fmt, EnvFilter};

use profile_exporter::config::Config;
use profile_exporter::health::HealthMetrics;
use profile_exporter::profile::Sample;
use profile_exporter::scheduler::ExportScheduler;
use profile_exporter::{ExportReport, ExporterSettings, ProfileExporter};

/// Per-application profile accumulation and export.
#[derive(Parser)]
#[command(name = "profile-exporter", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Validate the configuration and print the resolved endpoint.
    Check,
    /// Ingest NDJSON sample records from a file, export once and exit.
    Replay {
        /// File with one `{"application_id": ..., "sample": ...}` per line.
        #[arg(short, long)]
        input: PathBuf,

        /// Ingestion threads.
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Ingest NDJSON sample records from stdin and export periodically
    /// until EOF or a shutdown signal.
    Run,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

/// One line of replay input.
#[derive(Debug, Deserialize)]
struct SampleRecord {
    application_id: String,
    sample: Sample,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("profile-exporter {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Command::Version => Ok(()),
        Command::Check => {
            let settings = ExporterSettings::from_config(&cfg)?;
            println!("configuration ok");
            println!("endpoint: {}", settings.endpoint);
            println!("sample types: {}", settings.profilers.tag_value());
            for tag in &settings.base_tags {
                println!("tag: {tag}");
            }
            Ok(())
        }
        Command::Replay { input, workers } => rt.block_on(replay(cfg, &input, workers)),
        Command::Run => rt.block_on(run(cfg)),
    }
}

/// Builds the exporter and, when enabled, starts the health server.
async fn build_exporter(cfg: &Config) -> Result<(Arc<ProfileExporter>, Option<Arc<HealthMetrics>>)> {
    let settings = ExporterSettings::from_config(cfg)?;
    let mut exporter = ProfileExporter::new(settings)?;

    let metrics = if cfg.health.enabled {
        let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
        metrics.start().await?;
        exporter = exporter.with_metrics(Arc::clone(&metrics));
        Some(metrics)
    } else {
        None
    };

    Ok((Arc::new(exporter), metrics))
}

fn parse_record(line: &str, line_no: usize) -> Option<SampleRecord> {
    match serde_json::from_str::<SampleRecord>(line) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(line = line_no, error = %e, "skipping malformed record");
            None
        }
    }
}

async fn replay(cfg: Config, input: &Path, workers: usize) -> Result<()> {
    let data = std::fs::read_to_string(input)
        .with_context(|| format!("reading replay input {}", input.display()))?;

    let records: Vec<SampleRecord> = data
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(i, line)| parse_record(line, i + 1))
        .collect();

    let (exporter, metrics) = build_exporter(&cfg).await?;

    let workers = workers.max(1);
    let accepted: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let exporter = &exporter;
                let records = &records;
                s.spawn(move || {
                    records
                        .iter()
                        .skip(w)
                        .step_by(workers)
                        .filter(|r| exporter.add_sample(&r.application_id, &r.sample))
                        .count()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(0))
            .sum()
    });

    tracing::info!(
        records = records.len(),
        accepted,
        workers,
        "replay ingestion complete",
    );

    let report = exporter.export().await;
    if let Some(metrics) = metrics {
        metrics.stop();
    }
    print_report(&report);

    if !report.is_success() {
        bail!(
            "{} of {} application exports failed",
            report.failures().count(),
            report.outcomes.len()
        );
    }
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let (exporter, metrics) = build_exporter(&cfg).await?;
    let scheduler = ExportScheduler::start(Arc::clone(&exporter), cfg.export.interval)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        delivery = exporter.delivery_name(),
        "profile exporter running",
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => {
                        line_no += 1;
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Some(record) = parse_record(&line, line_no) {
                            exporter.add_sample(&record.application_id, &record.sample);
                        }
                    }
                    None => {
                        tracing::info!("input closed, shutting down");
                        break;
                    }
                }
            }
        }
    }

    let report = scheduler.stop().await?;
    if let Some(metrics) = metrics {
        metrics.stop();
    }
    print_report(&report);

    tracing::info!("profile exporter stopped");
    Ok(())
}

fn print_report(report: &ExportReport) {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(()) => println!(
                "{} export={} samples={} bytes={} ok",
                outcome.application_id,
                outcome.export_index,
                outcome.sample_count,
                outcome.payload_bytes
            ),
            Err(e) => println!(
                "{} export={} samples={} failed: {e}",
                outcome.application_id, outcome.export_index, outcome.sample_count
            ),
        }
    }
}
