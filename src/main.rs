// =============================================================================
// Coinlake — Main Entry Point
// =============================================================================
//
// Hourly market snapshot pipeline in two stages: `ingest` pulls one snapshot
// from the upstream API and lands it in the raw and normalized layers;
// `materialize` folds a completed hour window into the analytical layer
// exactly once.  Built to be driven by cron or any scheduler: every outcome
// is one JSON line on stdout, logs go to stderr, and the exit code tells the
// scheduler what happened (0 ok, 2 window not ready yet, 1 failed).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod archive;
mod config;
mod failure;
mod ingest;
mod lake;
mod market;
mod snapshot;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::archive::{FsPartitionStore, FsRawArchive};
use crate::config::PipelineConfig;
use crate::failure::FailureSink;
use crate::ingest::Ingestor;
use crate::lake::{
    LocalQueryEngine, MaterializeError, Materializer, ProvenanceLog, TemplateStore,
};
use crate::market::MarketClient;
use crate::types::FetchWindow;

const EXIT_FAILURE: i32 = 1;
/// Distinct exit code for a window whose hour has not elapsed, so a scheduler
/// can retry later instead of alerting.
const EXIT_WINDOW_NOT_READY: i32 = 2;

#[derive(Parser)]
#[command(
    name = "coinlake",
    version,
    about = "Hourly market snapshot ingestion and materialization"
)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, global = true, env = "COINLAKE_CONFIG", default_value = "coinlake.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one snapshot and write the raw and normalized layers.
    Ingest {
        /// Pin the effective fetch instant (RFC 3339), e.g. for replays.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Materialize one completed hour window into the analytical layer.
    Materialize {
        /// Window to materialize, in the form YYYY-MM-DDTHH (UTC).
        #[arg(long, conflicts_with = "previous")]
        window: Option<String>,

        /// Materialize the most recent completed hour (the default when no
        /// window is given).
        #[arg(long)]
        previous: bool,
    },

    /// Materialize an inclusive range of windows, continuing past failures.
    Backfill {
        /// First window of the range (YYYY-MM-DDTHH, UTC).
        #[arg(long)]
        from: String,

        /// Last window of the range (YYYY-MM-DDTHH, UTC).
        #[arg(long)]
        to: String,
    },

    /// Show recent materializations and failure events.
    Status {
        /// How many records of each log to show.
        #[arg(long, default_value_t = 10)]
        tail: usize,

        /// Show every materialization of one window (YYYY-MM-DDTHH, UTC)
        /// instead of the tail.
        #[arg(long)]
        window: Option<String>,
    },

    /// Write a config file with the default settings.
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    // stdout carries the JSON run reports; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── 2. Config & dispatch ─────────────────────────────────────────────
    let cli = Cli::parse();

    // `init` creates the config file; every other command loads it.
    let code = match cli.command {
        Command::Ingest { at } => run_ingest(&load_config(&cli.config)?, at).await?,
        Command::Materialize { window, previous } => {
            run_materialize(&load_config(&cli.config)?, window, previous).await?
        }
        Command::Backfill { from, to } => {
            run_backfill(&load_config(&cli.config)?, &from, &to).await?
        }
        Command::Status { tail, window } => run_status(&load_config(&cli.config)?, tail, window)?,
        Command::Init => run_init(&cli.config)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

// ── Subcommands ──────────────────────────────────────────────────────────────

async fn run_ingest(config: &PipelineConfig, at: Option<DateTime<Utc>>) -> anyhow::Result<i32> {
    let sink = FailureSink::spawn(
        config.storage.failures_path(),
        config.storage.failure_ring_capacity,
    );
    let ingestor = Ingestor::new(
        Arc::new(MarketClient::new(config.api.clone(), config.retry.clone())),
        Arc::new(FsRawArchive::new(config.storage.raw_dir())),
        Arc::new(FsPartitionStore::new(
            config.storage.normalized_dir(),
            config.storage.zstd_level,
        )),
        sink.clone(),
    );

    let result = ingestor.run(at).await;
    sink.shutdown().await;

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string(&report)?);
            Ok(0)
        }
        Err(err) => {
            error!(error = %err, "ingest run failed");
            Ok(EXIT_FAILURE)
        }
    }
}

async fn run_materialize(
    config: &PipelineConfig,
    window: Option<String>,
    previous: bool,
) -> anyhow::Result<i32> {
    let now = Utc::now();
    let window = match window {
        Some(s) => FetchWindow::parse(&s).map_err(|e| anyhow::anyhow!(e))?,
        None => {
            let w = FetchWindow::previous_completed(now);
            if !previous {
                info!(window = %w, "no window given, defaulting to the previous hour");
            }
            w
        }
    };

    let sink = FailureSink::spawn(
        config.storage.failures_path(),
        config.storage.failure_ring_capacity,
    );
    let materializer = build_materializer(config, &sink)?;
    let result = materializer.materialize(window, now).await;
    sink.shutdown().await;

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string(&report)?);
            Ok(0)
        }
        Err(err @ MaterializeError::WindowNotReady { .. }) => {
            warn!(error = %err, "window not ready");
            Ok(EXIT_WINDOW_NOT_READY)
        }
        Err(err) => {
            error!(error = %err, "materialization failed");
            Ok(EXIT_FAILURE)
        }
    }
}

async fn run_backfill(config: &PipelineConfig, from: &str, to: &str) -> anyhow::Result<i32> {
    let from = FetchWindow::parse(from).map_err(|e| anyhow::anyhow!(e))?;
    let to = FetchWindow::parse(to).map_err(|e| anyhow::anyhow!(e))?;
    anyhow::ensure!(from <= to, "backfill range is inverted: {from} is after {to}");

    let sink = FailureSink::spawn(
        config.storage.failures_path(),
        config.storage.failure_ring_capacity,
    );
    let materializer = build_materializer(config, &sink)?;

    let mut failed = 0usize;
    let mut window = from;
    loop {
        match materializer.materialize(window, Utc::now()).await {
            Ok(report) => println!("{}", serde_json::to_string(&report)?),
            Err(err) => {
                failed += 1;
                error!(window = %window, error = %err, "backfill window failed, continuing");
                println!(
                    "{}",
                    json!({ "window": window.to_string(), "error": err.to_string() })
                );
            }
        }
        if window == to {
            break;
        }
        window = window.next();
    }
    sink.shutdown().await;

    if failed > 0 {
        warn!(failed, "backfill finished with failures");
        return Ok(EXIT_FAILURE);
    }
    info!("backfill complete");
    Ok(0)
}

fn run_status(
    config: &PipelineConfig,
    tail: usize,
    window: Option<String>,
) -> anyhow::Result<i32> {
    let log = ProvenanceLog::new(config.storage.provenance_path());
    let materializations = match &window {
        Some(s) => {
            let window = FetchWindow::parse(s).map_err(|e| anyhow::anyhow!(e))?;
            log.for_window(&window)?
        }
        None => log.tail(tail)?,
    };
    let failures = failure::read_recent(&config.storage.failures_path(), tail);

    println!(
        "{}",
        serde_json::to_string(&json!({
            "materializations": materializations,
            "failures": failures,
        }))?
    );
    Ok(0)
}

fn run_init(path: &Path) -> anyhow::Result<i32> {
    anyhow::ensure!(
        !path.exists(),
        "config file {} already exists, not overwriting it",
        path.display()
    );
    PipelineConfig::default().save(path)?;
    info!(path = %path.display(), "default config written");
    println!("{}", serde_json::to_string(&json!({ "config": path }))?);
    Ok(0)
}

// ── Shared construction ──────────────────────────────────────────────────────

fn load_config(path: &Path) -> anyhow::Result<PipelineConfig> {
    Ok(PipelineConfig::load_or_default(path)?.with_env_overrides())
}

fn build_materializer(config: &PipelineConfig, sink: &FailureSink) -> anyhow::Result<Materializer> {
    let statements = Arc::new(TemplateStore::from_config(&config.lake)?);
    let store = Arc::new(FsPartitionStore::new(
        config.storage.normalized_dir(),
        config.storage.zstd_level,
    ));
    let engine = Arc::new(LocalQueryEngine::new(
        store,
        config.storage.analytical_dir(),
        Duration::from_secs(config.storage.lock_stale_secs),
    ));
    Ok(Materializer::new(
        statements,
        engine,
        ProvenanceLog::new(config.storage.provenance_path()),
        sink.clone(),
    ))
}
