// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Activity-Ingest command line
//!
//! Runs the queue worker and alert monitor, or ingests files directly and
//! prints a JSON summary of the run.

use activity_ingest::{
    config::Config,
    db::SqliteStore,
    models::{IngestChannel, SportType},
    services::{archive::is_zip, BackfillFilter, BatchEntry, BatchOptions, BulkOptions},
    time_utils::SystemClock,
    Engine,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "activity-ingest", version, about = "Import and analyze activity files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue worker and alert monitor until Ctrl-C
    Worker,
    /// Ingest activity files (or zip archives of them)
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Enqueue for the worker instead of processing inline
        #[arg(long)]
        queued: bool,
        /// Record metadata-only FIT files as failures rather than skips
        #[arg(long)]
        strict: bool,
    },
    /// Ingest a bulk account export
    Bulk {
        archive: PathBuf,
        /// Attach photos to their activities
        #[arg(long)]
        media: bool,
    },
    /// Print queue statistics and recent dead-lettered jobs
    QueueStatus {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Requeue dead-lettered jobs
    RequeueFailed {
        #[arg(long)]
        run: Option<u64>,
    },
    /// Re-detect climbs for stored activities
    BackfillClimbs {
        /// Only activities from this source format (fit, gpx, tcx)
        #[arg(long)]
        format: Option<String>,
        /// Only activities of this sport
        #[arg(long)]
        sport: Option<String>,
    },
    /// Regenerate auto-climb names
    RenameSegments,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let engine = Engine::new(config, store, Arc::new(SystemClock))?;

    match cli.command {
        Command::Worker => run_worker(&engine).await?,
        Command::Ingest {
            paths,
            queued,
            strict,
        } => {
            let mut entries = Vec::with_capacity(paths.len());
            for path in &paths {
                entries.push(BatchEntry::new(display_name(path), tokio::fs::read(path).await?));
            }
            let report = match (queued, entries.len()) {
                (true, 1) if !is_zip(&entries[0].filename, &entries[0].bytes) => {
                    let entry = &entries[0];
                    engine
                        .importer
                        .enqueue_file(&entry.filename, &entry.bytes, IngestChannel::Interactive)
                        .await?
                }
                (true, _) => engine.importer.enqueue_batch(entries).await?,
                (false, 1) if !strict && !is_zip(&entries[0].filename, &entries[0].bytes) => {
                    let entry = &entries[0];
                    engine
                        .importer
                        .ingest_file(&entry.filename, &entry.bytes)
                        .await?
                }
                (false, _) => {
                    let options = BatchOptions {
                        skip_metadata_only: !strict,
                    };
                    engine.importer.ingest_batch(entries, options).await?
                }
            };
            print_json(&report)?;
        }
        Command::Bulk { archive, media } => {
            let bytes = tokio::fs::read(&archive).await?;
            let report = engine
                .importer
                .ingest_bulk_archive(
                    &display_name(&archive),
                    &bytes,
                    BulkOptions {
                        attach_media: media,
                    },
                )
                .await?;
            print_json(&report)?;
        }
        Command::QueueStatus { limit } => {
            #[derive(Serialize)]
            struct Status {
                stats: activity_ingest::models::QueueStats,
                failed: Vec<activity_ingest::models::ImportJob>,
            }
            let status = Status {
                stats: engine.queue.stats().await?,
                failed: engine.queue.list_failed(limit).await?,
            };
            print_json(&status)?;
        }
        Command::RequeueFailed { run } => {
            let count = engine.queue.requeue_all_failed(run).await?;
            print_json(&serde_json::json!({ "requeued": count }))?;
        }
        Command::BackfillClimbs { format, sport } => {
            let filter = BackfillFilter {
                source_format: format,
                sport_type: sport.as_deref().map(SportType::from_label),
            };
            let report = engine.segments.backfill_climbs(&filter).await?;
            print_json(&report)?;
        }
        Command::RenameSegments => {
            let report = engine.segments.rename_segments().await?;
            print_json(&report)?;
        }
    }

    Ok(())
}

async fn run_worker(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let monitor = Arc::new(engine.alert_monitor()?);
    let worker = engine.worker.start();
    let monitor = monitor.start();
    tracing::info!(
        concurrency = engine.config.queue.concurrency,
        data_dir = %engine.config.data_dir.display(),
        "Worker running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    monitor.shutdown().await;
    worker.shutdown().await;
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize structured JSON logging on stderr.
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("activity_ingest=debug,info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();
}
