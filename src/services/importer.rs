// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Import orchestration.
//!
//! Every physical file gets an [`ImportFileRecord`] inside an [`ImportRun`].
//! Synchronous entrypoints process files inline; queued entrypoints store
//! the raw bytes and enqueue a job that the queue worker later hands to
//! [`ImportService::process_job`]. Errors are recorded against the file
//! they belong to and never abort the rest of a batch; run counters and
//! status are always recomputed from the file records.

use crate::config::{ArchiveLimits, Config};
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::{
    Activity, ActivityMedia, ImportFileRecord, ImportFileStatus, ImportJob, ImportRun,
    IngestChannel, JobStatus, NewActivity, NewImportFile, NewImportJob, ParsedActivity, RunKind,
    SportType, StagedMedia,
};
use crate::parsers;
use crate::services::archive::{self, basename, ArchiveEntry};
use crate::services::dedup::{activity_fingerprint, content_hash};
use crate::services::detect::{detect, FileFormat};
use crate::services::hints::{self, MetadataSheet};
use crate::services::segments::SegmentService;
use crate::services::storage::FileStorage;
use crate::time_utils::Clock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Terminal result of handling one file.
///
/// Duplicates are successful outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportOutcome {
    Imported {
        activity_id: u64,
    },
    /// Byte-identical to an earlier file
    DuplicateFile {
        original_file_id: u64,
        activity_id: Option<u64>,
    },
    /// Same real-world activity as an existing one
    DuplicateActivity {
        activity_id: u64,
    },
    Skipped {
        reason: String,
    },
    /// Bulk metadata sheet applied
    HintsApplied {
        hints: usize,
        activities_updated: usize,
    },
    MediaAttached {
        activity_id: u64,
    },
    /// Media kept until its activity is imported
    MediaStaged {
        external_id: String,
    },
    Queued {
        job_id: u64,
    },
    Failed {
        error: String,
    },
}

impl ImportOutcome {
    pub fn file_status(&self) -> ImportFileStatus {
        match self {
            ImportOutcome::Imported { .. }
            | ImportOutcome::HintsApplied { .. }
            | ImportOutcome::MediaAttached { .. }
            | ImportOutcome::MediaStaged { .. } => ImportFileStatus::Ok,
            ImportOutcome::DuplicateFile { .. } | ImportOutcome::DuplicateActivity { .. } => {
                ImportFileStatus::SkippedDuplicate
            }
            ImportOutcome::Skipped { .. } => ImportFileStatus::Skipped,
            ImportOutcome::Queued { .. } => ImportFileStatus::Queued,
            ImportOutcome::Failed { .. } => ImportFileStatus::Failed,
        }
    }
}

/// Outcome for one file of a run. Media files in a bulk export have no record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub file_id: Option<u64>,
    pub filename: String,
    #[serde(flatten)]
    pub outcome: ImportOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run: ImportRun,
    pub files: Vec<FileReport>,
}

/// One file handed to a batch entrypoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl BatchEntry {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Record metadata-only binary files as skipped instead of failed
    pub skip_metadata_only: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            skip_metadata_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Bind image files to activities by the external id in their path
    pub attach_media: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct ProcessOptions {
    skip_metadata_only: bool,
    /// Unsupported entries are skipped (bulk exports carry unrelated files)
    skip_unsupported: bool,
    /// Take the external id from the archive path when nothing else supplies one
    external_id_from_path: bool,
}

/// Recompute a run's counters and status from its file records.
pub(crate) async fn refresh_run(
    store: &dyn Store,
    run_id: u64,
    now: DateTime<Utc>,
) -> Result<ImportRun> {
    let mut run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("import run {}", run_id)))?;
    let files = store.list_files_for_run(run_id).await?;
    run.summarize(&files, now);
    store.update_run(&run).await?;
    Ok(run)
}

/// Basename without extensions, used when a file carries no activity name.
fn fallback_name(filename: &str) -> String {
    let base = basename(filename);
    let stem = base.split('.').next().unwrap_or(base).trim();
    if stem.is_empty() {
        "Activity".to_string()
    } else {
        stem.to_string()
    }
}

/// Import orchestrator.
pub struct ImportService {
    store: Arc<dyn Store>,
    storage: FileStorage,
    segments: Arc<SegmentService>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    batch_limits: ArchiveLimits,
    bulk_limits: ArchiveLimits,
}

impl ImportService {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        storage: FileStorage,
        segments: Arc<SegmentService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            storage,
            segments,
            clock,
            max_attempts: config.queue.max_attempts,
            batch_limits: config.batch_limits,
            bulk_limits: config.bulk_limits,
        }
    }

    // Synchronous entrypoints

    /// Ingest one file inline.
    pub async fn ingest_file(&self, filename: &str, bytes: &[u8]) -> Result<RunReport> {
        let run = self
            .store
            .create_run(RunKind::Single, filename, self.clock.now())
            .await?;
        let options = ProcessOptions::default();
        let report = self.ingest_record(&run, filename, bytes, options).await;
        self.finish_run(run.id, vec![report]).await
    }

    /// Ingest several files inline, expanding zip archives.
    pub async fn ingest_batch(
        &self,
        entries: Vec<BatchEntry>,
        options: BatchOptions,
    ) -> Result<RunReport> {
        let label = format!("batch of {} files", entries.len());
        let run = self
            .store
            .create_run(RunKind::Batch, &label, self.clock.now())
            .await?;
        let process = ProcessOptions {
            skip_metadata_only: options.skip_metadata_only,
            ..ProcessOptions::default()
        };

        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            if !archive::is_zip(&entry.filename, &entry.bytes) {
                reports.push(
                    self.ingest_record(&run, &entry.filename, &entry.bytes, process)
                        .await,
                );
                continue;
            }
            match archive::extract(&entry.filename, &entry.bytes, self.batch_limits) {
                Ok(inner) => {
                    for item in inner {
                        let name = format!("{}/{}", entry.filename, item.path);
                        reports.push(self.ingest_record(&run, &name, &item.bytes, process).await);
                    }
                }
                Err(e) => {
                    reports.push(
                        self.record_failed_file(&run, &entry.filename, &entry.bytes, e)
                            .await,
                    );
                }
            }
        }

        self.finish_run(run.id, reports).await
    }

    /// Ingest a bulk account export.
    ///
    /// The metadata sheet is applied first so new activities pick up its
    /// names, then activity files, then (optionally) media, which attach to
    /// activities by external id or are staged until the activity arrives.
    pub async fn ingest_bulk_archive(
        &self,
        archive_name: &str,
        bytes: &[u8],
        options: BulkOptions,
    ) -> Result<RunReport> {
        let run = self
            .store
            .create_run(RunKind::BulkArchive, archive_name, self.clock.now())
            .await?;

        let entries = match archive::extract(archive_name, bytes, self.bulk_limits) {
            Ok(entries) => entries,
            Err(e) => {
                let report = self.record_failed_file(&run, archive_name, bytes, e).await;
                return self.finish_run(run.id, vec![report]).await;
            }
        };

        let (sheets, rest): (Vec<ArchiveEntry>, Vec<ArchiveEntry>) = entries
            .into_iter()
            .partition(|e| hints::is_metadata_sheet(&e.path));
        let (media, activities): (Vec<ArchiveEntry>, Vec<ArchiveEntry>) =
            rest.into_iter().partition(|e| archive::is_media(&e.path));

        let process = ProcessOptions {
            skip_metadata_only: true,
            skip_unsupported: true,
            external_id_from_path: true,
        };
        let mut reports = Vec::new();
        let mut media_ids = MetadataSheet::default().media;

        for sheet in sheets {
            let report = self.ingest_record(&run, &sheet.path, &sheet.bytes, process).await;
            if matches!(report.outcome, ImportOutcome::HintsApplied { .. }) {
                // The sheet parsed once already; this second pass only collects the media map
                if let Ok(detected) = detect(&sheet.path, &sheet.bytes) {
                    if let Ok(parsed) = hints::parse_sheet(&detected.bytes, self.clock.now()) {
                        media_ids.extend(parsed.media);
                    }
                }
            }
            reports.push(report);
        }

        for entry in activities {
            reports.push(self.ingest_record(&run, &entry.path, &entry.bytes, process).await);
        }

        if options.attach_media {
            for entry in media {
                let external_id = media_ids
                    .get(&basename(&entry.path).to_ascii_lowercase())
                    .cloned()
                    .or_else(|| archive::external_id_from_path(&entry.path));
                let outcome = match external_id {
                    Some(id) => match self.attach_media(&id, &entry).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::warn!(path = %entry.path, error = %e, "Failed to attach media");
                            ImportOutcome::Failed {
                                error: e.to_record(),
                            }
                        }
                    },
                    None => ImportOutcome::Skipped {
                        reason: "no activity id for media file".to_string(),
                    },
                };
                reports.push(FileReport {
                    file_id: None,
                    filename: entry.path,
                    outcome,
                });
            }
        }

        self.finish_run(run.id, reports).await
    }

    // Queued entrypoints

    /// Store one file and enqueue it for the worker.
    pub async fn enqueue_file(
        &self,
        filename: &str,
        bytes: &[u8],
        channel: IngestChannel,
    ) -> Result<RunReport> {
        let kind = match channel {
            IngestChannel::Interactive => RunKind::Single,
            IngestChannel::Batch => RunKind::Batch,
            IngestChannel::WatchFolder => RunKind::WatchFolder,
        };
        let run = self
            .store
            .create_run(kind, filename, self.clock.now())
            .await?;
        let report = self.enqueue_record(&run, filename, bytes, channel).await;
        self.finish_run(run.id, vec![report]).await
    }

    /// Entry point for the watch-folder producer, which has already debounced the file.
    pub async fn ingest_watch_file(&self, filename: &str, bytes: &[u8]) -> Result<RunReport> {
        self.enqueue_file(filename, bytes, IngestChannel::WatchFolder)
            .await
    }

    /// Store and enqueue several files, expanding zip archives.
    pub async fn enqueue_batch(&self, entries: Vec<BatchEntry>) -> Result<RunReport> {
        let label = format!("batch of {} files", entries.len());
        let run = self
            .store
            .create_run(RunKind::Batch, &label, self.clock.now())
            .await?;

        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            if !archive::is_zip(&entry.filename, &entry.bytes) {
                reports.push(
                    self.enqueue_record(&run, &entry.filename, &entry.bytes, IngestChannel::Batch)
                        .await,
                );
                continue;
            }
            match archive::extract(&entry.filename, &entry.bytes, self.batch_limits) {
                Ok(inner) => {
                    for item in inner {
                        let name = format!("{}/{}", entry.filename, item.path);
                        reports.push(
                            self.enqueue_record(&run, &name, &item.bytes, IngestChannel::Batch)
                                .await,
                        );
                    }
                }
                Err(e) => {
                    reports.push(
                        self.record_failed_file(&run, &entry.filename, &entry.bytes, e)
                            .await,
                    );
                }
            }
        }

        self.finish_run(run.id, reports).await
    }

    /// Put every failed file of a run back in the queue.
    ///
    /// Dead-lettered jobs are requeued with a fresh retry budget; files that
    /// failed during synchronous ingestion get a new job. Files whose bytes
    /// were never retained stay failed.
    pub async fn retry_failed_files(&self, run_id: u64) -> Result<RunReport> {
        let now = self.clock.now();
        let files = self.store.list_files_for_run(run_id).await?;
        let mut reports = Vec::new();

        for mut file in files
            .into_iter()
            .filter(|f| f.status == ImportFileStatus::Failed)
        {
            let job_id = match self.store.job_for_file(file.id).await? {
                Some(job) if job.status == JobStatus::Failed => {
                    self.store
                        .requeue_failed_job(job.id, self.max_attempts, now)
                        .await?;
                    Some(job.id)
                }
                Some(_) => None,
                None if file.stored_path.is_some() => {
                    let job = self
                        .store
                        .enqueue_job(
                            NewImportJob {
                                file_id: file.id,
                                run_id,
                                priority: IngestChannel::Batch.priority(),
                                max_attempts: self.max_attempts,
                                available_at: now,
                            },
                            now,
                        )
                        .await?;
                    Some(job.id)
                }
                None => None,
            };

            let outcome = match job_id {
                Some(job_id) => {
                    file.status = ImportFileStatus::Queued;
                    file.error = None;
                    file.updated_at = now;
                    self.store.update_file(&file).await?;
                    ImportOutcome::Queued { job_id }
                }
                None => ImportOutcome::Failed {
                    error: file
                        .error
                        .clone()
                        .unwrap_or_else(|| "not retryable".to_string()),
                },
            };
            reports.push(FileReport {
                file_id: Some(file.id),
                filename: file.filename,
                outcome,
            });
        }

        tracing::info!(run_id, requeued = reports.len(), "Retrying failed files");
        self.finish_run(run_id, reports).await
    }

    // Worker side

    /// Process a claimed job. Errors are returned for the queue to classify.
    pub async fn process_job(&self, job: &ImportJob) -> Result<ImportOutcome> {
        let mut file = self
            .store
            .get_file(job.file_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("import file {}", job.file_id)))?;
        let run = self
            .store
            .get_run(job.run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("import run {}", job.run_id)))?;

        file.status = ImportFileStatus::Processing;
        file.updated_at = self.clock.now();
        self.store.update_file(&file).await?;
        refresh_run(self.store.as_ref(), run.id, self.clock.now()).await?;

        let stored_path = file.stored_path.clone().ok_or_else(|| {
            AppError::NotFound(format!("stored bytes for import file {}", file.id))
        })?;
        let bytes = self.storage.read(&stored_path).await?;

        let options = ProcessOptions {
            skip_metadata_only: true,
            skip_unsupported: false,
            external_id_from_path: run.kind == RunKind::BulkArchive,
        };
        let outcome = self.process_bytes(&mut file, &bytes, options).await?;

        let now = self.clock.now();
        file.status = outcome.file_status();
        file.error = None;
        file.updated_at = now;
        self.store.update_file(&file).await?;
        refresh_run(self.store.as_ref(), run.id, now).await?;

        tracing::info!(
            job_id = job.id,
            file_id = file.id,
            status = file.status.as_str(),
            "Processed queued file"
        );
        Ok(outcome)
    }

    /// Reflect a failed attempt on the job's file.
    ///
    /// The file goes back to `queued` while the job will be retried and to
    /// `failed` once it is dead-lettered.
    pub async fn record_job_failure(
        &self,
        job: &ImportJob,
        error: &AppError,
        dead_lettered: bool,
    ) -> Result<()> {
        let Some(mut file) = self.store.get_file(job.file_id).await? else {
            return Ok(());
        };
        let now = self.clock.now();
        file.status = if dead_lettered {
            ImportFileStatus::Failed
        } else {
            ImportFileStatus::Queued
        };
        file.error = Some(error.to_record());
        file.updated_at = now;
        self.store.update_file(&file).await?;
        refresh_run(self.store.as_ref(), job.run_id, now).await?;
        Ok(())
    }

    // Internals

    async fn finish_run(&self, run_id: u64, files: Vec<FileReport>) -> Result<RunReport> {
        let run = refresh_run(self.store.as_ref(), run_id, self.clock.now()).await?;
        tracing::info!(
            run_id,
            kind = ?run.kind,
            status = ?run.status,
            total = run.files_total,
            ok = run.files_ok,
            skipped = run.files_skipped,
            failed = run.files_failed,
            "Import run updated"
        );
        Ok(RunReport { run, files })
    }

    /// Create a file record and process it inline. Never fails: errors land
    /// in the report and on the record.
    async fn ingest_record(
        &self,
        run: &ImportRun,
        filename: &str,
        bytes: &[u8],
        options: ProcessOptions,
    ) -> FileReport {
        match self.try_ingest_record(run, filename, bytes, options).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(run_id = run.id, filename, error = %e, "Failed to record import file");
                FileReport {
                    file_id: None,
                    filename: filename.to_string(),
                    outcome: ImportOutcome::Failed {
                        error: e.to_record(),
                    },
                }
            }
        }
    }

    async fn try_ingest_record(
        &self,
        run: &ImportRun,
        filename: &str,
        bytes: &[u8],
        options: ProcessOptions,
    ) -> Result<FileReport> {
        let mut file = self
            .create_file(run, filename, bytes, ImportFileStatus::Processing)
            .await?;

        if let Some(outcome) = self.short_circuit_duplicate(&mut file).await? {
            return Ok(FileReport {
                file_id: Some(file.id),
                filename: file.filename,
                outcome,
            });
        }

        let outcome = match self.process_bytes(&mut file, bytes, options).await {
            Ok(outcome) => {
                file.error = None;
                outcome
            }
            Err(e) => {
                tracing::warn!(run_id = run.id, file_id = file.id, filename, error = %e, "Import failed");
                file.error = Some(e.to_record());
                // Keep the bytes so the file can be retried through the queue
                match self.storage.store_upload(file.id, filename, bytes).await {
                    Ok(path) => file.stored_path = Some(path),
                    Err(store_err) => {
                        tracing::warn!(file_id = file.id, error = %store_err, "Failed to retain upload")
                    }
                }
                ImportOutcome::Failed {
                    error: e.to_record(),
                }
            }
        };

        file.status = outcome.file_status();
        file.updated_at = self.clock.now();
        self.store.update_file(&file).await?;
        Ok(FileReport {
            file_id: Some(file.id),
            filename: file.filename,
            outcome,
        })
    }

    /// Create a file record, store the bytes and enqueue a job.
    async fn enqueue_record(
        &self,
        run: &ImportRun,
        filename: &str,
        bytes: &[u8],
        channel: IngestChannel,
    ) -> FileReport {
        match self.try_enqueue_record(run, filename, bytes, channel).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(run_id = run.id, filename, error = %e, "Failed to enqueue import file");
                FileReport {
                    file_id: None,
                    filename: filename.to_string(),
                    outcome: ImportOutcome::Failed {
                        error: e.to_record(),
                    },
                }
            }
        }
    }

    async fn try_enqueue_record(
        &self,
        run: &ImportRun,
        filename: &str,
        bytes: &[u8],
        channel: IngestChannel,
    ) -> Result<FileReport> {
        let mut file = self
            .create_file(run, filename, bytes, ImportFileStatus::Queued)
            .await?;

        if let Some(outcome) = self.short_circuit_duplicate(&mut file).await? {
            return Ok(FileReport {
                file_id: Some(file.id),
                filename: file.filename,
                outcome,
            });
        }

        let now = self.clock.now();
        let stored = match self.storage.store_upload(file.id, filename, bytes).await {
            Ok(path) => path,
            Err(e) => {
                file.status = ImportFileStatus::Failed;
                file.error = Some(e.to_record());
                file.updated_at = now;
                self.store.update_file(&file).await?;
                return Ok(FileReport {
                    file_id: Some(file.id),
                    filename: file.filename,
                    outcome: ImportOutcome::Failed {
                        error: e.to_record(),
                    },
                });
            }
        };
        file.stored_path = Some(stored);
        file.updated_at = now;
        self.store.update_file(&file).await?;

        let job = self
            .store
            .enqueue_job(
                NewImportJob {
                    file_id: file.id,
                    run_id: run.id,
                    priority: channel.priority(),
                    max_attempts: self.max_attempts,
                    available_at: now,
                },
                now,
            )
            .await?;
        tracing::debug!(run_id = run.id, file_id = file.id, job_id = job.id, priority = job.priority, "Enqueued import job");

        Ok(FileReport {
            file_id: Some(file.id),
            filename: file.filename,
            outcome: ImportOutcome::Queued { job_id: job.id },
        })
    }

    async fn create_file(
        &self,
        run: &ImportRun,
        filename: &str,
        bytes: &[u8],
        status: ImportFileStatus,
    ) -> Result<ImportFileRecord> {
        self.store
            .create_file(
                NewImportFile {
                    run_id: run.id,
                    filename: filename.to_string(),
                    size_bytes: bytes.len() as u64,
                    content_hash: content_hash(bytes),
                    status,
                },
                self.clock.now(),
            )
            .await
    }

    /// Mark the file a duplicate if identical bytes were seen before.
    async fn short_circuit_duplicate(
        &self,
        file: &mut ImportFileRecord,
    ) -> Result<Option<ImportOutcome>> {
        let Some(original) = self
            .store
            .find_file_by_hash(&file.content_hash, Some(file.id))
            .await?
        else {
            return Ok(None);
        };

        file.status = ImportFileStatus::SkippedDuplicate;
        file.activity_id = original.activity_id;
        file.format = original.format.clone();
        file.updated_at = self.clock.now();
        self.store.update_file(file).await?;
        tracing::info!(
            file_id = file.id,
            original_file_id = original.id,
            "Skipping duplicate file"
        );
        Ok(Some(ImportOutcome::DuplicateFile {
            original_file_id: original.id,
            activity_id: original.activity_id,
        }))
    }

    /// Record a file that could not even be expanded (e.g. an oversized archive).
    async fn record_failed_file(
        &self,
        run: &ImportRun,
        filename: &str,
        bytes: &[u8],
        error: AppError,
    ) -> FileReport {
        tracing::warn!(run_id = run.id, filename, error = %error, "Rejected archive");
        let mut report = FileReport {
            file_id: None,
            filename: filename.to_string(),
            outcome: ImportOutcome::Failed {
                error: error.to_record(),
            },
        };
        match self
            .create_file(run, filename, bytes, ImportFileStatus::Failed)
            .await
        {
            Ok(mut file) => {
                file.error = Some(error.to_record());
                if let Err(e) = self.store.update_file(&file).await {
                    tracing::warn!(file_id = file.id, error = %e, "Failed to record archive error");
                }
                report.file_id = Some(file.id);
            }
            Err(e) => {
                tracing::warn!(run_id = run.id, filename, error = %e, "Failed to record import file");
            }
        }
        report
    }

    /// Detect, parse and persist one file's bytes.
    async fn process_bytes(
        &self,
        file: &mut ImportFileRecord,
        bytes: &[u8],
        options: ProcessOptions,
    ) -> Result<ImportOutcome> {
        let detected = match detect(&file.filename, bytes) {
            Ok(detected) => detected,
            Err(AppError::UnsupportedFormat(reason)) if options.skip_unsupported => {
                return Ok(ImportOutcome::Skipped { reason });
            }
            Err(e) => return Err(e),
        };
        file.format = Some(detected.format.as_str().to_string());

        if detected.format == FileFormat::Csv {
            if hints::is_metadata_sheet(&file.filename) {
                return self.apply_metadata_sheet(&detected.bytes).await;
            }
            let reason = format!("{} is not an activity file", basename(&file.filename));
            return if options.skip_unsupported {
                Ok(ImportOutcome::Skipped { reason })
            } else {
                Err(AppError::UnsupportedFormat(reason))
            };
        }

        let fallback = fallback_name(&file.filename);
        let parsed = match parsers::parse(detected.format, &detected.bytes, &fallback) {
            Ok(parsed) => parsed,
            Err(AppError::MetadataOnly(reason)) if options.skip_metadata_only => {
                tracing::info!(file_id = file.id, reason = %reason, "Skipping metadata-only file");
                return Ok(ImportOutcome::Skipped { reason });
            }
            Err(e) => return Err(e),
        };

        self.persist_activity(file, parsed, detected.format, &fallback, options)
            .await
    }

    async fn persist_activity(
        &self,
        file: &mut ImportFileRecord,
        parsed: ParsedActivity,
        format: FileFormat,
        fallback: &str,
        options: ProcessOptions,
    ) -> Result<ImportOutcome> {
        let fingerprint = activity_fingerprint(&parsed.metadata);
        if let Some(existing) = self.store.find_activity_by_fingerprint(&fingerprint).await? {
            file.activity_id = Some(existing.id);
            tracing::info!(
                file_id = file.id,
                activity_id = existing.id,
                "File duplicates an existing activity"
            );
            return Ok(ImportOutcome::DuplicateActivity {
                activity_id: existing.id,
            });
        }

        let source_filename = basename(&file.filename).to_string();
        let hint = self
            .store
            .get_hint(&source_filename.to_ascii_lowercase())
            .await?;

        let mut metadata = parsed.metadata;
        if metadata.external_id.is_none() {
            metadata.external_id = hint
                .as_ref()
                .and_then(|h| h.external_id.clone())
                .or_else(|| {
                    options
                        .external_id_from_path
                        .then(|| archive::external_id_from_path(&file.filename))
                        .flatten()
                });
        }
        if metadata.sport_type == SportType::Workout {
            if let Some(label) = hint.as_ref().and_then(|h| h.sport_label.as_deref()) {
                metadata.sport_type = SportType::from_label(label);
            }
        }
        let name = hint
            .as_ref()
            .and_then(|h| h.name.clone())
            .or_else(|| metadata.name.clone())
            .unwrap_or_else(|| fallback.to_string());
        let gear = hint.as_ref().and_then(|h| h.gear.clone());

        let new_activity = NewActivity {
            name,
            metadata,
            gear,
            fingerprint: fingerprint.clone(),
            source_format: format.as_str().to_string(),
            source_filename,
            import_file_id: Some(file.id),
        };
        let activity = match self
            .store
            .insert_activity(new_activity, &parsed.streams, self.clock.now())
            .await
        {
            Ok(activity) => activity,
            Err(e) => {
                // A concurrent job may have inserted the same activity first
                if let Some(existing) = self.store.find_activity_by_fingerprint(&fingerprint).await? {
                    file.activity_id = Some(existing.id);
                    return Ok(ImportOutcome::DuplicateActivity {
                        activity_id: existing.id,
                    });
                }
                return Err(e);
            }
        };
        file.activity_id = Some(activity.id);

        if let Err(e) = self.drain_staged_media(&activity).await {
            tracing::warn!(activity_id = activity.id, error = %e, "Failed to attach staged media");
        }
        if let Err(e) = self.segments.rebuild_climbs_for_activity(activity.id).await {
            tracing::warn!(activity_id = activity.id, error = %e, "Climb detection failed");
        }

        tracing::info!(
            file_id = file.id,
            activity_id = activity.id,
            sport = %activity.sport_type,
            format = format.as_str(),
            "Imported activity"
        );
        Ok(ImportOutcome::Imported {
            activity_id: activity.id,
        })
    }

    /// Store hints and apply them to activities that were imported earlier.
    async fn apply_metadata_sheet(&self, bytes: &[u8]) -> Result<ImportOutcome> {
        let now = self.clock.now();
        let sheet = hints::parse_sheet(bytes, now)?;
        let mut updated = 0;

        for hint in &sheet.hints {
            self.store.upsert_hint(hint).await?;
            for mut activity in self
                .store
                .list_activities_by_source_filename(&hint.source_filename)
                .await?
            {
                let mut changed = false;
                if let Some(name) = hint.name.as_ref().filter(|n| **n != activity.name) {
                    activity.name = name.clone();
                    changed = true;
                }
                if hint.gear.is_some() && hint.gear != activity.gear {
                    activity.gear = hint.gear.clone();
                    changed = true;
                }
                if activity.external_id.is_none() && hint.external_id.is_some() {
                    activity.external_id = hint.external_id.clone();
                    changed = true;
                }
                if changed {
                    self.store.update_activity(&activity).await?;
                    self.drain_staged_media(&activity).await?;
                    updated += 1;
                }
            }
        }

        tracing::info!(hints = sheet.hints.len(), activities_updated = updated, "Applied metadata sheet");
        Ok(ImportOutcome::HintsApplied {
            hints: sheet.hints.len(),
            activities_updated: updated,
        })
    }

    async fn attach_media(&self, external_id: &str, entry: &ArchiveEntry) -> Result<ImportOutcome> {
        let now = self.clock.now();
        let filename = basename(&entry.path).to_string();
        match self.store.find_activity_by_external_id(external_id).await? {
            Some(activity) => {
                let stored_path = self
                    .storage
                    .store_media(activity.id, &filename, &entry.bytes)
                    .await?;
                self.store
                    .add_media(&ActivityMedia {
                        activity_id: activity.id,
                        filename,
                        stored_path,
                        created_at: now,
                    })
                    .await?;
                Ok(ImportOutcome::MediaAttached {
                    activity_id: activity.id,
                })
            }
            None => {
                let stored_path = self
                    .storage
                    .stage_media(external_id, &filename, &entry.bytes)
                    .await?;
                self.store
                    .stage_media(&StagedMedia {
                        external_id: external_id.to_string(),
                        filename,
                        stored_path,
                        created_at: now,
                    })
                    .await?;
                Ok(ImportOutcome::MediaStaged {
                    external_id: external_id.to_string(),
                })
            }
        }
    }

    async fn drain_staged_media(&self, activity: &Activity) -> Result<usize> {
        let Some(external_id) = activity.external_id.as_deref() else {
            return Ok(0);
        };
        let staged = self.store.take_staged_media(external_id).await?;
        let count = staged.len();
        for media in staged {
            self.store
                .add_media(&ActivityMedia {
                    activity_id: activity.id,
                    filename: media.filename,
                    stored_path: media.stored_path,
                    created_at: self.clock.now(),
                })
                .await?;
        }
        if count > 0 {
            tracing::info!(activity_id = activity.id, count, "Attached staged media");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_name() {
        assert_eq!(fallback_name("batch.zip/rides/Morning.fit.gz"), "Morning");
        assert_eq!(fallback_name(".gpx"), "Activity");
    }

    #[test]
    fn test_outcome_statuses() {
        assert_eq!(
            ImportOutcome::DuplicateActivity { activity_id: 1 }.file_status(),
            ImportFileStatus::SkippedDuplicate
        );
        assert_eq!(
            ImportOutcome::Skipped {
                reason: "metadata only".to_string()
            }
            .file_status(),
            ImportFileStatus::Skipped
        );
        assert_eq!(
            ImportOutcome::HintsApplied {
                hints: 1,
                activities_updated: 0
            }
            .file_status(),
            ImportFileStatus::Ok
        );
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let report = FileReport {
            file_id: Some(3),
            filename: "a.gpx".to_string(),
            outcome: ImportOutcome::Imported { activity_id: 9 },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "imported");
        assert_eq!(json["activity_id"], 9);
    }
}
