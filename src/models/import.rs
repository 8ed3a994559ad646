// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Import run, file and job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Single,
    Batch,
    WatchFolder,
    BulkArchive,
}

/// Aggregate status of a run, derived from its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Processing,
    Done,
    Partial,
    Error,
}

/// One ingestion operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRun {
    pub id: u64,
    pub kind: RunKind,
    pub label: String,
    pub status: RunStatus,
    pub files_total: u32,
    pub files_ok: u32,
    pub files_skipped: u32,
    pub files_failed: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportRun {
    /// Recompute counters and status from the run's file records.
    ///
    /// Files still queued or processing keep the run open; once every file
    /// is terminal the run is `done` with no failures, `error` if nothing
    /// succeeded, and `partial` otherwise.
    pub fn summarize(&mut self, files: &[ImportFileRecord], now: DateTime<Utc>) {
        let mut ok = 0;
        let mut skipped = 0;
        let mut failed = 0;
        let mut queued = 0;
        let mut processing = 0;

        for file in files {
            match file.status {
                ImportFileStatus::Ok => ok += 1,
                ImportFileStatus::SkippedDuplicate | ImportFileStatus::Skipped => skipped += 1,
                ImportFileStatus::Failed => failed += 1,
                ImportFileStatus::Queued => queued += 1,
                ImportFileStatus::Processing => processing += 1,
            }
        }

        self.files_total = files.len() as u32;
        self.files_ok = ok;
        self.files_skipped = skipped;
        self.files_failed = failed;
        self.updated_at = now;

        self.status = if processing > 0 || (queued > 0 && ok + skipped + failed > 0) {
            RunStatus::Processing
        } else if queued > 0 {
            RunStatus::Queued
        } else if failed == 0 {
            RunStatus::Done
        } else if ok + skipped > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Error
        };
    }
}

/// Status of one physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFileStatus {
    Queued,
    Processing,
    Ok,
    SkippedDuplicate,
    /// Not imported by choice (e.g. metadata-only binary file)
    Skipped,
    Failed,
}

impl ImportFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportFileStatus::Queued => "queued",
            ImportFileStatus::Processing => "processing",
            ImportFileStatus::Ok => "ok",
            ImportFileStatus::SkippedDuplicate => "skipped_duplicate",
            ImportFileStatus::Skipped => "skipped",
            ImportFileStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ImportFileStatus::Queued | ImportFileStatus::Processing)
    }
}

/// One physical file inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportFileRecord {
    pub id: u64,
    pub run_id: u64,
    /// Original filename (archive entries keep their path inside the archive)
    pub filename: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the uploaded bytes
    pub content_hash: String,
    /// Detected format, once known ("fit", "gpx", "tcx", "csv")
    pub format: Option<String>,
    pub status: ImportFileStatus,
    /// Where the raw bytes were stored for queued processing
    pub stored_path: Option<String>,
    pub activity_id: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a file record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImportFile {
    pub run_id: u64,
    pub filename: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub status: ImportFileStatus,
}

/// Ingestion channel; determines job priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestChannel {
    Interactive,
    Batch,
    WatchFolder,
}

impl IngestChannel {
    /// Interactive uploads outrank batches, which outrank the watch folder.
    pub fn priority(&self) -> i32 {
        match self {
            IngestChannel::Interactive => 30,
            IngestChannel::Batch => 20,
            IngestChannel::WatchFolder => 10,
        }
    }
}

/// Job lifecycle: `queued -> processing -> {done | queued (retry) | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: u64,
    pub file_id: u64,
    pub run_id: u64,
    pub priority: i32,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the job reached `done` or `failed`
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Fields supplied when enqueueing a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImportJob {
    pub file_id: u64,
    pub run_id: u64,
    pub priority: i32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
}
