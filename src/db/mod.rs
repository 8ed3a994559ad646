// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Persistence layer.
//!
//! Services talk to storage only through the traits below. Two backends
//! exist: [`SqliteStore`] for the binary and [`MemoryStore`] for tests and
//! offline use.

pub mod memory;
mod schema;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::models::{
    Activity, ActivityFilter, ActivityMedia, ImportFileRecord, ImportJob, ImportRun, JobStatus,
    LocalSegment, MetadataHint, NewActivity, NewEffort, NewImportFile, NewImportJob, NewSegment,
    QueueStats, RunKind, SegmentEffort, SegmentKind, StagedMedia, Streams,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Import runs, files and the durable job table.
#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn create_run(&self, kind: RunKind, label: &str, now: DateTime<Utc>)
        -> Result<ImportRun>;
    async fn get_run(&self, run_id: u64) -> Result<Option<ImportRun>>;
    async fn update_run(&self, run: &ImportRun) -> Result<()>;

    async fn create_file(&self, file: NewImportFile, now: DateTime<Utc>)
        -> Result<ImportFileRecord>;
    async fn get_file(&self, file_id: u64) -> Result<Option<ImportFileRecord>>;
    async fn update_file(&self, file: &ImportFileRecord) -> Result<()>;
    async fn list_files_for_run(&self, run_id: u64) -> Result<Vec<ImportFileRecord>>;

    /// Earliest file with this content hash that has not failed, ignoring `exclude`.
    async fn find_file_by_hash(
        &self,
        content_hash: &str,
        exclude: Option<u64>,
    ) -> Result<Option<ImportFileRecord>>;

    async fn enqueue_job(&self, job: NewImportJob, now: DateTime<Utc>) -> Result<ImportJob>;
    async fn get_job(&self, job_id: u64) -> Result<Option<ImportJob>>;
    async fn job_for_file(&self, file_id: u64) -> Result<Option<ImportJob>>;

    /// Atomically claim the best ready job.
    ///
    /// Picks the queued job with `available_at <= now` of highest priority
    /// (lowest id on ties), moves it to `processing` and increments its
    /// attempt count. Concurrent callers never receive the same job.
    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<ImportJob>>;

    async fn complete_job(&self, job_id: u64, now: DateTime<Utc>) -> Result<()>;

    /// Put a job back in the queue after a failed attempt.
    async fn retry_job(
        &self,
        job_id: u64,
        error: &str,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Dead-letter a job.
    async fn fail_job(&self, job_id: u64, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Extend the lease of jobs this process is still working on.
    async fn renew_job_leases(&self, job_ids: &[u64], now: DateTime<Utc>) -> Result<()>;

    /// Reclaim `processing` jobs whose lease expired (`updated_at < older_than`).
    ///
    /// Jobs with attempts left go back to `queued`, available at `now`; the
    /// rest are dead-lettered. Returns the reclaimed jobs in their new state.
    async fn requeue_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImportJob>>;

    async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<ImportJob>>;

    /// Move a dead-lettered job back to `queued` with `extra_attempts` more tries.
    ///
    /// Returns false if the job does not exist or is not failed.
    async fn requeue_failed_job(
        &self,
        job_id: u64,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Requeue every dead-lettered job, optionally restricted to one run.
    async fn requeue_failed_jobs(
        &self,
        run_id: Option<u64>,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Delete a dead-lettered job. Returns false if it is not failed.
    async fn delete_failed_job(&self, job_id: u64) -> Result<bool>;

    /// Delete dead-lettered jobs that finished before `older_than`.
    async fn purge_failed_jobs(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats>;
}

/// Activities, streams, bulk metadata hints and media.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Insert an activity and its streams.
    ///
    /// Fails with a persistence error if the fingerprint already exists.
    async fn insert_activity(
        &self,
        activity: NewActivity,
        streams: &Streams,
        now: DateTime<Utc>,
    ) -> Result<Activity>;
    async fn get_activity(&self, activity_id: u64) -> Result<Option<Activity>>;
    async fn update_activity(&self, activity: &Activity) -> Result<()>;
    async fn get_streams(&self, activity_id: u64) -> Result<Option<Streams>>;
    async fn find_activity_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Activity>>;
    async fn find_activity_by_external_id(&self, external_id: &str) -> Result<Option<Activity>>;
    async fn list_activities_by_source_filename(&self, filename: &str) -> Result<Vec<Activity>>;
    async fn list_activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>>;

    async fn upsert_hint(&self, hint: &MetadataHint) -> Result<()>;
    async fn get_hint(&self, source_filename: &str) -> Result<Option<MetadataHint>>;

    async fn add_media(&self, media: &ActivityMedia) -> Result<()>;
    async fn list_media(&self, activity_id: u64) -> Result<Vec<ActivityMedia>>;
    async fn stage_media(&self, media: &StagedMedia) -> Result<()>;
    /// Remove and return all media staged for an external id.
    async fn take_staged_media(&self, external_id: &str) -> Result<Vec<StagedMedia>>;
}

/// Local segments and efforts.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Insert a segment, or return the existing one with the same fingerprint.
    async fn upsert_segment(&self, segment: NewSegment, now: DateTime<Utc>)
        -> Result<LocalSegment>;
    async fn get_segment(&self, segment_id: u64) -> Result<Option<LocalSegment>>;
    async fn find_segment_by_fingerprint(&self, fingerprint: &str)
        -> Result<Option<LocalSegment>>;
    async fn list_segments(&self, kind: Option<SegmentKind>) -> Result<Vec<LocalSegment>>;
    async fn rename_segment(&self, segment_id: u64, name: &str, now: DateTime<Utc>)
        -> Result<()>;

    /// Insert or replace the effort keyed by (segment, activity, start, end).
    async fn upsert_effort(&self, effort: NewEffort, now: DateTime<Utc>) -> Result<SegmentEffort>;
    async fn list_efforts_for_activity(&self, activity_id: u64) -> Result<Vec<SegmentEffort>>;
    async fn list_efforts_for_segment(&self, segment_id: u64) -> Result<Vec<SegmentEffort>>;

    /// Delete the activity's efforts on segments of the given kind.
    async fn delete_efforts_for_activity(&self, activity_id: u64, kind: SegmentKind)
        -> Result<u64>;

    /// Delete segments that have no efforts left.
    async fn delete_orphan_segments(&self) -> Result<u64>;
}

/// Everything the engine needs from storage.
pub trait Store: ImportStore + ActivityStore + SegmentStore {}

impl<T: ImportStore + ActivityStore + SegmentStore> Store for T {}
