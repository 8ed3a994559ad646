// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory store.
//!
//! All state sits behind one mutex, which makes job claiming trivially
//! atomic. Used by tests and for offline runs.

use crate::db::{ActivityStore, ImportStore, SegmentStore};
use crate::error::{AppError, Result};
use crate::models::segment::LOCAL_EFFORT_SOURCE;
use crate::models::{
    Activity, ActivityFilter, ActivityMedia, ImportFileRecord, ImportFileStatus, ImportJob,
    ImportRun, JobStatus, LocalSegment, MetadataHint, NewActivity, NewEffort, NewImportFile,
    NewImportJob, NewSegment, QueueStats, RunKind, RunStatus, SegmentEffort, SegmentKind,
    StagedMedia, Streams,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    next_id: u64,
    runs: BTreeMap<u64, ImportRun>,
    files: BTreeMap<u64, ImportFileRecord>,
    jobs: BTreeMap<u64, ImportJob>,
    activities: BTreeMap<u64, Activity>,
    streams: HashMap<u64, Streams>,
    hints: HashMap<String, MetadataHint>,
    media: Vec<ActivityMedia>,
    staged: Vec<StagedMedia>,
    segments: BTreeMap<u64, LocalSegment>,
    efforts: BTreeMap<u64, SegmentEffort>,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn job_mut(&mut self, job_id: u64) -> Result<&mut ImportJob> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))
    }
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn create_run(
        &self,
        kind: RunKind,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<ImportRun> {
        let mut state = self.lock();
        let run = ImportRun {
            id: state.id(),
            kind,
            label: label.to_string(),
            status: RunStatus::Queued,
            files_total: 0,
            files_ok: 0,
            files_skipped: 0,
            files_failed: 0,
            created_at: now,
            updated_at: now,
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: u64) -> Result<Option<ImportRun>> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    async fn update_run(&self, run: &ImportRun) -> Result<()> {
        let mut state = self.lock();
        match state.runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("run {}", run.id))),
        }
    }

    async fn create_file(
        &self,
        file: NewImportFile,
        now: DateTime<Utc>,
    ) -> Result<ImportFileRecord> {
        let mut state = self.lock();
        let record = ImportFileRecord {
            id: state.id(),
            run_id: file.run_id,
            filename: file.filename,
            size_bytes: file.size_bytes,
            content_hash: file.content_hash,
            format: None,
            status: file.status,
            stored_path: None,
            activity_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        state.files.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_file(&self, file_id: u64) -> Result<Option<ImportFileRecord>> {
        Ok(self.lock().files.get(&file_id).cloned())
    }

    async fn update_file(&self, file: &ImportFileRecord) -> Result<()> {
        let mut state = self.lock();
        match state.files.get_mut(&file.id) {
            Some(existing) => {
                *existing = file.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("file {}", file.id))),
        }
    }

    async fn list_files_for_run(&self, run_id: u64) -> Result<Vec<ImportFileRecord>> {
        Ok(self
            .lock()
            .files
            .values()
            .filter(|f| f.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn find_file_by_hash(
        &self,
        content_hash: &str,
        exclude: Option<u64>,
    ) -> Result<Option<ImportFileRecord>> {
        Ok(self
            .lock()
            .files
            .values()
            .find(|f| {
                f.content_hash == content_hash
                    && f.status != ImportFileStatus::Failed
                    && Some(f.id) != exclude
            })
            .cloned())
    }

    async fn enqueue_job(&self, job: NewImportJob, now: DateTime<Utc>) -> Result<ImportJob> {
        let mut state = self.lock();
        let job = ImportJob {
            id: state.id(),
            file_id: job.file_id,
            run_id: job.run_id,
            priority: job.priority,
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts: job.max_attempts,
            available_at: job.available_at,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: u64) -> Result<Option<ImportJob>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn job_for_file(&self, file_id: u64) -> Result<Option<ImportJob>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .rev()
            .find(|j| j.file_id == file_id)
            .cloned())
    }

    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<ImportJob>> {
        let mut state = self.lock();
        // Iteration is by ascending id; ties keep the earlier job
        let next = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.available_at <= now)
            .fold(None::<&ImportJob>, |best, job| match best {
                Some(b) if b.priority >= job.priority => Some(b),
                _ => Some(job),
            })
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let job = state.job_mut(job_id)?;
        job.status = JobStatus::Processing;
        job.attempt_count += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, job_id: u64, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        job.status = JobStatus::Done;
        job.last_error = None;
        job.updated_at = now;
        job.finished_at = Some(now);
        Ok(())
    }

    async fn retry_job(
        &self,
        job_id: u64,
        error: &str,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        job.status = JobStatus::Queued;
        job.last_error = Some(error.to_string());
        job.available_at = available_at;
        job.updated_at = now;
        Ok(())
    }

    async fn fail_job(&self, job_id: u64, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        job.finished_at = Some(now);
        Ok(())
    }

    async fn renew_job_leases(&self, job_ids: &[u64], now: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        for id in job_ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.status == JobStatus::Processing {
                    job.updated_at = now;
                }
            }
        }
        Ok(())
    }

    async fn requeue_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImportJob>> {
        let mut state = self.lock();
        let mut reclaimed = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status != JobStatus::Processing || job.updated_at >= older_than {
                continue;
            }
            if job.attempts_remaining() {
                job.status = JobStatus::Queued;
                job.available_at = now;
            } else {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            }
            job.last_error = Some(error.to_string());
            job.updated_at = now;
            reclaimed.push(job.clone());
        }
        Ok(reclaimed)
    }

    async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<ImportJob>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue_failed_job(
        &self,
        job_id: u64,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.lock();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Failed => {
                requeue(job, extra_attempts, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_failed_jobs(
        &self,
        run_id: Option<u64>,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.lock();
        let mut count = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Failed && run_id.is_none_or(|r| r == job.run_id) {
                requeue(job, extra_attempts, now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_failed_job(&self, job_id: u64) -> Result<bool> {
        let mut state = self.lock();
        if state
            .jobs
            .get(&job_id)
            .is_some_and(|j| j.status == JobStatus::Failed)
        {
            state.jobs.remove(&job_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn purge_failed_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, j| {
            !(j.status == JobStatus::Failed && j.finished_at.is_some_and(|f| f < older_than))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let state = self.lock();
        let day_ago = now - Duration::hours(24);
        let mut stats = QueueStats::default();
        let mut oldest_ready: Option<DateTime<Utc>> = None;

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => {
                    stats.queued += 1;
                    if job.available_at <= now {
                        stats.ready += 1;
                        oldest_ready = Some(match oldest_ready {
                            Some(t) if t <= job.available_at => t,
                            _ => job.available_at,
                        });
                    }
                }
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Failed => {
                    stats.failed += 1;
                    if job.finished_at.is_some_and(|f| f >= day_ago) {
                        stats.failed_last_24h += 1;
                    }
                }
            }
        }
        stats.oldest_ready_age_s = oldest_ready.map(|t| (now - t).num_seconds());
        Ok(stats)
    }
}

fn requeue(job: &mut ImportJob, extra_attempts: u32, now: DateTime<Utc>) {
    job.status = JobStatus::Queued;
    job.max_attempts = job.attempt_count + extra_attempts;
    job.available_at = now;
    job.updated_at = now;
    job.finished_at = None;
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn insert_activity(
        &self,
        activity: NewActivity,
        streams: &Streams,
        now: DateTime<Utc>,
    ) -> Result<Activity> {
        let mut state = self.lock();
        if state
            .activities
            .values()
            .any(|a| a.fingerprint == activity.fingerprint)
        {
            return Err(AppError::Persistence(format!(
                "activity fingerprint {} already exists",
                activity.fingerprint
            )));
        }
        let id = state.id();
        let meta = activity.metadata;
        let record = Activity {
            id,
            name: activity.name,
            sport_type: meta.sport_type,
            start_time: meta.start_time,
            duration_s: meta.duration_s,
            distance_m: meta.distance_m,
            elevation_gain_m: meta.elevation_gain_m,
            avg_heartrate: meta.avg_heartrate,
            max_heartrate: meta.max_heartrate,
            avg_power: meta.avg_power,
            max_power: meta.max_power,
            avg_cadence: meta.avg_cadence,
            max_cadence: meta.max_cadence,
            device: meta.device,
            external_id: meta.external_id,
            gear: activity.gear,
            fingerprint: activity.fingerprint,
            source_format: activity.source_format,
            source_filename: activity.source_filename,
            import_file_id: activity.import_file_id,
            created_at: now,
        };
        state.activities.insert(id, record.clone());
        state.streams.insert(id, streams.clone());
        Ok(record)
    }

    async fn get_activity(&self, activity_id: u64) -> Result<Option<Activity>> {
        Ok(self.lock().activities.get(&activity_id).cloned())
    }

    async fn update_activity(&self, activity: &Activity) -> Result<()> {
        let mut state = self.lock();
        match state.activities.get_mut(&activity.id) {
            Some(existing) => {
                *existing = activity.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("activity {}", activity.id))),
        }
    }

    async fn get_streams(&self, activity_id: u64) -> Result<Option<Streams>> {
        Ok(self.lock().streams.get(&activity_id).cloned())
    }

    async fn find_activity_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Activity>> {
        Ok(self
            .lock()
            .activities
            .values()
            .find(|a| a.fingerprint == fingerprint)
            .cloned())
    }

    async fn find_activity_by_external_id(&self, external_id: &str) -> Result<Option<Activity>> {
        Ok(self
            .lock()
            .activities
            .values()
            .find(|a| a.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn list_activities_by_source_filename(&self, filename: &str) -> Result<Vec<Activity>> {
        Ok(self
            .lock()
            .activities
            .values()
            .filter(|a| a.source_filename.eq_ignore_ascii_case(filename))
            .cloned()
            .collect())
    }

    async fn list_activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>> {
        Ok(self
            .lock()
            .activities
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    async fn upsert_hint(&self, hint: &MetadataHint) -> Result<()> {
        self.lock()
            .hints
            .insert(hint.source_filename.clone(), hint.clone());
        Ok(())
    }

    async fn get_hint(&self, source_filename: &str) -> Result<Option<MetadataHint>> {
        Ok(self.lock().hints.get(source_filename).cloned())
    }

    async fn add_media(&self, media: &ActivityMedia) -> Result<()> {
        let mut state = self.lock();
        let exists = state
            .media
            .iter()
            .any(|m| m.activity_id == media.activity_id && m.filename == media.filename);
        if !exists {
            state.media.push(media.clone());
        }
        Ok(())
    }

    async fn list_media(&self, activity_id: u64) -> Result<Vec<ActivityMedia>> {
        Ok(self
            .lock()
            .media
            .iter()
            .filter(|m| m.activity_id == activity_id)
            .cloned()
            .collect())
    }

    async fn stage_media(&self, media: &StagedMedia) -> Result<()> {
        self.lock().staged.push(media.clone());
        Ok(())
    }

    async fn take_staged_media(&self, external_id: &str) -> Result<Vec<StagedMedia>> {
        let mut state = self.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.staged)
            .into_iter()
            .partition(|m| m.external_id == external_id);
        state.staged = kept;
        Ok(taken)
    }
}

#[async_trait]
impl SegmentStore for MemoryStore {
    async fn upsert_segment(
        &self,
        segment: NewSegment,
        now: DateTime<Utc>,
    ) -> Result<LocalSegment> {
        let mut state = self.lock();
        if let Some(existing) = state
            .segments
            .values()
            .find(|s| s.fingerprint == segment.fingerprint)
        {
            return Ok(existing.clone());
        }
        let record = LocalSegment {
            id: state.id(),
            fingerprint: segment.fingerprint,
            kind: segment.kind,
            name: segment.name,
            sport_type: segment.sport_type,
            distance_m: segment.distance_m,
            elevation_gain_m: segment.elevation_gain_m,
            avg_grade_pct: segment.avg_grade_pct,
            start_latlng: segment.start_latlng,
            end_latlng: segment.end_latlng,
            polyline: segment.polyline,
            category: segment.category,
            source_activity_id: segment.source_activity_id,
            created_at: now,
            updated_at: now,
        };
        state.segments.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_segment(&self, segment_id: u64) -> Result<Option<LocalSegment>> {
        Ok(self.lock().segments.get(&segment_id).cloned())
    }

    async fn find_segment_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<LocalSegment>> {
        Ok(self
            .lock()
            .segments
            .values()
            .find(|s| s.fingerprint == fingerprint)
            .cloned())
    }

    async fn list_segments(&self, kind: Option<SegmentKind>) -> Result<Vec<LocalSegment>> {
        Ok(self
            .lock()
            .segments
            .values()
            .filter(|s| kind.is_none_or(|k| k == s.kind))
            .cloned()
            .collect())
    }

    async fn rename_segment(&self, segment_id: u64, name: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        let segment = state
            .segments
            .get_mut(&segment_id)
            .ok_or_else(|| AppError::NotFound(format!("segment {}", segment_id)))?;
        segment.name = name.to_string();
        segment.updated_at = now;
        Ok(())
    }

    async fn upsert_effort(&self, effort: NewEffort, now: DateTime<Utc>) -> Result<SegmentEffort> {
        let mut state = self.lock();
        let existing = state
            .efforts
            .values()
            .find(|e| {
                e.segment_id == effort.segment_id
                    && e.activity_id == effort.activity_id
                    && e.start_index == effort.start_index
                    && e.end_index == effort.end_index
                    && e.source == LOCAL_EFFORT_SOURCE
            })
            .map(|e| e.id);
        let id = match existing {
            Some(id) => id,
            None => state.id(),
        };
        let record = SegmentEffort {
            id,
            segment_id: effort.segment_id,
            activity_id: effort.activity_id,
            start_index: effort.start_index,
            end_index: effort.end_index,
            source: LOCAL_EFFORT_SOURCE.to_string(),
            elapsed_s: effort.elapsed_s,
            distance_m: effort.distance_m,
            elevation_gain_m: effort.elevation_gain_m,
            avg_grade_pct: effort.avg_grade_pct,
            location_error_m: effort.location_error_m,
            created_at: now,
        };
        state.efforts.insert(id, record.clone());
        Ok(record)
    }

    async fn list_efforts_for_activity(&self, activity_id: u64) -> Result<Vec<SegmentEffort>> {
        Ok(self
            .lock()
            .efforts
            .values()
            .filter(|e| e.activity_id == activity_id)
            .cloned()
            .collect())
    }

    async fn list_efforts_for_segment(&self, segment_id: u64) -> Result<Vec<SegmentEffort>> {
        Ok(self
            .lock()
            .efforts
            .values()
            .filter(|e| e.segment_id == segment_id)
            .cloned()
            .collect())
    }

    async fn delete_efforts_for_activity(
        &self,
        activity_id: u64,
        kind: SegmentKind,
    ) -> Result<u64> {
        let mut state = self.lock();
        let State {
            segments, efforts, ..
        } = &mut *state;
        let before = efforts.len();
        efforts.retain(|_, e| {
            !(e.activity_id == activity_id
                && segments.get(&e.segment_id).is_some_and(|s| s.kind == kind))
        });
        Ok((before - efforts.len()) as u64)
    }

    async fn delete_orphan_segments(&self) -> Result<u64> {
        let mut state = self.lock();
        let State {
            segments, efforts, ..
        } = &mut *state;
        let before = segments.len();
        segments.retain(|id, _| efforts.values().any(|e| e.segment_id == *id));
        Ok((before - segments.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn job(store: &MemoryStore, priority: i32, available_at: DateTime<Utc>) -> ImportJob {
        store
            .enqueue_job(
                NewImportJob {
                    file_id: 1,
                    run_id: 1,
                    priority,
                    max_attempts: 3,
                    available_at,
                },
                t0(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_id() {
        let store = MemoryStore::new();
        let low = job(&store, 10, t0()).await;
        let high_a = job(&store, 30, t0()).await;
        let high_b = job(&store, 30, t0()).await;

        let first = store.claim_next_job(t0()).await.unwrap().unwrap();
        assert_eq!(first.id, high_a.id);
        assert_eq!(first.attempt_count, 1);
        assert_eq!(first.status, JobStatus::Processing);

        let second = store.claim_next_job(t0()).await.unwrap().unwrap();
        assert_eq!(second.id, high_b.id);
        let third = store.claim_next_job(t0()).await.unwrap().unwrap();
        assert_eq!(third.id, low.id);
        assert!(store.claim_next_job(t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_available_at() {
        let store = MemoryStore::new();
        job(&store, 30, t0() + Duration::seconds(10)).await;
        assert!(store.claim_next_job(t0()).await.unwrap().is_none());
        assert!(store
            .claim_next_job(t0() + Duration::seconds(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_requeue_extends_attempt_budget() {
        let store = MemoryStore::new();
        let j = job(&store, 10, t0()).await;
        store.claim_next_job(t0()).await.unwrap();
        store.fail_job(j.id, "parse_error: bad", t0()).await.unwrap();

        assert!(store.requeue_failed_job(j.id, 3, t0()).await.unwrap());
        let requeued = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.attempt_count, 1);
        assert_eq!(requeued.max_attempts, 4);
        assert!(!store.requeue_failed_job(j.id, 3, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_leases_are_reclaimed() {
        let store = MemoryStore::new();
        let abandoned = job(&store, 10, t0()).await;
        let renewed = job(&store, 10, t0()).await;
        store.claim_next_job(t0()).await.unwrap();
        store.claim_next_job(t0()).await.unwrap();

        let later = t0() + Duration::seconds(30);
        store.renew_job_leases(&[renewed.id], later).await.unwrap();
        let reclaimed = store
            .requeue_stale_jobs(t0() + Duration::seconds(10), "lease_expired: gone", later)
            .await
            .unwrap();

        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, abandoned.id);
        assert_eq!(reclaimed[0].status, JobStatus::Queued);
        assert_eq!(reclaimed[0].attempt_count, 1);
        assert_eq!(reclaimed[0].available_at, later);
        let still_running = store.get_job(renewed.id).await.unwrap().unwrap();
        assert_eq!(still_running.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_expired_lease_on_last_attempt_dead_letters() {
        let store = MemoryStore::new();
        let j = job(&store, 10, t0()).await;
        for _ in 0..2 {
            store.claim_next_job(t0()).await.unwrap();
            store.retry_job(j.id, "io_error: x", t0(), t0()).await.unwrap();
        }
        let last = store.claim_next_job(t0()).await.unwrap().unwrap();
        assert_eq!(last.attempt_count, last.max_attempts);

        let later = t0() + Duration::minutes(5);
        let reclaimed = store
            .requeue_stale_jobs(t0() + Duration::minutes(1), "lease_expired: gone", later)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, JobStatus::Failed);
        assert_eq!(reclaimed[0].finished_at, Some(later));
        assert_eq!(reclaimed[0].last_error.as_deref(), Some("lease_expired: gone"));
    }

    #[tokio::test]
    async fn test_orphan_cleanup() {
        let store = MemoryStore::new();
        let seg = store
            .upsert_segment(
                NewSegment {
                    fingerprint: "abc".to_string(),
                    kind: SegmentKind::AutoClimb,
                    name: "Climb".to_string(),
                    sport_type: crate::models::SportType::Ride,
                    distance_m: 1000.0,
                    elevation_gain_m: 50.0,
                    avg_grade_pct: 5.0,
                    start_latlng: None,
                    end_latlng: None,
                    polyline: None,
                    category: None,
                    source_activity_id: 7,
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(store.delete_orphan_segments().await.unwrap(), 1);
        assert!(store.get_segment(seg.id).await.unwrap().is_none());
    }
}
