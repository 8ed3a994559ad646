// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! SQLite-backed store.
//!
//! A single connection is shared behind a mutex. Job claiming is one
//! `UPDATE ... WHERE id = (SELECT ...) RETURNING` statement, so a job can
//! only move to `processing` once no matter how many slots poll at once.

use crate::db::schema;
use crate::db::{ActivityStore, ImportStore, SegmentStore};
use crate::error::{AppError, Result};
use crate::models::segment::LOCAL_EFFORT_SOURCE;
use crate::models::{
    Activity, ActivityFilter, ActivityMedia, ImportFileRecord, ImportJob, ImportRun, JobStatus,
    LocalSegment, MetadataHint, NewActivity, NewEffort, NewImportFile, NewImportJob, NewSegment,
    QueueStats, RunKind, RunStatus, SegmentEffort, SegmentKind, StagedMedia, Streams,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const JOB_COLUMNS: &str = "id, file_id, run_id, priority, status, attempt_count, max_attempts, \
     available_at, last_error, created_at, updated_at, finished_at";

/// Store backed by a SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::init_schema(&conn)?;
        tracing::info!(path = %path.display(), "Opened SQLite store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_doc<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_doc<T: DeserializeOwned>(doc: &str) -> Result<T> {
    Ok(serde_json::from_str(doc)?)
}

fn ms(date: DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

fn from_ms(value: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(value).unwrap_or_default()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ImportJob> {
    let status: String = row.get(4)?;
    let status = JobStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown job status {:?}", status).into(),
        )
    })?;
    Ok(ImportJob {
        id: row.get::<_, i64>(0)? as u64,
        file_id: row.get::<_, i64>(1)? as u64,
        run_id: row.get::<_, i64>(2)? as u64,
        priority: row.get(3)?,
        status,
        attempt_count: row.get(5)?,
        max_attempts: row.get(6)?,
        available_at: from_ms(row.get(7)?),
        last_error: row.get(8)?,
        created_at: from_ms(row.get(9)?),
        updated_at: from_ms(row.get(10)?),
        finished_at: row.get::<_, Option<i64>>(11)?.map(from_ms),
    })
}

/// Read `(id, doc)` rows and patch the column id into each document.
fn collect_docs<T: DeserializeOwned>(
    rows: impl Iterator<Item = rusqlite::Result<(i64, String)>>,
    set_id: impl Fn(&mut T, u64),
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        let (id, doc) = row?;
        let mut value: T = from_doc(&doc)?;
        set_id(&mut value, id as u64);
        out.push(value);
    }
    Ok(out)
}

fn id_doc(row: &Row<'_>) -> rusqlite::Result<(i64, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

#[async_trait]
impl ImportStore for SqliteStore {
    async fn create_run(
        &self,
        kind: RunKind,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<ImportRun> {
        let mut run = ImportRun {
            id: 0,
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
        let conn = self.lock();
        conn.execute(
            "INSERT INTO import_runs (doc) VALUES (?1)",
            params![to_doc(&run)?],
        )?;
        run.id = conn.last_insert_rowid() as u64;
        Ok(run)
    }

    async fn get_run(&self, run_id: u64) -> Result<Option<ImportRun>> {
        let conn = self.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM import_runs WHERE id = ?1",
                params![run_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| -> Result<ImportRun> {
            let mut run: ImportRun = from_doc(&d)?;
            run.id = run_id;
            Ok(run)
        })
        .transpose()
    }

    async fn update_run(&self, run: &ImportRun) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE import_runs SET doc = ?1 WHERE id = ?2",
            params![to_doc(run)?, run.id as i64],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn create_file(
        &self,
        file: NewImportFile,
        now: DateTime<Utc>,
    ) -> Result<ImportFileRecord> {
        let mut record = ImportFileRecord {
            id: 0,
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
        let conn = self.lock();
        conn.execute(
            "INSERT INTO import_files (run_id, content_hash, status, doc) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.run_id as i64,
                record.content_hash,
                record.status.as_str(),
                to_doc(&record)?
            ],
        )?;
        record.id = conn.last_insert_rowid() as u64;
        Ok(record)
    }

    async fn get_file(&self, file_id: u64) -> Result<Option<ImportFileRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, doc FROM import_files WHERE id = ?1")?;
        let rows = stmt.query_map(params![file_id as i64], id_doc)?;
        Ok(collect_docs(rows, |f: &mut ImportFileRecord, id| f.id = id)?
            .into_iter()
            .next())
    }

    async fn update_file(&self, file: &ImportFileRecord) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE import_files SET status = ?1, doc = ?2 WHERE id = ?3",
            params![file.status.as_str(), to_doc(file)?, file.id as i64],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("file {}", file.id)));
        }
        Ok(())
    }

    async fn list_files_for_run(&self, run_id: u64) -> Result<Vec<ImportFileRecord>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, doc FROM import_files WHERE run_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![run_id as i64], id_doc)?;
        collect_docs(rows, |f: &mut ImportFileRecord, id| f.id = id)
    }

    async fn find_file_by_hash(
        &self,
        content_hash: &str,
        exclude: Option<u64>,
    ) -> Result<Option<ImportFileRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, doc FROM import_files \
             WHERE content_hash = ?1 AND status != 'failed' AND id != ?2 \
             ORDER BY id LIMIT 1",
        )?;
        let exclude = exclude.map(|id| id as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![content_hash, exclude], id_doc)?;
        Ok(collect_docs(rows, |f: &mut ImportFileRecord, id| f.id = id)?
            .into_iter()
            .next())
    }

    async fn enqueue_job(&self, job: NewImportJob, now: DateTime<Utc>) -> Result<ImportJob> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO import_jobs \
             (file_id, run_id, priority, status, attempt_count, max_attempts, available_at, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6, ?6)",
            params![
                job.file_id as i64,
                job.run_id as i64,
                job.priority,
                job.max_attempts,
                ms(job.available_at),
                ms(now)
            ],
        )?;
        let id = conn.last_insert_rowid();
        let sql = format!("SELECT {} FROM import_jobs WHERE id = ?1", JOB_COLUMNS);
        Ok(conn.query_row(&sql, params![id], job_from_row)?)
    }

    async fn get_job(&self, job_id: u64) -> Result<Option<ImportJob>> {
        let sql = format!("SELECT {} FROM import_jobs WHERE id = ?1", JOB_COLUMNS);
        Ok(self
            .lock()
            .query_row(&sql, params![job_id as i64], job_from_row)
            .optional()?)
    }

    async fn job_for_file(&self, file_id: u64) -> Result<Option<ImportJob>> {
        let sql = format!(
            "SELECT {} FROM import_jobs WHERE file_id = ?1 ORDER BY id DESC LIMIT 1",
            JOB_COLUMNS
        );
        Ok(self
            .lock()
            .query_row(&sql, params![file_id as i64], job_from_row)
            .optional()?)
    }

    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<ImportJob>> {
        let sql = format!(
            "UPDATE import_jobs \
             SET status = 'processing', attempt_count = attempt_count + 1, updated_at = ?1 \
             WHERE id = ( \
                 SELECT id FROM import_jobs \
                 WHERE status = 'queued' AND available_at <= ?1 \
                 ORDER BY priority DESC, id ASC \
                 LIMIT 1 \
             ) \
             RETURNING {}",
            JOB_COLUMNS
        );
        Ok(self
            .lock()
            .query_row(&sql, params![ms(now)], job_from_row)
            .optional()?)
    }

    async fn complete_job(&self, job_id: u64, now: DateTime<Utc>) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE import_jobs SET status = 'done', last_error = NULL, updated_at = ?1, \
             finished_at = ?1 WHERE id = ?2",
            params![ms(now), job_id as i64],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }

    async fn retry_job(
        &self,
        job_id: u64,
        error: &str,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE import_jobs SET status = 'queued', last_error = ?1, available_at = ?2, \
             updated_at = ?3 WHERE id = ?4",
            params![error, ms(available_at), ms(now), job_id as i64],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: u64, error: &str, now: DateTime<Utc>) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE import_jobs SET status = 'failed', last_error = ?1, updated_at = ?2, \
             finished_at = ?2 WHERE id = ?3",
            params![error, ms(now), job_id as i64],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }

    async fn renew_job_leases(&self, job_ids: &[u64], now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "UPDATE import_jobs SET updated_at = ?1 WHERE id = ?2 AND status = 'processing'",
        )?;
        for id in job_ids {
            stmt.execute(params![ms(now), *id as i64])?;
        }
        Ok(())
    }

    async fn requeue_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImportJob>> {
        let conn = self.lock();
        let sql = format!(
            "UPDATE import_jobs SET \
                 status = CASE WHEN attempt_count < max_attempts THEN 'queued' ELSE 'failed' END, \
                 available_at = CASE WHEN attempt_count < max_attempts THEN ?1 ELSE available_at END, \
                 finished_at = CASE WHEN attempt_count < max_attempts THEN NULL ELSE ?1 END, \
                 last_error = ?2, updated_at = ?1 \
             WHERE status = 'processing' AND updated_at < ?3 \
             RETURNING {}",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![ms(now), error, ms(older_than)], job_from_row)?;
        let mut jobs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<ImportJob>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM import_jobs WHERE status = ?1 ORDER BY id LIMIT ?2",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn requeue_failed_job(
        &self,
        job_id: u64,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE import_jobs SET status = 'queued', max_attempts = attempt_count + ?1, \
             available_at = ?2, updated_at = ?2, finished_at = NULL \
             WHERE id = ?3 AND status = 'failed'",
            params![extra_attempts, ms(now), job_id as i64],
        )?;
        Ok(changed > 0)
    }

    async fn requeue_failed_jobs(
        &self,
        run_id: Option<u64>,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let changed = self.lock().execute(
            "UPDATE import_jobs SET status = 'queued', max_attempts = attempt_count + ?1, \
             available_at = ?2, updated_at = ?2, finished_at = NULL \
             WHERE status = 'failed' AND (?3 IS NULL OR run_id = ?3)",
            params![extra_attempts, ms(now), run_id.map(|r| r as i64)],
        )?;
        Ok(changed as u64)
    }

    async fn delete_failed_job(&self, job_id: u64) -> Result<bool> {
        let changed = self.lock().execute(
            "DELETE FROM import_jobs WHERE id = ?1 AND status = 'failed'",
            params![job_id as i64],
        )?;
        Ok(changed > 0)
    }

    async fn purge_failed_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let changed = self.lock().execute(
            "DELETE FROM import_jobs WHERE status = 'failed' AND finished_at < ?1",
            params![ms(older_than)],
        )?;
        Ok(changed as u64)
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let day_ago = now - Duration::hours(24);
        let conn = self.lock();
        let stats = conn.query_row(
            "SELECT \
               COALESCE(SUM(status = 'queued'), 0), \
               COALESCE(SUM(status = 'queued' AND available_at <= ?1), 0), \
               COALESCE(SUM(status = 'processing'), 0), \
               COALESCE(SUM(status = 'done'), 0), \
               COALESCE(SUM(status = 'failed'), 0), \
               COALESCE(SUM(status = 'failed' AND finished_at >= ?2), 0), \
               MIN(CASE WHEN status = 'queued' AND available_at <= ?1 THEN available_at END) \
             FROM import_jobs",
            params![ms(now), ms(day_ago)],
            |row| {
                Ok(QueueStats {
                    queued: row.get::<_, i64>(0)? as u64,
                    ready: row.get::<_, i64>(1)? as u64,
                    processing: row.get::<_, i64>(2)? as u64,
                    done: row.get::<_, i64>(3)? as u64,
                    failed: row.get::<_, i64>(4)? as u64,
                    failed_last_24h: row.get::<_, i64>(5)? as u64,
                    oldest_ready_age_s: row
                        .get::<_, Option<i64>>(6)?
                        .map(|oldest| (ms(now) - oldest) / 1000),
                })
            },
        )?;
        Ok(stats)
    }
}

#[async_trait]
impl ActivityStore for SqliteStore {
    async fn insert_activity(
        &self,
        activity: NewActivity,
        streams: &Streams,
        now: DateTime<Utc>,
    ) -> Result<Activity> {
        let meta = activity.metadata;
        let mut record = Activity {
            id: 0,
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

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO activities \
             (fingerprint, source_filename, source_format, sport_type, external_id, doc) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.fingerprint,
                record.source_filename,
                record.source_format,
                record.sport_type.as_str(),
                record.external_id,
                to_doc(&record)?
            ],
        )?;
        record.id = tx.last_insert_rowid() as u64;
        tx.execute(
            "INSERT INTO activity_streams (activity_id, doc) VALUES (?1, ?2)",
            params![record.id as i64, to_doc(streams)?],
        )?;
        tx.commit()?;
        Ok(record)
    }

    async fn get_activity(&self, activity_id: u64) -> Result<Option<Activity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, doc FROM activities WHERE id = ?1")?;
        let rows = stmt.query_map(params![activity_id as i64], id_doc)?;
        Ok(collect_docs(rows, |a: &mut Activity, id| a.id = id)?
            .into_iter()
            .next())
    }

    async fn update_activity(&self, activity: &Activity) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE activities SET source_filename = ?1, sport_type = ?2, external_id = ?3, \
             doc = ?4 WHERE id = ?5",
            params![
                activity.source_filename,
                activity.sport_type.as_str(),
                activity.external_id,
                to_doc(activity)?,
                activity.id as i64
            ],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("activity {}", activity.id)));
        }
        Ok(())
    }

    async fn get_streams(&self, activity_id: u64) -> Result<Option<Streams>> {
        let doc: Option<String> = self
            .lock()
            .query_row(
                "SELECT doc FROM activity_streams WHERE activity_id = ?1",
                params![activity_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| from_doc(&d)).transpose()
    }

    async fn find_activity_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Activity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, doc FROM activities WHERE fingerprint = ?1")?;
        let rows = stmt.query_map(params![fingerprint], id_doc)?;
        Ok(collect_docs(rows, |a: &mut Activity, id| a.id = id)?
            .into_iter()
            .next())
    }

    async fn find_activity_by_external_id(&self, external_id: &str) -> Result<Option<Activity>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, doc FROM activities WHERE external_id = ?1 ORDER BY id LIMIT 1")?;
        let rows = stmt.query_map(params![external_id], id_doc)?;
        Ok(collect_docs(rows, |a: &mut Activity, id| a.id = id)?
            .into_iter()
            .next())
    }

    async fn list_activities_by_source_filename(&self, filename: &str) -> Result<Vec<Activity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, doc FROM activities WHERE source_filename = ?1 COLLATE NOCASE ORDER BY id",
        )?;
        let rows = stmt.query_map(params![filename], id_doc)?;
        collect_docs(rows, |a: &mut Activity, id| a.id = id)
    }

    async fn list_activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, doc FROM activities ORDER BY id")?;
        let rows = stmt.query_map([], id_doc)?;
        let all = collect_docs(rows, |a: &mut Activity, id| a.id = id)?;
        Ok(all.into_iter().filter(|a| filter.matches(a)).collect())
    }

    async fn upsert_hint(&self, hint: &MetadataHint) -> Result<()> {
        self.lock().execute(
            "INSERT INTO metadata_hints (source_filename, doc) VALUES (?1, ?2) \
             ON CONFLICT(source_filename) DO UPDATE SET doc = excluded.doc",
            params![hint.source_filename, to_doc(hint)?],
        )?;
        Ok(())
    }

    async fn get_hint(&self, source_filename: &str) -> Result<Option<MetadataHint>> {
        let doc: Option<String> = self
            .lock()
            .query_row(
                "SELECT doc FROM metadata_hints WHERE source_filename = ?1",
                params![source_filename],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| from_doc(&d)).transpose()
    }

    async fn add_media(&self, media: &ActivityMedia) -> Result<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO activity_media (activity_id, filename, doc) VALUES (?1, ?2, ?3)",
            params![media.activity_id as i64, media.filename, to_doc(media)?],
        )?;
        Ok(())
    }

    async fn list_media(&self, activity_id: u64) -> Result<Vec<ActivityMedia>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT doc FROM activity_media WHERE activity_id = ?1 ORDER BY filename")?;
        let docs = stmt
            .query_map(params![activity_id as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    async fn stage_media(&self, media: &StagedMedia) -> Result<()> {
        self.lock().execute(
            "INSERT INTO staged_media (external_id, doc) VALUES (?1, ?2)",
            params![media.external_id, to_doc(media)?],
        )?;
        Ok(())
    }

    async fn take_staged_media(&self, external_id: &str) -> Result<Vec<StagedMedia>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let docs = {
            let mut stmt =
                tx.prepare("SELECT doc FROM staged_media WHERE external_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![external_id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "DELETE FROM staged_media WHERE external_id = ?1",
            params![external_id],
        )?;
        tx.commit()?;
        docs.iter().map(|d| from_doc(d)).collect()
    }
}

#[async_trait]
impl SegmentStore for SqliteStore {
    async fn upsert_segment(
        &self,
        segment: NewSegment,
        now: DateTime<Utc>,
    ) -> Result<LocalSegment> {
        let record = LocalSegment {
            id: 0,
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
        let conn = self.lock();
        conn.execute(
            "INSERT INTO segments (fingerprint, kind, doc) VALUES (?1, ?2, ?3) \
             ON CONFLICT(fingerprint) DO NOTHING",
            params![record.fingerprint, record.kind.as_str(), to_doc(&record)?],
        )?;
        let (id, doc) = conn.query_row(
            "SELECT id, doc FROM segments WHERE fingerprint = ?1",
            params![record.fingerprint],
            id_doc,
        )?;
        let mut stored: LocalSegment = from_doc(&doc)?;
        stored.id = id as u64;
        Ok(stored)
    }

    async fn get_segment(&self, segment_id: u64) -> Result<Option<LocalSegment>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, doc FROM segments WHERE id = ?1")?;
        let rows = stmt.query_map(params![segment_id as i64], id_doc)?;
        Ok(collect_docs(rows, |s: &mut LocalSegment, id| s.id = id)?
            .into_iter()
            .next())
    }

    async fn find_segment_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<LocalSegment>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, doc FROM segments WHERE fingerprint = ?1")?;
        let rows = stmt.query_map(params![fingerprint], id_doc)?;
        Ok(collect_docs(rows, |s: &mut LocalSegment, id| s.id = id)?
            .into_iter()
            .next())
    }

    async fn list_segments(&self, kind: Option<SegmentKind>) -> Result<Vec<LocalSegment>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, doc FROM segments WHERE ?1 IS NULL OR kind = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![kind.map(|k| k.as_str())], id_doc)?;
        collect_docs(rows, |s: &mut LocalSegment, id| s.id = id)
    }

    async fn rename_segment(&self, segment_id: u64, name: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let doc: Option<String> = tx
            .query_row(
                "SELECT doc FROM segments WHERE id = ?1",
                params![segment_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        let doc = doc.ok_or_else(|| AppError::NotFound(format!("segment {}", segment_id)))?;
        let mut segment: LocalSegment = from_doc(&doc)?;
        segment.id = segment_id;
        segment.name = name.to_string();
        segment.updated_at = now;
        tx.execute(
            "UPDATE segments SET doc = ?1 WHERE id = ?2",
            params![to_doc(&segment)?, segment_id as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn upsert_effort(&self, effort: NewEffort, now: DateTime<Utc>) -> Result<SegmentEffort> {
        let mut record = SegmentEffort {
            id: 0,
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
        let conn = self.lock();
        let id: i64 = conn.query_row(
            "INSERT INTO segment_efforts \
             (segment_id, activity_id, start_index, end_index, source, doc) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(segment_id, activity_id, start_index, end_index, source) \
             DO UPDATE SET doc = excluded.doc \
             RETURNING id",
            params![
                record.segment_id as i64,
                record.activity_id as i64,
                record.start_index as i64,
                record.end_index as i64,
                record.source,
                to_doc(&record)?
            ],
            |row| row.get(0),
        )?;
        record.id = id as u64;
        Ok(record)
    }

    async fn list_efforts_for_activity(&self, activity_id: u64) -> Result<Vec<SegmentEffort>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, doc FROM segment_efforts WHERE activity_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![activity_id as i64], id_doc)?;
        collect_docs(rows, |e: &mut SegmentEffort, id| e.id = id)
    }

    async fn list_efforts_for_segment(&self, segment_id: u64) -> Result<Vec<SegmentEffort>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, doc FROM segment_efforts WHERE segment_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![segment_id as i64], id_doc)?;
        collect_docs(rows, |e: &mut SegmentEffort, id| e.id = id)
    }

    async fn delete_efforts_for_activity(
        &self,
        activity_id: u64,
        kind: SegmentKind,
    ) -> Result<u64> {
        let changed = self.lock().execute(
            "DELETE FROM segment_efforts WHERE activity_id = ?1 \
             AND segment_id IN (SELECT id FROM segments WHERE kind = ?2)",
            params![activity_id as i64, kind.as_str()],
        )?;
        Ok(changed as u64)
    }

    async fn delete_orphan_segments(&self) -> Result<u64> {
        let changed = self.lock().execute(
            "DELETE FROM segments WHERE id NOT IN (SELECT DISTINCT segment_id FROM segment_efforts)",
            [],
        )?;
        Ok(changed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImportFileStatus, SportType};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_claim_is_single_statement_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        for priority in [10, 30, 20] {
            store
                .enqueue_job(
                    NewImportJob {
                        file_id: 1,
                        run_id: 1,
                        priority,
                        max_attempts: 3,
                        available_at: t0(),
                    },
                    t0(),
                )
                .await
                .unwrap();
        }
        let claimed = store.claim_next_job(t0()).await.unwrap().unwrap();
        assert_eq!(claimed.priority, 30);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.status, JobStatus::Processing);

        let stats = store.queue_stats(t0()).await.unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.oldest_ready_age_s, Some(0));
    }

    #[tokio::test]
    async fn test_stale_processing_jobs_are_reclaimed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for max_attempts in [3, 1, 3] {
            let job = store
                .enqueue_job(
                    NewImportJob {
                        file_id: 1,
                        run_id: 1,
                        priority: 10,
                        max_attempts,
                        available_at: t0(),
                    },
                    t0(),
                )
                .await
                .unwrap();
            ids.push(job.id);
        }
        for _ in 0..3 {
            store.claim_next_job(t0()).await.unwrap();
        }

        let later = t0() + Duration::seconds(30);
        store.renew_job_leases(&[ids[2]], later).await.unwrap();
        let reclaimed = store
            .requeue_stale_jobs(t0() + Duration::seconds(10), "lease_expired: gone", later)
            .await
            .unwrap();

        assert_eq!(reclaimed.len(), 2);
        assert_eq!(reclaimed[0].id, ids[0]);
        assert_eq!(reclaimed[0].status, JobStatus::Queued);
        assert_eq!(reclaimed[0].available_at, later);
        assert_eq!(reclaimed[0].finished_at, None);
        assert_eq!(reclaimed[1].id, ids[1]);
        assert_eq!(reclaimed[1].status, JobStatus::Failed);
        assert_eq!(reclaimed[1].finished_at, Some(later));
        assert_eq!(reclaimed[1].last_error.as_deref(), Some("lease_expired: gone"));

        let renewed = store.get_job(ids[2]).await.unwrap().unwrap();
        assert_eq!(renewed.status, JobStatus::Processing);
        let again = store.claim_next_job(later).await.unwrap().unwrap();
        assert_eq!(again.id, ids[0]);
        assert_eq!(again.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_file_roundtrip_and_hash_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_run(RunKind::Single, "a.gpx", t0()).await.unwrap();
        let mut file = store
            .create_file(
                NewImportFile {
                    run_id: run.id,
                    filename: "a.gpx".to_string(),
                    size_bytes: 3,
                    content_hash: "abc".to_string(),
                    status: ImportFileStatus::Processing,
                },
                t0(),
            )
            .await
            .unwrap();
        assert!(store
            .find_file_by_hash("abc", Some(file.id))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.find_file_by_hash("abc", None).await.unwrap().unwrap().id,
            file.id
        );

        file.status = ImportFileStatus::Failed;
        store.update_file(&file).await.unwrap();
        assert!(store.find_file_by_hash("abc", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_segment_upsert_by_fingerprint() {
        let store = SqliteStore::open_in_memory().unwrap();
        let new = NewSegment {
            fingerprint: "fp".to_string(),
            kind: SegmentKind::Manual,
            name: "Hill".to_string(),
            sport_type: SportType::Run,
            distance_m: 800.0,
            elevation_gain_m: 40.0,
            avg_grade_pct: 5.0,
            start_latlng: None,
            end_latlng: None,
            polyline: None,
            category: None,
            source_activity_id: 1,
        };
        let a = store.upsert_segment(new.clone(), t0()).await.unwrap();
        let b = store.upsert_segment(new, t0()).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.list_segments(None).await.unwrap().len(), 1);
    }
}
