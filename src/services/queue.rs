// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Durable job queue.
//!
//! Jobs live in the store's job table; this type adds the retry policy and
//! dead-letter administration on top of the store's atomic claim.

use crate::config::QueueConfig;
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::{ImportFileStatus, ImportJob, JobStatus, QueueStats};
use crate::services::importer::refresh_run;
use crate::time_utils::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`.
pub fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry {
        available_at: DateTime<Utc>,
        delay: Duration,
    },
    DeadLettered,
}

pub struct JobQueue {
    store: Arc<dyn Store>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// How long a claimed job may go without a lease renewal before it is
    /// considered abandoned.
    pub fn lease_window(&self) -> Duration {
        self.config.poll_interval * self.config.stale_multiplier.max(1)
    }

    /// Claim the best ready job, if any.
    pub async fn claim(&self) -> Result<Option<ImportJob>> {
        let job = self.store.claim_next_job(self.clock.now()).await?;
        if let Some(job) = &job {
            tracing::debug!(
                job_id = job.id,
                file_id = job.file_id,
                attempt = job.attempt_count,
                priority = job.priority,
                "Claimed job"
            );
        }
        Ok(job)
    }

    pub async fn complete(&self, job: &ImportJob) -> Result<()> {
        self.store.complete_job(job.id, self.clock.now()).await
    }

    /// Retry the job later or dead-letter it.
    ///
    /// Errors that would fail the same way again are dead-lettered on the
    /// first attempt.
    pub async fn record_failure(
        &self,
        job: &ImportJob,
        error: &AppError,
    ) -> Result<FailureDisposition> {
        let now = self.clock.now();
        let message = error.to_record();

        if error.is_retryable() && job.attempts_remaining() {
            let delay = retry_delay(
                self.config.base_delay,
                self.config.max_delay,
                job.attempt_count,
            );
            let available_at = now
                + chrono::Duration::from_std(delay)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("retry delay: {}", e)))?;
            self.store
                .retry_job(job.id, &message, available_at, now)
                .await?;
            tracing::warn!(
                job_id = job.id,
                attempt = job.attempt_count,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, will retry"
            );
            return Ok(FailureDisposition::Retry {
                available_at,
                delay,
            });
        }

        self.store.fail_job(job.id, &message, now).await?;
        let exhausted = AppError::QueueExhausted {
            job_id: job.id,
            attempts: job.attempt_count,
        };
        tracing::error!(
            job_id = job.id,
            file_id = job.file_id,
            retryable = error.is_retryable(),
            error = %error,
            "{}",
            exhausted
        );
        Ok(FailureDisposition::DeadLettered)
    }

    /// Keep jobs that are still being worked on from being reclaimed.
    pub async fn renew_leases(&self, job_ids: &[u64]) -> Result<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        self.store.renew_job_leases(job_ids, self.clock.now()).await
    }

    /// Requeue jobs left in `processing` by a worker that died mid-job.
    ///
    /// A reclaimed job keeps the attempt its claim consumed; one with no
    /// attempts left is dead-lettered.
    pub async fn reclaim_stale(&self) -> Result<Vec<ImportJob>> {
        let now = self.clock.now();
        let window = self.lease_window();
        let older_than = now
            - chrono::Duration::from_std(window)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("lease window: {}", e)))?;
        let error = AppError::LeaseExpired(format!(
            "no result within {}s of the last lease renewal",
            window.as_secs()
        ));
        let record = error.to_record();

        let reclaimed = self
            .store
            .requeue_stale_jobs(older_than, &record, now)
            .await?;
        for job in &reclaimed {
            let status = if job.status == JobStatus::Failed {
                let exhausted = AppError::QueueExhausted {
                    job_id: job.id,
                    attempts: job.attempt_count,
                };
                tracing::error!(job_id = job.id, file_id = job.file_id, "{}", exhausted);
                ImportFileStatus::Failed
            } else {
                tracing::warn!(
                    job_id = job.id,
                    file_id = job.file_id,
                    attempt = job.attempt_count,
                    "Reclaimed abandoned job"
                );
                ImportFileStatus::Queued
            };
            self.set_file_status(job, status, Some(record.clone()), now)
                .await?;
        }
        Ok(reclaimed)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.queue_stats(self.clock.now()).await
    }

    /// Dead-lettered jobs, oldest first.
    pub async fn list_failed(&self, limit: usize) -> Result<Vec<ImportJob>> {
        self.store.list_jobs(JobStatus::Failed, limit).await
    }

    /// Give a dead-lettered job a fresh retry budget.
    pub async fn requeue_failed(&self, job_id: u64) -> Result<()> {
        let now = self.clock.now();
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;
        if !self
            .store
            .requeue_failed_job(job_id, self.config.max_attempts, now)
            .await?
        {
            return Err(AppError::BadRequest(format!(
                "job {} is {}, not failed",
                job_id,
                job.status.as_str()
            )));
        }
        self.set_file_status(&job, ImportFileStatus::Queued, None, now)
            .await?;
        tracing::info!(job_id, "Requeued failed job");
        Ok(())
    }

    /// Requeue every dead-lettered job, optionally only those of one run.
    pub async fn requeue_all_failed(&self, run_id: Option<u64>) -> Result<u64> {
        let now = self.clock.now();
        let failed = self.store.list_jobs(JobStatus::Failed, usize::MAX).await?;
        let count = self
            .store
            .requeue_failed_jobs(run_id, self.config.max_attempts, now)
            .await?;
        for job in failed
            .iter()
            .filter(|job| run_id.is_none_or(|id| id == job.run_id))
        {
            self.set_file_status(job, ImportFileStatus::Queued, None, now)
                .await?;
        }
        tracing::info!(?run_id, count, "Requeued failed jobs");
        Ok(count)
    }

    pub async fn delete_failed(&self, job_id: u64) -> Result<()> {
        if !self.store.delete_failed_job(job_id).await? {
            return Err(AppError::NotFound(format!("failed job {}", job_id)));
        }
        tracing::info!(job_id, "Deleted failed job");
        Ok(())
    }

    /// Delete dead-lettered jobs that finished before `older_than`.
    pub async fn purge_failed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let count = self.store.purge_failed_jobs(older_than).await?;
        tracing::info!(count, %older_than, "Purged failed jobs");
        Ok(count)
    }

    /// Update the job's file and refresh its run.
    async fn set_file_status(
        &self,
        job: &ImportJob,
        status: ImportFileStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(mut file) = self.store.get_file(job.file_id).await? {
            file.status = status;
            file.error = error;
            file.updated_at = now;
            self.store.update_file(&file).await?;
        }
        refresh_run(self.store.as_ref(), job.run_id, now).await?;
        Ok(())
    }
}
