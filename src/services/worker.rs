// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Queue worker: a fixed-interval poller feeding a bounded pool of slots.
//!
//! Each slot runs claim, process and complete-or-retry for one job. Slots
//! share nothing but the job table. Every tick renews the leases of this
//! worker's in-flight jobs and reclaims jobs whose lease expired, so a job
//! claimed by a process that died is picked up again. Shutdown stops
//! polling and waits for in-flight jobs; a job is never cancelled halfway.

use crate::config::QueueConfig;
use crate::error::AppError;
use crate::models::{ImportJob, WorkerHealth};
use crate::services::importer::ImportService;
use crate::services::queue::{FailureDisposition, JobQueue};
use crate::time_utils::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, Copy)]
struct Heartbeat {
    started_at: Option<DateTime<Utc>>,
    last_tick_started_at: Option<DateTime<Utc>>,
    last_tick_finished_at: Option<DateTime<Utc>>,
}

struct WorkerInner {
    queue: Arc<JobQueue>,
    importer: Arc<ImportService>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    stale_multiplier: u32,
    concurrency: usize,
    slots: Arc<Semaphore>,
    in_flight: DashSet<u64>,
    running: AtomicBool,
    heartbeat: Mutex<Heartbeat>,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Background job processor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueueWorker {
    inner: Arc<WorkerInner>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<JobQueue>,
        importer: Arc<ImportService>,
        config: &QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(WorkerInner {
                queue,
                importer,
                clock,
                poll_interval: config.poll_interval,
                stale_multiplier: config.stale_multiplier.max(1),
                concurrency,
                slots: Arc::new(Semaphore::new(concurrency)),
                in_flight: DashSet::new(),
                running: AtomicBool::new(false),
                heartbeat: Mutex::new(Heartbeat::default()),
                completed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
            }),
        }
    }

    fn heartbeat(&self) -> std::sync::MutexGuard<'_, Heartbeat> {
        self.inner
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Fill every free slot with a ready job. Returns the number of jobs started.
    pub async fn tick(&self) -> usize {
        self.heartbeat().last_tick_started_at = Some(self.inner.clock.now());

        let in_flight: Vec<u64> = self.inner.in_flight.iter().map(|id| *id).collect();
        if let Err(e) = self.inner.queue.renew_leases(&in_flight).await {
            error!(error = %e, "Failed to renew job leases");
        }
        match self.inner.queue.reclaim_stale().await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                warn!(count = reclaimed.len(), "Reclaimed jobs with expired leases")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to reclaim stale jobs"),
        }

        let mut started = 0;
        loop {
            let Ok(permit) = self.inner.slots.clone().try_acquire_owned() else {
                break;
            };
            match self.inner.queue.claim().await {
                Ok(Some(job)) => {
                    self.inner.in_flight.insert(job.id);
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        run_job(inner, job, permit).await;
                    });
                    started += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    break;
                }
            }
        }

        self.heartbeat().last_tick_finished_at = Some(self.inner.clock.now());
        if started > 0 {
            debug!(started, "Worker tick");
        }
        started
    }

    /// Wait until every in-flight job has finished.
    pub async fn wait_idle(&self) {
        let permits = self.inner.concurrency as u32;
        // The semaphore is never closed
        if let Ok(all) = self.inner.slots.acquire_many(permits).await {
            drop(all);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> WorkerHealth {
        let running = self.is_running();
        let heartbeat = *self.heartbeat();
        let last_seen = [
            heartbeat.started_at,
            heartbeat.last_tick_started_at,
            heartbeat.last_tick_finished_at,
        ]
        .into_iter()
        .flatten()
        .max();
        let window = self.inner.poll_interval * self.inner.stale_multiplier;
        let stale = running
            && match last_seen {
                Some(seen) => (self.inner.clock.now() - seen)
                    .to_std()
                    .is_ok_and(|age| age > window),
                None => true,
            };

        WorkerHealth {
            running,
            started_at: heartbeat.started_at,
            last_tick_started_at: heartbeat.last_tick_started_at,
            last_tick_finished_at: heartbeat.last_tick_finished_at,
            stale,
            active_slots: self.inner.concurrency - self.inner.slots.available_permits(),
            concurrency: self.inner.concurrency,
            jobs_completed: self.inner.completed.load(Ordering::SeqCst),
            jobs_retried: self.inner.retried.load(Ordering::SeqCst),
            jobs_dead_lettered: self.inner.dead_lettered.load(Ordering::SeqCst),
        }
    }

    /// Start polling in the background.
    pub fn start(&self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Queue worker is already running");
        }
        self.heartbeat().started_at = Some(self.inner.clock.now());

        let worker = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(worker.inner.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                poll_interval_ms = worker.inner.poll_interval.as_millis() as u64,
                concurrency = worker.inner.concurrency,
                "Queue worker started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Queue worker received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        worker.tick().await;
                    }
                }
            }

            worker.wait_idle().await;
            worker.inner.running.store(false, Ordering::SeqCst);
            info!("Queue worker stopped");
        });

        WorkerHandle { shutdown_tx, task }
    }
}

/// Handle to a started worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.try_send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Queue worker task panicked");
        }
    }
}

async fn run_job(inner: Arc<WorkerInner>, job: ImportJob, _permit: OwnedSemaphorePermit) {
    process(&inner, &job).await;
    inner.in_flight.remove(&job.id);
}

async fn process(inner: &WorkerInner, job: &ImportJob) {
    match inner.importer.process_job(job).await {
        Ok(outcome) => match inner.queue.complete(job).await {
            Ok(()) => {
                inner.completed.fetch_add(1, Ordering::SeqCst);
                debug!(job_id = job.id, ?outcome, "Job done");
            }
            Err(e) => error!(job_id = job.id, error = %e, "Failed to complete job"),
        },
        Err(e) => handle_failure(inner, job, e).await,
    }
}

async fn handle_failure(inner: &WorkerInner, job: &ImportJob, err: AppError) {
    let dead_lettered = match inner.queue.record_failure(job, &err).await {
        Ok(FailureDisposition::Retry { .. }) => {
            inner.retried.fetch_add(1, Ordering::SeqCst);
            false
        }
        Ok(FailureDisposition::DeadLettered) => {
            inner.dead_lettered.fetch_add(1, Ordering::SeqCst);
            true
        }
        Err(e) => {
            error!(job_id = job.id, error = %e, "Failed to record job failure");
            return;
        }
    };
    if let Err(e) = inner
        .importer
        .record_job_failure(job, &err, dead_lettered)
        .await
    {
        error!(job_id = job.id, error = %e, "Failed to update file after job failure");
    }
}
