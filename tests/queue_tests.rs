// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Integration tests for the durable job queue and the worker lifecycle.

mod common;

use activity_ingest::config::Config;
use activity_ingest::db::{ImportStore, SqliteStore};
use activity_ingest::error::AppError;
use activity_ingest::models::{ImportFileStatus, IngestChannel, JobStatus, RunStatus};
use activity_ingest::services::{retry_delay, BatchEntry, ImportOutcome};
use activity_ingest::time_utils::{Clock, ManualClock};
use activity_ingest::Engine;
use chrono::Duration;
use common::{simple_ride, t0, test_engine, test_engine_with};
use std::collections::HashSet;
use std::sync::Arc;

fn queued_job(outcome: &ImportOutcome) -> u64 {
    match outcome {
        ImportOutcome::Queued { job_id } => *job_id,
        other => panic!("expected queued outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_worker_processes_queued_file() {
    let t = test_engine();
    let report = t
        .engine
        .importer
        .enqueue_file("ride.gpx", &simple_ride(0), IngestChannel::Interactive)
        .await
        .unwrap();
    assert_eq!(report.run.status, RunStatus::Queued);
    let job_id = queued_job(&report.files[0].outcome);

    assert_eq!(t.engine.worker.tick().await, 1);
    t.engine.worker.wait_idle().await;

    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempt_count, 1);
    assert!(job.finished_at.is_some());

    let run = t.store.get_run(report.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.files_ok, 1);
    let file = t.store.get_file(job.file_id).await.unwrap().unwrap();
    assert_eq!(file.status, ImportFileStatus::Ok);
    assert!(file.activity_id.is_some());
    assert_eq!(t.engine.worker.health().jobs_completed, 1);
}

#[tokio::test]
async fn test_enqueue_short_circuits_known_bytes() {
    let t = test_engine();
    let bytes = simple_ride(0);
    t.engine.importer.ingest_file("ride.gpx", &bytes).await.unwrap();

    let report = t
        .engine
        .importer
        .enqueue_file("again.gpx", &bytes, IngestChannel::WatchFolder)
        .await
        .unwrap();
    assert!(matches!(
        report.files[0].outcome,
        ImportOutcome::DuplicateFile { .. }
    ));
    assert_eq!(report.run.status, RunStatus::Done);
    assert_eq!(t.engine.queue.stats().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_claim_order_follows_channel_priority() {
    let t = test_engine();
    let importer = &t.engine.importer;
    let watch = importer
        .ingest_watch_file("watch.gpx", &simple_ride(0))
        .await
        .unwrap();
    let batch = importer
        .enqueue_file("batch.gpx", &simple_ride(1), IngestChannel::Batch)
        .await
        .unwrap();
    let first_interactive = importer
        .enqueue_file("a.gpx", &simple_ride(2), IngestChannel::Interactive)
        .await
        .unwrap();
    let second_interactive = importer
        .enqueue_file("b.gpx", &simple_ride(3), IngestChannel::Interactive)
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = t.engine.queue.claim().await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(
        order,
        vec![
            queued_job(&first_interactive.files[0].outcome),
            queued_job(&second_interactive.files[0].outcome),
            queued_job(&batch.files[0].outcome),
            queued_job(&watch.files[0].outcome),
        ]
    );
}

#[tokio::test]
async fn test_retry_delays_follow_backoff() {
    let base = std::time::Duration::from_millis(1_000);
    let max = std::time::Duration::from_millis(5_000);
    let delays: Vec<u128> = (1..=5)
        .map(|attempt| retry_delay(base, max, attempt).as_millis())
        .collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
}

#[tokio::test]
async fn test_parse_errors_are_dead_lettered_immediately() {
    let t = test_engine();
    let report = t
        .engine
        .importer
        .enqueue_file("broken.gpx", b"<gpx></gpx>", IngestChannel::Interactive)
        .await
        .unwrap();
    let job_id = queued_job(&report.files[0].outcome);

    t.engine.worker.tick().await;
    t.engine.worker.wait_idle().await;

    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 1);
    assert!(job.last_error.unwrap().starts_with("parse_error"));

    let file = t.store.get_file(job.file_id).await.unwrap().unwrap();
    assert_eq!(file.status, ImportFileStatus::Failed);
    let run = t.store.get_run(report.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Error);

    let health = t.engine.worker.health();
    assert_eq!(health.jobs_dead_lettered, 1);
    let stats = t.engine.queue.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.failed_last_24h, 1);
}

#[tokio::test]
async fn test_transient_failures_retry_then_dead_letter_then_requeue() {
    let t = test_engine();
    let bytes = simple_ride(0);
    let report = t
        .engine
        .importer
        .enqueue_file("ride.gpx", &bytes, IngestChannel::Batch)
        .await
        .unwrap();
    let job_id = queued_job(&report.files[0].outcome);
    let file_id = report.files[0].file_id.unwrap();
    let stored = t
        .store
        .get_file(file_id)
        .await
        .unwrap()
        .unwrap()
        .stored_path
        .unwrap();

    // Missing bytes fail with a retryable I/O error
    std::fs::remove_file(&stored).unwrap();

    for (attempt, delay_s) in [(1u32, 1i64), (2, 2)] {
        assert_eq!(t.engine.worker.tick().await, 1);
        t.engine.worker.wait_idle().await;
        let job = t.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, attempt);
        assert_eq!(job.available_at, t.clock.now() + Duration::seconds(delay_s));
        let file = t.store.get_file(file_id).await.unwrap().unwrap();
        assert_eq!(file.status, ImportFileStatus::Queued);
        assert!(file.error.unwrap().starts_with("io_error"));

        // Not claimable before the delay has passed
        assert_eq!(t.engine.worker.tick().await, 0);
        t.clock.advance(Duration::seconds(delay_s));
    }

    assert_eq!(t.engine.worker.tick().await, 1);
    t.engine.worker.wait_idle().await;
    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(
        t.store.get_file(file_id).await.unwrap().unwrap().status,
        ImportFileStatus::Failed
    );
    let health = t.engine.worker.health();
    assert_eq!(health.jobs_retried, 2);
    assert_eq!(health.jobs_dead_lettered, 1);

    let failed = t.engine.queue.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);

    // Operator restores the bytes and requeues
    std::fs::write(&stored, &bytes).unwrap();
    t.engine.queue.requeue_failed(job_id).await.unwrap();
    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.max_attempts, 6);
    let run = t.store.get_run(report.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);

    t.engine.worker.tick().await;
    t.engine.worker.wait_idle().await;
    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempt_count, 4);
    let run = t.store.get_run(report.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
}

#[tokio::test]
async fn test_dead_letter_administration() {
    let t = test_engine();
    for name in ["a.gpx", "b.gpx", "c.gpx"] {
        t.engine
            .importer
            .enqueue_file(name, name.as_bytes(), IngestChannel::Batch)
            .await
            .unwrap();
    }
    while t.engine.worker.tick().await > 0 {
        t.engine.worker.wait_idle().await;
    }
    t.engine.worker.wait_idle().await;
    let failed = t.engine.queue.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 3);

    t.engine.queue.delete_failed(failed[0].id).await.unwrap();
    let err = t.engine.queue.delete_failed(failed[0].id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = t.engine.queue.requeue_failed(failed[0].id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    assert_eq!(t.engine.queue.requeue_all_failed(None).await.unwrap(), 2);
    assert_eq!(t.engine.queue.stats().await.unwrap().queued, 2);

    while t.engine.worker.tick().await > 0 {
        t.engine.worker.wait_idle().await;
    }
    t.engine.worker.wait_idle().await;
    t.clock.advance(Duration::days(2));
    assert_eq!(t.engine.queue.purge_failed(t.clock.now()).await.unwrap(), 2);
    assert_eq!(t.engine.queue.stats().await.unwrap().failed, 0);
}

async fn assert_claims_are_exclusive(engine: Arc<Engine>) {
    let entries: Vec<BatchEntry> = (0..24)
        .map(|i| BatchEntry::new(format!("ride{}.gpx", i), simple_ride(i)))
        .collect();
    let report = engine.importer.enqueue_batch(entries).await.unwrap();
    assert_eq!(report.run.files_total, 24);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = engine.queue.claim().await.unwrap() {
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(all.len(), 24);
    assert_eq!(unique.len(), 24);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_memory_store() {
    let t = test_engine();
    assert_claims_are_exclusive(Arc::new(t.engine)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::test_default();
    config.data_dir = dir.path().to_path_buf();
    let store = Arc::new(SqliteStore::open(&dir.path().join("ingest.db")).unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = Engine::with_geocoder(config, store, clock, None);
    assert_claims_are_exclusive(Arc::new(engine)).await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_health_goes_stale_without_heartbeat() {
    let t = test_engine_with(|config| {
        config.queue.poll_interval = std::time::Duration::from_secs(60);
    });
    let worker = t.engine.worker.clone();
    assert!(!worker.health().running);
    assert!(!worker.health().stale);

    let handle = worker.start();
    // First interval tick fires immediately
    for _ in 0..100 {
        if worker.health().last_tick_finished_at.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let health = worker.health();
    assert!(health.running);
    assert!(!health.stale);
    assert_eq!(health.started_at, Some(t0()));

    // Five poll intervals is the staleness window
    t.clock.advance(Duration::seconds(299));
    assert!(!worker.health().stale);
    t.clock.advance(Duration::seconds(2));
    assert!(worker.health().stale);

    handle.shutdown().await;
    let health = worker.health();
    assert!(!health.running);
    assert!(!health.stale);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_worker_reclaims_abandoned_job() {
    let t = test_engine();
    let report = t
        .engine
        .importer
        .enqueue_file("ride.gpx", &simple_ride(0), IngestChannel::Interactive)
        .await
        .unwrap();
    let job_id = queued_job(&report.files[0].outcome);

    // A previous process claimed the job and died before finishing it
    let claimed = t.engine.queue.claim().await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);
    assert_eq!(t.engine.worker.tick().await, 0);

    // Lease window is poll interval (1 s) times the stale multiplier (5)
    t.clock.advance(Duration::seconds(4));
    assert_eq!(t.engine.worker.tick().await, 0);
    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);

    t.clock.advance(Duration::seconds(2));
    let handle = t.engine.worker.start();
    for _ in 0..100 {
        let job = t.store.get_job(job_id).await.unwrap().unwrap();
        if job.status == JobStatus::Done {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempt_count, 2);
    let run = t.store.get_run(report.run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.files_ok, 1);
}

#[tokio::test]
async fn test_abandoned_job_on_last_attempt_is_dead_lettered() {
    let t = test_engine_with(|config| config.queue.max_attempts = 1);
    let report = t
        .engine
        .importer
        .enqueue_file("ride.gpx", &simple_ride(0), IngestChannel::Batch)
        .await
        .unwrap();
    let job_id = queued_job(&report.files[0].outcome);
    t.engine.queue.claim().await.unwrap().unwrap();

    t.clock.advance(Duration::seconds(6));
    let reclaimed = t.engine.queue.reclaim_stale().await.unwrap();
    assert_eq!(reclaimed.len(), 1);

    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().starts_with("lease_expired: "));
    let file = t.store.get_file(job.file_id).await.unwrap().unwrap();
    assert_eq!(file.status, ImportFileStatus::Failed);
    let run = t.store.get_run(report.run.id).await.unwrap().unwrap();
    assert_eq!(run.files_failed, 1);
    assert_eq!(run.status, RunStatus::Error);

    // Dead-lettered like any other failure, so it can be requeued
    t.engine.queue.requeue_failed(job_id).await.unwrap();
    assert_eq!(t.engine.worker.tick().await, 1);
    t.engine.worker.wait_idle().await;
    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

#[tokio::test]
async fn test_in_flight_jobs_keep_their_lease() {
    let t = test_engine();
    let report = t
        .engine
        .importer
        .enqueue_file("ride.gpx", &simple_ride(0), IngestChannel::Interactive)
        .await
        .unwrap();
    let job_id = queued_job(&report.files[0].outcome);
    t.engine.queue.claim().await.unwrap().unwrap();

    // Renewed just before the window closes, so the next check leaves it alone
    t.clock.advance(Duration::seconds(4));
    t.engine.queue.renew_leases(&[job_id]).await.unwrap();
    t.clock.advance(Duration::seconds(4));
    assert!(t.engine.queue.reclaim_stale().await.unwrap().is_empty());
    let job = t.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}
