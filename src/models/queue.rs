// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Queue statistics, worker health and alert payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate counts over the job table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// All queued jobs, including those waiting on a retry delay
    pub queued: u64,
    /// Queued jobs whose `available_at` has passed
    pub ready: u64,
    pub processing: u64,
    pub done: u64,
    /// Dead-lettered jobs
    pub failed: u64,
    /// Jobs dead-lettered within the last 24 hours
    pub failed_last_24h: u64,
    /// Age of the oldest ready job, in seconds
    pub oldest_ready_age_s: Option<i64>,
}

/// Worker liveness snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_started_at: Option<DateTime<Utc>>,
    pub last_tick_finished_at: Option<DateTime<Utc>>,
    /// Running, but no heartbeat within the staleness window
    pub stale: bool,
    pub active_slots: usize,
    pub concurrency: usize,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
}

/// Condition that raised an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FailedJobs24h,
    ReadyBacklog,
    WorkerStale,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::FailedJobs24h => "failed_jobs_24h",
            AlertKind::ReadyBacklog => "ready_backlog",
            AlertKind::WorkerStale => "worker_stale",
        }
    }
}

/// Alert details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    /// Observed value that breached the threshold
    pub value: u64,
    pub threshold: u64,
    pub raised_at: DateTime<Utc>,
}

/// JSON body posted to the alert webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert: Alert,
    pub queue: QueueStats,
    pub worker: WorkerHealth,
}
