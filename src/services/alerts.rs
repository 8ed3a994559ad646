// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Queue alerting.
//!
//! The monitor polls queue statistics and worker health, raises one alert
//! per breached threshold and sends it to an [`AlertSink`]. Each condition
//! has its own cooldown, which starts only once a notification actually
//! went out.

use crate::config::AlertConfig;
use crate::error::{AppError, Result};
use crate::models::{Alert, AlertKind, AlertPayload, QueueStats, WorkerHealth};
use crate::services::queue::JobQueue;
use crate::services::worker::QueueWorker;
use crate::time_utils::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Destination for alert notifications.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, payload: &AlertPayload) -> Result<()>;
}

/// Posts the JSON payload to a webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::AlertDispatch(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, payload: &AlertPayload) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AppError::AlertDispatch(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::AlertDispatch(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Writes alerts to the log when no webhook is configured.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, payload: &AlertPayload) -> Result<()> {
        warn!(
            kind = payload.alert.kind.as_str(),
            value = payload.alert.value,
            threshold = payload.alert.threshold,
            "{}",
            payload.alert.message
        );
        Ok(())
    }
}

/// Build the sink the configuration asks for.
pub fn sink_from_config(config: &AlertConfig) -> Result<Arc<dyn AlertSink>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookSink::new(url.clone(), config.request_timeout)?)),
        None => Ok(Arc::new(LogSink)),
    }
}

/// Alerts for every breached threshold.
pub fn evaluate(
    stats: &QueueStats,
    health: &WorkerHealth,
    config: &AlertConfig,
    stale_window: Duration,
    now: DateTime<Utc>,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if config.failed_24h_threshold > 0 && stats.failed_last_24h >= config.failed_24h_threshold {
        alerts.push(Alert {
            kind: AlertKind::FailedJobs24h,
            message: format!(
                "{} import jobs dead-lettered in the last 24 hours",
                stats.failed_last_24h
            ),
            value: stats.failed_last_24h,
            threshold: config.failed_24h_threshold,
            raised_at: now,
        });
    }

    if config.backlog_threshold > 0 && stats.ready >= config.backlog_threshold {
        alerts.push(Alert {
            kind: AlertKind::ReadyBacklog,
            message: format!("{} import jobs ready but unclaimed", stats.ready),
            value: stats.ready,
            threshold: config.backlog_threshold,
            raised_at: now,
        });
    }

    if health.stale {
        let last_seen = [
            health.started_at,
            health.last_tick_started_at,
            health.last_tick_finished_at,
        ]
        .into_iter()
        .flatten()
        .max();
        let silent_s = last_seen
            .map(|seen| (now - seen).num_seconds().max(0) as u64)
            .unwrap_or_default();
        alerts.push(Alert {
            kind: AlertKind::WorkerStale,
            message: format!("Queue worker has not polled for {}s", silent_s),
            value: silent_s,
            threshold: stale_window.as_secs(),
            raised_at: now,
        });
    }

    alerts
}

pub struct AlertMonitor {
    queue: Arc<JobQueue>,
    worker: Option<QueueWorker>,
    sink: Arc<dyn AlertSink>,
    config: AlertConfig,
    clock: Arc<dyn Clock>,
    last_sent: DashMap<AlertKind, DateTime<Utc>>,
}

impl AlertMonitor {
    pub fn new(
        queue: Arc<JobQueue>,
        worker: Option<QueueWorker>,
        sink: Arc<dyn AlertSink>,
        config: AlertConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            worker,
            sink,
            config,
            clock,
            last_sent: DashMap::new(),
        }
    }

    fn stale_window(&self) -> Duration {
        let queue = self.queue.config();
        queue.poll_interval * queue.stale_multiplier.max(1)
    }

    /// Evaluate thresholds once and notify. Returns the alerts that were sent.
    pub async fn check_once(&self) -> Result<Vec<Alert>> {
        let now = self.clock.now();
        let stats = self.queue.stats().await?;
        let health = self
            .worker
            .as_ref()
            .map(|w| w.health())
            .unwrap_or_default();

        let cooldown = chrono::Duration::from_std(self.config.cooldown)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("alert cooldown: {}", e)))?;

        let mut sent = Vec::new();
        for alert in evaluate(&stats, &health, &self.config, self.stale_window(), now) {
            let cooling = self
                .last_sent
                .get(&alert.kind)
                .is_some_and(|last| now - *last < cooldown);
            if cooling {
                debug!(kind = alert.kind.as_str(), "Alert suppressed by cooldown");
                continue;
            }

            let payload = AlertPayload {
                alert: alert.clone(),
                queue: stats.clone(),
                worker: health.clone(),
            };
            match self.sink.send(&payload).await {
                Ok(()) => {
                    self.last_sent.insert(alert.kind, now);
                    info!(kind = alert.kind.as_str(), sink = self.sink.name(), "Alert sent");
                    sent.push(alert);
                }
                Err(e) => {
                    warn!(kind = alert.kind.as_str(), sink = self.sink.name(), error = %e, "Alert dispatch failed");
                }
            }
        }
        Ok(sent)
    }

    /// Poll in the background until the handle is shut down.
    pub fn start(self: Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let monitor = self;
        let task = tokio::spawn(async move {
            let mut ticker = interval(monitor.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                poll_interval_ms = monitor.config.poll_interval.as_millis() as u64,
                sink = monitor.sink.name(),
                "Alert monitor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.check_once().await {
                            warn!(error = %e, "Alert check failed");
                        }
                    }
                }
            }
            info!("Alert monitor stopped");
        });
        MonitorHandle { shutdown_tx, task }
    }
}

pub struct MonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.try_send(());
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_no_alerts_below_thresholds() {
        let stats = QueueStats {
            failed_last_24h: 4,
            ready: 199,
            ..QueueStats::default()
        };
        let alerts = evaluate(
            &stats,
            &WorkerHealth::default(),
            &AlertConfig::default(),
            Duration::from_secs(10),
            now(),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_one_alert_per_breach() {
        let stats = QueueStats {
            failed_last_24h: 5,
            ready: 250,
            ..QueueStats::default()
        };
        let health = WorkerHealth {
            running: true,
            stale: true,
            last_tick_finished_at: Some(now() - chrono::Duration::seconds(90)),
            ..WorkerHealth::default()
        };
        let alerts = evaluate(
            &stats,
            &health,
            &AlertConfig::default(),
            Duration::from_secs(10),
            now(),
        );
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::FailedJobs24h,
                AlertKind::ReadyBacklog,
                AlertKind::WorkerStale
            ]
        );
        assert_eq!(alerts[2].value, 90);
    }
}
