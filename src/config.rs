// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! A `.env` file is honored for local development. Every key has a
//! default except where noted, so an empty environment yields a working
//! single-node setup rooted at `./data`.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Job queue and worker settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How often the worker polls for ready jobs
    pub poll_interval: Duration,
    /// Number of concurrent job-processing slots
    pub concurrency: usize,
    /// Attempts before a job is dead-lettered
    pub max_attempts: u32,
    /// First retry delay
    pub base_delay: Duration,
    /// Upper bound on the retry delay
    pub max_delay: Duration,
    /// Worker is stale after this many poll intervals without a heartbeat
    pub stale_multiplier: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2_000),
            concurrency: 2,
            max_attempts: 5,
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(300_000),
            stale_multiplier: 5,
        }
    }
}

/// Limits applied when expanding archive containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl ArchiveLimits {
    pub const BATCH: ArchiveLimits = ArchiveLimits {
        max_entries: 500,
        max_total_bytes: 512 * 1024 * 1024,
    };

    pub const BULK_EXPORT: ArchiveLimits = ArchiveLimits {
        max_entries: 20_000,
        max_total_bytes: 8 * 1024 * 1024 * 1024,
    };
}

/// Queue alerting thresholds.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Webhook receiving alert payloads; alerts are only logged when unset
    pub webhook_url: Option<String>,
    pub poll_interval: Duration,
    /// Alert when this many jobs were dead-lettered in the last 24 hours
    pub failed_24h_threshold: u64,
    /// Alert when this many jobs are ready but unclaimed
    pub backlog_threshold: u64,
    /// Minimum time between two notifications for the same condition
    pub cooldown: Duration,
    pub request_timeout: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            poll_interval: Duration::from_millis(60_000),
            failed_24h_threshold: 5,
            backlog_threshold: 200,
            cooldown: Duration::from_secs(1_800),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Reverse geocoding settings.
#[derive(Debug, Clone)]
pub struct GeocodeConfig {
    /// Registered provider name ("none" or "nominatim")
    pub provider: String,
    pub base_url: String,
    pub timeout: Duration,
    pub cache_capacity: usize,
    pub locale: String,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            timeout: Duration::from_millis(2_500),
            cache_capacity: 2_048,
            locale: "en".to_string(),
        }
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for stored uploads and media
    pub data_dir: PathBuf,
    /// SQLite database path
    pub database_path: PathBuf,
    pub queue: QueueConfig,
    pub batch_limits: ArchiveLimits,
    pub bulk_limits: ArchiveLimits,
    pub alerts: AlertConfig,
    pub geocode: GeocodeConfig,
    /// Endpoint radius used by the manual segment matcher
    pub segment_match_radius_m: f64,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self::test_default()
    }
}

impl Config {
    /// Deterministic configuration for tests.
    pub fn test_default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            database_path: data_dir.join("ingest.db"),
            data_dir,
            queue: QueueConfig::default(),
            batch_limits: ArchiveLimits::BATCH,
            bulk_limits: ArchiveLimits::BULK_EXPORT,
            alerts: AlertConfig::default(),
            geocode: GeocodeConfig::default(),
            segment_match_radius_m: 60.0,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let data_dir = PathBuf::from(
            env::var("INGEST_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
        );
        let database_path = env::var("INGEST_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("ingest.db"));

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            poll_interval: Duration::from_millis(parse_or(
                "QUEUE_POLL_INTERVAL_MS",
                queue_defaults.poll_interval.as_millis() as u64,
            )?),
            concurrency: parse_or("QUEUE_CONCURRENCY", queue_defaults.concurrency)?.max(1),
            max_attempts: parse_or("QUEUE_MAX_ATTEMPTS", queue_defaults.max_attempts)?.max(1),
            base_delay: Duration::from_millis(parse_or(
                "QUEUE_BASE_DELAY_MS",
                queue_defaults.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                "QUEUE_MAX_DELAY_MS",
                queue_defaults.max_delay.as_millis() as u64,
            )?),
            stale_multiplier: parse_or("QUEUE_STALE_MULTIPLIER", queue_defaults.stale_multiplier)?
                .max(1),
        };

        let batch_limits = ArchiveLimits {
            max_entries: parse_or("ARCHIVE_MAX_ENTRIES", ArchiveLimits::BATCH.max_entries)?,
            max_total_bytes: parse_or("ARCHIVE_MAX_BYTES", ArchiveLimits::BATCH.max_total_bytes)?,
        };
        let bulk_limits = ArchiveLimits {
            max_entries: parse_or(
                "BULK_ARCHIVE_MAX_ENTRIES",
                ArchiveLimits::BULK_EXPORT.max_entries,
            )?,
            max_total_bytes: parse_or(
                "BULK_ARCHIVE_MAX_BYTES",
                ArchiveLimits::BULK_EXPORT.max_total_bytes,
            )?,
        };

        let alert_defaults = AlertConfig::default();
        let alerts = AlertConfig {
            webhook_url: env::var("ALERT_WEBHOOK_URL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            poll_interval: Duration::from_millis(parse_or(
                "ALERT_POLL_INTERVAL_MS",
                alert_defaults.poll_interval.as_millis() as u64,
            )?),
            failed_24h_threshold: parse_or(
                "ALERT_FAILED_24H_THRESHOLD",
                alert_defaults.failed_24h_threshold,
            )?,
            backlog_threshold: parse_or("ALERT_BACKLOG_THRESHOLD", alert_defaults.backlog_threshold)?,
            cooldown: Duration::from_secs(parse_or(
                "ALERT_COOLDOWN_SECS",
                alert_defaults.cooldown.as_secs(),
            )?),
            request_timeout: alert_defaults.request_timeout,
        };

        let geocode_defaults = GeocodeConfig::default();
        let geocode = GeocodeConfig {
            provider: env::var("GEOCODER").unwrap_or(geocode_defaults.provider),
            base_url: env::var("GEOCODER_URL").unwrap_or(geocode_defaults.base_url),
            timeout: Duration::from_millis(parse_or(
                "GEOCODER_TIMEOUT_MS",
                geocode_defaults.timeout.as_millis() as u64,
            )?),
            cache_capacity: parse_or("GEOCODER_CACHE_CAPACITY", geocode_defaults.cache_capacity)?,
            locale: env::var("GEOCODER_LOCALE").unwrap_or(geocode_defaults.locale),
        };

        Ok(Self {
            data_dir,
            database_path,
            queue,
            batch_limits,
            bulk_limits,
            alerts,
            geocode,
            segment_match_radius_m: parse_or("SEGMENT_MATCH_RADIUS_M", 60.0)?,
        })
    }
}

/// Read an optional env var, falling back to `default` when unset.
fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, raw)),
        _ => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
