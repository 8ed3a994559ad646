// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Activity-Ingest: import exercise activity files and analyze their routes
//!
//! This crate detects and parses FIT, GPX and TCX files, deduplicates
//! them, schedules queued processing with retries and dead-lettering, and
//! derives climb segments and manual segment efforts from the stored
//! streams.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod parsers;
pub mod services;
pub mod time_utils;

use config::Config;
use db::Store;
use error::Result;
use services::alerts::{sink_from_config, AlertMonitor};
use services::{
    CachedGeocoder, ClimbNamer, FileStorage, GeocoderRegistry, ImportService, JobQueue,
    MatchParams, QueueWorker, SegmentService,
};
use std::sync::Arc;
use time_utils::Clock;

/// Shared application state.
pub struct Engine {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub importer: Arc<ImportService>,
    pub queue: Arc<JobQueue>,
    pub segments: Arc<SegmentService>,
    pub worker: QueueWorker,
}

impl Engine {
    /// Wire up services, resolving the configured geocoder.
    pub fn new(config: Config, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Result<Self> {
        let geocoder = GeocoderRegistry::default()
            .resolve(&config.geocode)?
            .map(|inner| Arc::new(CachedGeocoder::new(inner, &config.geocode)));
        Ok(Self::with_geocoder(config, store, clock, geocoder))
    }

    pub fn with_geocoder(
        config: Config,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        geocoder: Option<Arc<CachedGeocoder>>,
    ) -> Self {
        let segments = Arc::new(SegmentService::new(
            store.clone(),
            ClimbNamer::new(geocoder),
            MatchParams::with_radius(config.segment_match_radius_m),
            clock.clone(),
        ));
        let importer = Arc::new(ImportService::new(
            &config,
            store.clone(),
            FileStorage::new(&config.data_dir),
            segments.clone(),
            clock.clone(),
        ));
        let queue = Arc::new(JobQueue::new(
            store.clone(),
            config.queue.clone(),
            clock.clone(),
        ));
        let worker = QueueWorker::new(queue.clone(), importer.clone(), &config.queue, clock.clone());

        Self {
            config,
            store,
            clock,
            importer,
            queue,
            segments,
            worker,
        }
    }

    /// Alert monitor watching this engine's queue and worker.
    pub fn alert_monitor(&self) -> Result<AlertMonitor> {
        Ok(AlertMonitor::new(
            self.queue.clone(),
            Some(self.worker.clone()),
            sink_from_config(&self.config.alerts)?,
            self.config.alerts.clone(),
            self.clock.clone(),
        ))
    }
}
