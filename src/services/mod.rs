// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - ingestion, queue and segment logic.

pub mod alerts;
pub mod archive;
pub mod climbs;
pub mod dedup;
pub mod detect;
pub mod geo_utils;
pub mod geocode;
pub mod hints;
pub mod importer;
pub mod matcher;
pub mod naming;
pub mod queue;
pub mod segments;
pub mod storage;
pub mod worker;

pub use alerts::{AlertMonitor, AlertSink, LogSink, MonitorHandle, WebhookSink};
pub use climbs::{detect_climbs, ClimbParams};
pub use detect::{detect, FileFormat};
pub use geocode::{CachedGeocoder, GeocoderRegistry, NominatimGeocoder, ReverseGeocoder};
pub use importer::{
    BatchEntry, BatchOptions, BulkOptions, FileReport, ImportOutcome, ImportService, RunReport,
};
pub use matcher::{MatchParams, SegmentMatch, SegmentTarget};
pub use naming::ClimbNamer;
pub use queue::{retry_delay, FailureDisposition, JobQueue};
pub use segments::{
    BackfillFilter, BackfillReport, ManualSegmentReport, RebuildReport, RenameReport,
    SegmentService,
};
pub use storage::FileStorage;
pub use worker::{QueueWorker, WorkerHandle};
