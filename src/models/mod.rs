// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod activity;
pub mod import;
pub mod queue;
pub mod segment;

pub use activity::{
    Activity, ActivityFilter, ActivityMedia, ActivityMetadata, LatLng, MetadataHint, NewActivity,
    ParsedActivity, SportFamily, SportType, StagedMedia, Streams,
};
pub use import::{
    ImportFileRecord, ImportFileStatus, ImportJob, ImportRun, IngestChannel, JobStatus,
    NewImportFile, NewImportJob, RunKind, RunStatus,
};
pub use queue::{Alert, AlertKind, AlertPayload, QueueStats, WorkerHealth};
pub use segment::{
    ClimbCategory, DetectedClimb, LocalSegment, NewEffort, NewSegment, SegmentEffort, SegmentKind,
};
