// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Segment and effort persistence.
//!
//! Detection and matching run outside any lock. The write phase for one
//! activity (delete stale efforts, upsert segments and efforts, drop
//! orphans) is serialized so a concurrent orphan sweep never removes a
//! segment between its upsert and the upsert of its first effort.

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::{
    Activity, ActivityFilter, LatLng, LocalSegment, NewEffort, NewSegment, SegmentEffort,
    SegmentKind, Streams,
};
use crate::services::climbs::{self, categorize, grade_pct, ClimbParams, RouteProfile};
use crate::services::geo_utils::encode_path;
use crate::services::matcher::{self, MatchParams, SegmentTarget};
use crate::services::naming::{manual_label, ClimbNamer};
use crate::time_utils::Clock;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const DEFAULT_BACKFILL_CONCURRENCY: usize = 4;

/// Activities selected for a climb backfill.
pub type BackfillFilter = ActivityFilter;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RebuildReport {
    pub activity_id: u64,
    pub climbs: usize,
    pub efforts_replaced: u64,
    pub orphans_removed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    pub activities: u64,
    pub climbs: u64,
    pub failed: u64,
    pub orphans_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualSegmentReport {
    pub segment: LocalSegment,
    /// Efforts written, the defining activity's first
    pub efforts: Vec<SegmentEffort>,
    pub activities_scanned: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenameReport {
    pub examined: u64,
    pub renamed: u64,
}

/// Climb rebuilds, manual segments and naming maintenance.
pub struct SegmentService {
    store: Arc<dyn Store>,
    namer: ClimbNamer,
    climb_params: ClimbParams,
    match_params: MatchParams,
    clock: Arc<dyn Clock>,
    backfill_concurrency: usize,
    write_lock: Mutex<()>,
}

struct NamedClimb {
    segment: NewSegment,
    effort: NewEffort,
}

impl SegmentService {
    pub fn new(
        store: Arc<dyn Store>,
        namer: ClimbNamer,
        match_params: MatchParams,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            namer,
            climb_params: ClimbParams::default(),
            match_params,
            clock,
            backfill_concurrency: DEFAULT_BACKFILL_CONCURRENCY,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_climb_params(mut self, params: ClimbParams) -> Self {
        self.climb_params = params;
        self
    }

    pub fn with_backfill_concurrency(mut self, concurrency: usize) -> Self {
        self.backfill_concurrency = concurrency.max(1);
        self
    }

    async fn load(&self, activity_id: u64) -> Result<(Activity, Streams)> {
        let activity = self
            .store
            .get_activity(activity_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("activity {}", activity_id)))?;
        let streams = self.store.get_streams(activity_id).await?.unwrap_or_default();
        Ok((activity, streams))
    }

    /// Re-detect climbs for one activity and replace its auto-climb efforts.
    pub async fn rebuild_climbs_for_activity(&self, activity_id: u64) -> Result<RebuildReport> {
        let (activity, streams) = self.load(activity_id).await?;
        let mut report = self.rebuild(&activity, &streams).await?;

        let _guard = self.write_lock.lock().await;
        report.orphans_removed = self.store.delete_orphan_segments().await?;
        Ok(report)
    }

    async fn rebuild(&self, activity: &Activity, streams: &Streams) -> Result<RebuildReport> {
        let detected = climbs::detect_climbs(streams, activity.sport_type, &self.climb_params);

        let mut named = Vec::with_capacity(detected.len());
        for climb in &detected {
            let existing = self
                .store
                .find_segment_by_fingerprint(&climb.fingerprint)
                .await?;
            let name = match existing {
                Some(segment) => segment.name,
                None => {
                    self.namer
                        .name_climb(
                            climb.start_latlng,
                            climb.end_latlng,
                            climb.distance_m,
                            climb.avg_grade_pct,
                            climb.category,
                        )
                        .await
                }
            };
            named.push(NamedClimb {
                segment: NewSegment {
                    fingerprint: climb.fingerprint.clone(),
                    kind: SegmentKind::AutoClimb,
                    name,
                    sport_type: activity.sport_type,
                    distance_m: climb.distance_m,
                    elevation_gain_m: climb.elevation_gain_m,
                    avg_grade_pct: climb.avg_grade_pct,
                    start_latlng: climb.start_latlng,
                    end_latlng: climb.end_latlng,
                    polyline: path(streams, climb.start_index, climb.end_index),
                    category: climb.category,
                    source_activity_id: activity.id,
                },
                effort: NewEffort {
                    segment_id: 0,
                    activity_id: activity.id,
                    start_index: climb.start_index,
                    end_index: climb.end_index,
                    elapsed_s: climb.elapsed_s,
                    distance_m: climb.distance_m,
                    elevation_gain_m: climb.elevation_gain_m,
                    avg_grade_pct: climb.avg_grade_pct,
                    location_error_m: 0.0,
                },
            });
        }

        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let efforts_replaced = self
            .store
            .delete_efforts_for_activity(activity.id, SegmentKind::AutoClimb)
            .await?;
        for NamedClimb { segment, mut effort } in named {
            let stored = self.store.upsert_segment(segment, now).await?;
            effort.segment_id = stored.id;
            self.store.upsert_effort(effort, now).await?;
        }

        tracing::info!(
            activity_id = activity.id,
            climbs = detected.len(),
            efforts_replaced,
            "Rebuilt climbs"
        );
        Ok(RebuildReport {
            activity_id: activity.id,
            climbs: detected.len(),
            efforts_replaced,
            orphans_removed: 0,
        })
    }

    /// Rebuild climbs for every matching activity with bounded concurrency.
    pub async fn backfill_climbs(&self, filter: &BackfillFilter) -> Result<BackfillReport> {
        let activities = self.store.list_activities(filter).await?;
        let total = activities.len() as u64;
        let climbs = AtomicU64::new(0);
        let failed = AtomicU64::new(0);

        stream::iter(activities)
            .for_each_concurrent(self.backfill_concurrency, |activity| {
                let climbs = &climbs;
                let failed = &failed;
                async move {
                    let result = match self.store.get_streams(activity.id).await {
                        Ok(streams) => self.rebuild(&activity, &streams.unwrap_or_default()).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(report) => {
                            climbs.fetch_add(report.climbs as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                activity_id = activity.id,
                                error = %e,
                                "Climb backfill failed for activity"
                            );
                        }
                    }
                }
            })
            .await;

        let orphans_removed = {
            let _guard = self.write_lock.lock().await;
            self.store.delete_orphan_segments().await?
        };

        let report = BackfillReport {
            activities: total,
            climbs: climbs.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            orphans_removed,
        };
        tracing::info!(
            activities = report.activities,
            climbs = report.climbs,
            failed = report.failed,
            orphans_removed = report.orphans_removed,
            "Climb backfill finished"
        );
        Ok(report)
    }

    /// Define a segment from a range of one activity and match it everywhere.
    pub async fn create_manual_segment(
        &self,
        activity_id: u64,
        start_index: usize,
        end_index: usize,
        name: Option<String>,
    ) -> Result<ManualSegmentReport> {
        let (activity, streams) = self.load(activity_id).await?;
        let profile = RouteProfile::from_streams(&streams).ok_or_else(|| {
            AppError::BadRequest(format!("activity {} has no usable route", activity_id))
        })?;
        let target = SegmentTarget::from_range(&profile, start_index, end_index, activity.sport_type)?;

        let gain = profile.span_gain(start_index, end_index);
        let grade = grade_pct(gain, target.distance_m);
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| manual_label(target.distance_m));
        let new_segment = NewSegment {
            fingerprint: target.fingerprint(),
            kind: SegmentKind::Manual,
            name,
            sport_type: activity.sport_type,
            distance_m: target.distance_m,
            elevation_gain_m: gain,
            avg_grade_pct: grade,
            start_latlng: Some(target.start),
            end_latlng: Some(target.end),
            polyline: path(&streams, start_index, end_index),
            category: categorize(target.distance_m, gain.max(0.0), grade),
            source_activity_id: activity.id,
        };

        let mut matches = vec![(
            activity.id,
            matcher::defining_match(&profile, start_index, end_index),
            profile.span_elapsed(start_index, end_index),
            gain,
        )];

        let mut scanned = 0u64;
        if target.family().is_some() {
            for other in self.store.list_activities(&ActivityFilter::default()).await? {
                if other.id == activity.id || !target.accepts(other.sport_type) {
                    continue;
                }
                scanned += 1;
                let Some(other_streams) = self.store.get_streams(other.id).await? else {
                    continue;
                };
                let Some(other_profile) = RouteProfile::from_streams(&other_streams) else {
                    continue;
                };
                if let Some(found) = matcher::find_match(&other_profile, &target, &self.match_params)
                {
                    let elapsed = other_profile.span_elapsed(found.start_index, found.end_index);
                    let gain = other_profile.span_gain(found.start_index, found.end_index);
                    matches.push((other.id, found, elapsed, gain));
                }
            }
        }

        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let segment = self.store.upsert_segment(new_segment, now).await?;
        let mut efforts = Vec::with_capacity(matches.len());
        for (matched_activity, found, elapsed_s, gain) in matches {
            let effort = NewEffort {
                segment_id: segment.id,
                activity_id: matched_activity,
                start_index: found.start_index,
                end_index: found.end_index,
                elapsed_s,
                distance_m: found.distance_m,
                elevation_gain_m: gain,
                avg_grade_pct: grade_pct(gain, found.distance_m),
                location_error_m: found.location_error_m,
            };
            efforts.push(self.store.upsert_effort(effort, now).await?);
        }

        tracing::info!(
            segment_id = segment.id,
            activity_id,
            scanned,
            matched = efforts.len(),
            "Created manual segment"
        );
        Ok(ManualSegmentReport {
            segment,
            efforts,
            activities_scanned: scanned,
        })
    }

    /// Re-derive names of auto-detected segments. Geometry is untouched.
    pub async fn rename_segments(&self) -> Result<RenameReport> {
        let segments = self.store.list_segments(Some(SegmentKind::AutoClimb)).await?;
        let mut report = RenameReport::default();
        for segment in segments {
            report.examined += 1;
            let name = self
                .namer
                .name_climb(
                    segment.start_latlng,
                    segment.end_latlng,
                    segment.distance_m,
                    segment.avg_grade_pct,
                    segment.category,
                )
                .await;
            if name != segment.name {
                self.store
                    .rename_segment(segment.id, &name, self.clock.now())
                    .await?;
                report.renamed += 1;
            }
        }
        tracing::info!(examined = report.examined, renamed = report.renamed, "Renamed segments");
        Ok(report)
    }
}

fn path(streams: &Streams, start: usize, end: usize) -> Option<String> {
    let points: &[LatLng] = streams.latlng.as_deref()?.get(start..=end)?;
    encode_path(points)
}
