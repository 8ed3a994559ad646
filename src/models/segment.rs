// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Segment models: detected climbs, persisted segments and efforts.

use crate::models::activity::{LatLng, SportType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Climb difficulty category, easiest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClimbCategory {
    Cat4,
    Cat3,
    Cat2,
    Cat1,
    #[serde(rename = "HC")]
    Hc,
}

impl fmt::Display for ClimbCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClimbCategory::Cat4 => "Cat 4",
            ClimbCategory::Cat3 => "Cat 3",
            ClimbCategory::Cat2 => "Cat 2",
            ClimbCategory::Cat1 => "Cat 1",
            ClimbCategory::Hc => "HC",
        };
        f.write_str(label)
    }
}

/// Climb found by the detector (not persisted as-is).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedClimb {
    pub start_index: usize,
    pub end_index: usize,
    pub distance_m: f64,
    /// Net gain from start to the climb's summit
    pub elevation_gain_m: f64,
    /// Sum of positive altitude steps inside the climb
    pub total_ascent_m: f64,
    pub avg_grade_pct: f64,
    pub elapsed_s: u32,
    pub start_latlng: Option<LatLng>,
    pub end_latlng: Option<LatLng>,
    /// Distance along the activity where the climb starts
    pub start_distance_m: f64,
    pub fingerprint: String,
    pub name: String,
    pub category: Option<ClimbCategory>,
}

/// How a segment came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    AutoClimb,
    Manual,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::AutoClimb => "auto_climb",
            SegmentKind::Manual => "manual",
        }
    }
}

/// Persisted segment definition, unique per fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSegment {
    pub id: u64,
    pub fingerprint: String,
    pub kind: SegmentKind,
    pub name: String,
    pub sport_type: SportType,
    pub distance_m: f64,
    pub elevation_gain_m: f64,
    pub avg_grade_pct: f64,
    pub start_latlng: Option<LatLng>,
    pub end_latlng: Option<LatLng>,
    /// Encoded polyline (precision 5) of the defining range
    pub polyline: Option<String>,
    pub category: Option<ClimbCategory>,
    /// Activity the segment was first derived from
    pub source_activity_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Segment fields supplied on upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSegment {
    pub fingerprint: String,
    pub kind: SegmentKind,
    pub name: String,
    pub sport_type: SportType,
    pub distance_m: f64,
    pub elevation_gain_m: f64,
    pub avg_grade_pct: f64,
    pub start_latlng: Option<LatLng>,
    pub end_latlng: Option<LatLng>,
    pub polyline: Option<String>,
    pub category: Option<ClimbCategory>,
    pub source_activity_id: u64,
}

/// Origin of an effort; all efforts produced here are local.
pub const LOCAL_EFFORT_SOURCE: &str = "local";

/// One occurrence of a segment within one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentEffort {
    pub id: u64,
    pub segment_id: u64,
    pub activity_id: u64,
    pub start_index: usize,
    pub end_index: usize,
    pub source: String,
    pub elapsed_s: u32,
    pub distance_m: f64,
    pub elevation_gain_m: f64,
    pub avg_grade_pct: f64,
    /// Sum of endpoint distances to the segment definition (0 for the defining activity)
    pub location_error_m: f64,
    pub created_at: DateTime<Utc>,
}

/// Effort fields supplied on upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEffort {
    pub segment_id: u64,
    pub activity_id: u64,
    pub start_index: usize,
    pub end_index: usize,
    pub elapsed_s: u32,
    pub distance_m: f64,
    pub elevation_gain_m: f64,
    pub avg_grade_pct: f64,
    pub location_error_m: f64,
}
