// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Activity models: parser output, normalized streams and stored activities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized sport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SportType {
    Run,
    Swim,
    Walk,
    Ride,
    Workout,
}

impl SportType {
    /// Map a free-form sport string onto the closed set.
    ///
    /// Matching is case-insensitive substring based. Anything containing a
    /// slash is treated as a leaked MIME type and becomes `Workout`.
    pub fn from_label(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase();
        if lower.contains('/') {
            return SportType::Workout;
        }
        if lower.contains("run") {
            SportType::Run
        } else if lower.contains("swim") {
            SportType::Swim
        } else if lower.contains("walk") || lower.contains("hike") || lower.contains("hiking") {
            SportType::Walk
        } else if lower.contains("ride") || lower.contains("bik") || lower.contains("cycl") {
            SportType::Ride
        } else {
            SportType::Workout
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SportType::Run => "Run",
            SportType::Swim => "Swim",
            SportType::Walk => "Walk",
            SportType::Ride => "Ride",
            SportType::Workout => "Workout",
        }
    }

    /// Activity-type family used for cross-activity segment matching.
    pub fn family(&self) -> Option<SportFamily> {
        match self {
            SportType::Ride => Some(SportFamily::RideLike),
            SportType::Run | SportType::Walk => Some(SportFamily::RunLike),
            SportType::Swim | SportType::Workout => None,
        }
    }
}

impl fmt::Display for SportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Families of sport types that share routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SportFamily {
    RideLike,
    RunLike,
}

impl SportFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            SportFamily::RideLike => "ride",
            SportFamily::RunLike => "run",
        }
    }
}

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
            && !(self.lat == 0.0 && self.lng == 0.0)
    }
}

impl From<LatLng> for geo::Point<f64> {
    fn from(value: LatLng) -> Self {
        geo::Point::new(value.lng, value.lat)
    }
}

impl From<LatLng> for geo::Coord<f64> {
    fn from(value: LatLng) -> Self {
        geo::Coord {
            x: value.lng,
            y: value.lat,
        }
    }
}

/// Per-sample streams, index-aligned to `time`.
///
/// `time` is whole seconds from the first sample and starts at 0. Every other
/// stream is present only if at least one sample carried a value; gaps are
/// filled from the nearest earlier value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Streams {
    pub time: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latlng: Option<Vec<LatLng>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartrate: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<Vec<f64>>,
}

impl Streams {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Activity-level summary extracted by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetadata {
    pub name: Option<String>,
    pub sport_type: SportType,
    pub start_time: DateTime<Utc>,
    /// Elapsed time in seconds
    pub duration_s: f64,
    /// Distance in meters
    pub distance_m: f64,
    pub elevation_gain_m: Option<f64>,
    pub avg_heartrate: Option<f64>,
    pub max_heartrate: Option<f64>,
    pub avg_power: Option<f64>,
    pub max_power: Option<f64>,
    pub avg_cadence: Option<f64>,
    pub max_cadence: Option<f64>,
    /// Recording device (e.g. "Garmin Edge 530")
    pub device: Option<String>,
    /// Identifier assigned by an external service, if known
    pub external_id: Option<String>,
}

/// Normalized parser output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedActivity {
    pub metadata: ActivityMetadata,
    pub streams: Streams,
}

/// Stored activity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: u64,
    pub name: String,
    pub sport_type: SportType,
    pub start_time: DateTime<Utc>,
    pub duration_s: f64,
    pub distance_m: f64,
    pub elevation_gain_m: Option<f64>,
    pub avg_heartrate: Option<f64>,
    pub max_heartrate: Option<f64>,
    pub avg_power: Option<f64>,
    pub max_power: Option<f64>,
    pub avg_cadence: Option<f64>,
    pub max_cadence: Option<f64>,
    pub device: Option<String>,
    pub external_id: Option<String>,
    /// Gear hint from a bulk metadata sheet
    pub gear: Option<String>,
    /// Semantic fingerprint used for near-duplicate detection
    pub fingerprint: String,
    /// Detected file format of the source ("fit", "gpx", "tcx")
    pub source_format: String,
    /// Basename of the source file
    pub source_filename: String,
    pub import_file_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Activity fields supplied on insert; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub name: String,
    pub metadata: ActivityMetadata,
    pub gear: Option<String>,
    pub fingerprint: String,
    pub source_format: String,
    pub source_filename: String,
    pub import_file_id: Option<u64>,
}

/// Naming and gear hints from a bulk metadata sheet, keyed by source filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataHint {
    /// Lower-cased basename of the activity file the row describes
    pub source_filename: String,
    pub name: Option<String>,
    pub gear: Option<String>,
    pub external_id: Option<String>,
    pub sport_label: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Image attached to an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMedia {
    pub activity_id: u64,
    pub filename: String,
    pub stored_path: String,
    pub created_at: DateTime<Utc>,
}

/// Image waiting for its activity to be imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedMedia {
    pub external_id: String,
    pub filename: String,
    pub stored_path: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for activity listings used by backfills.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    /// Source format ("fit", "gpx", "tcx")
    pub source_format: Option<String>,
    pub sport_type: Option<SportType>,
}

impl ActivityFilter {
    pub fn matches(&self, activity: &Activity) -> bool {
        self.source_format
            .as_deref()
            .is_none_or(|f| f.eq_ignore_ascii_case(&activity.source_format))
            && self.sport_type.is_none_or(|s| s == activity.sport_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sport_mapping_substrings() {
        assert_eq!(SportType::from_label("running"), SportType::Run);
        assert_eq!(SportType::from_label("TrailRun"), SportType::Run);
        assert_eq!(SportType::from_label("Biking"), SportType::Ride);
        assert_eq!(SportType::from_label("cycling"), SportType::Ride);
        assert_eq!(SportType::from_label("Mountain Bike Ride"), SportType::Ride);
        assert_eq!(SportType::from_label("hiking"), SportType::Walk);
        assert_eq!(SportType::from_label("Walk"), SportType::Walk);
        assert_eq!(SportType::from_label("open_water_swimming"), SportType::Swim);
        assert_eq!(SportType::from_label("yoga"), SportType::Workout);
    }

    #[test]
    fn test_sport_mapping_rejects_mime_types() {
        assert_eq!(SportType::from_label("text/html"), SportType::Workout);
        assert_eq!(SportType::from_label("application/run+xml"), SportType::Workout);
    }

    #[test]
    fn test_families() {
        assert_eq!(SportType::Walk.family(), Some(SportFamily::RunLike));
        assert_eq!(SportType::Ride.family(), Some(SportFamily::RideLike));
        assert_eq!(SportType::Swim.family(), None);
    }

    #[test]
    fn test_null_island_is_invalid() {
        assert!(!LatLng::new(0.0, 0.0).is_valid());
        assert!(LatLng::new(37.4, -122.1).is_valid());
        assert!(!LatLng::new(91.0, 0.5).is_valid());
    }
}
