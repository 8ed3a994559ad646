// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Manual segment matching.
//!
//! A segment is defined by a start/end index range inside one activity.
//! Other activities are searched for the sub-range whose endpoints fall
//! within a radius of the segment's endpoints, whose length is comparable
//! and whose overall direction agrees. The best-scoring range wins.

use crate::error::{AppError, Result};
use crate::models::{LatLng, SportFamily, SportType};
use crate::services::climbs::RouteProfile;
use crate::services::dedup::hash_key;
use crate::services::geo_utils::{bearing_deg, bearing_delta, haversine_m};

#[derive(Debug, Clone, PartialEq)]
pub struct MatchParams {
    /// Maximum distance between a candidate endpoint and the segment endpoint
    pub radius_m: f64,
    pub min_distance_ratio: f64,
    pub max_distance_ratio: f64,
    pub bearing_tolerance_deg: f64,
    pub distance_weight: f64,
    pub location_weight: f64,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            radius_m: 60.0,
            min_distance_ratio: 0.5,
            max_distance_ratio: 1.8,
            bearing_tolerance_deg: 70.0,
            distance_weight: 1.0,
            location_weight: 2.0,
        }
    }
}

impl MatchParams {
    pub fn with_radius(radius_m: f64) -> Self {
        Self {
            radius_m,
            ..Self::default()
        }
    }
}

/// Geometry of a user-chosen range.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTarget {
    pub start: LatLng,
    pub end: LatLng,
    pub distance_m: f64,
    pub bearing_deg: f64,
    pub sport: SportType,
}

impl SegmentTarget {
    pub fn from_range(
        profile: &RouteProfile<'_>,
        start_index: usize,
        end_index: usize,
        sport: SportType,
    ) -> Result<Self> {
        if start_index >= end_index || end_index >= profile.len() {
            return Err(AppError::BadRequest(format!(
                "invalid segment range {}..{} for {} samples",
                start_index,
                end_index,
                profile.len()
            )));
        }
        let (Some(start), Some(end)) = (profile.point(start_index), profile.point(end_index)) else {
            return Err(AppError::BadRequest(
                "activity has no position stream".to_string(),
            ));
        };
        let distance_m = profile.span_distance(start_index, end_index);
        if distance_m <= 0.0 {
            return Err(AppError::BadRequest(
                "segment range covers no distance".to_string(),
            ));
        }
        Ok(Self {
            start,
            end,
            distance_m,
            bearing_deg: bearing_deg(start, end),
            sport,
        })
    }

    pub fn family(&self) -> Option<SportFamily> {
        self.sport.family()
    }

    /// Stable identity of the segment geometry.
    pub fn fingerprint(&self) -> String {
        let family = self
            .family()
            .map(|f| f.as_str().to_string())
            .unwrap_or_else(|| self.sport.as_str().to_ascii_lowercase());
        let key = format!(
            "manual|{}|{:.4},{:.4}|{:.4},{:.4}|{}|{}",
            family,
            self.start.lat,
            self.start.lng,
            self.end.lat,
            self.end.lng,
            ((self.distance_m / 10.0).round() * 10.0) as i64,
            self.bearing_deg.round() as i64
        );
        let mut digest = hash_key(&key);
        digest.truncate(32);
        digest
    }

    /// Whether an activity of this sport may contain the segment.
    pub fn accepts(&self, sport: SportType) -> bool {
        match (self.family(), sport.family()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// A range of an activity matched to a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMatch {
    pub start_index: usize,
    pub end_index: usize,
    pub distance_m: f64,
    /// Start plus end endpoint error
    pub location_error_m: f64,
    pub score: f64,
}

/// The defining activity matches itself exactly.
pub fn defining_match(profile: &RouteProfile<'_>, start_index: usize, end_index: usize) -> SegmentMatch {
    SegmentMatch {
        start_index,
        end_index,
        distance_m: profile.span_distance(start_index, end_index),
        location_error_m: 0.0,
        score: 0.0,
    }
}

/// Best matching range in another activity, if any.
pub fn find_match(
    profile: &RouteProfile<'_>,
    target: &SegmentTarget,
    params: &MatchParams,
) -> Option<SegmentMatch> {
    let points = profile.latlng?;

    let near = |anchor: LatLng| -> Vec<(usize, f64)> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_valid())
            .map(|(i, p)| (i, haversine_m(*p, anchor)))
            .filter(|(_, d)| *d <= params.radius_m)
            .collect()
    };
    let starts = near(target.start);
    if starts.is_empty() {
        return None;
    }
    let ends = near(target.end);

    let min_distance = target.distance_m * params.min_distance_ratio;
    let max_distance = target.distance_m * params.max_distance_ratio;
    let mut best: Option<SegmentMatch> = None;

    for &(i, start_error) in &starts {
        for &(j, end_error) in ends.iter().filter(|(j, _)| *j > i) {
            let distance = profile.span_distance(i, j);
            if distance > max_distance {
                // Distance only grows with j
                break;
            }
            if distance < min_distance {
                continue;
            }
            let bearing = bearing_deg(points[i], points[j]);
            if bearing_delta(bearing, target.bearing_deg) > params.bearing_tolerance_deg {
                continue;
            }

            let location_error = start_error + end_error;
            let score = (distance - target.distance_m).abs() * params.distance_weight
                + location_error * params.location_weight;
            if best.as_ref().is_none_or(|b| score < b.score) {
                best = Some(SegmentMatch {
                    start_index: i,
                    end_index: j,
                    distance_m: distance,
                    location_error_m: location_error,
                    score,
                });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Streams;

    /// Northward route starting at `lat0`, one sample per ~11 m.
    fn route(lat0: f64, lng: f64, samples: usize) -> Streams {
        let latlng: Vec<LatLng> = (0..samples)
            .map(|i| LatLng::new(lat0 + i as f64 * 0.0001, lng))
            .collect();
        Streams {
            time: (0..samples as u32).collect(),
            latlng: Some(latlng),
            ..Streams::default()
        }
    }

    #[test]
    fn test_target_validation() {
        let streams = route(37.0, -122.0, 50);
        let profile = RouteProfile::from_streams(&streams).unwrap();
        assert!(SegmentTarget::from_range(&profile, 10, 10, SportType::Ride).is_err());
        assert!(SegmentTarget::from_range(&profile, 10, 50, SportType::Ride).is_err());
        let target = SegmentTarget::from_range(&profile, 10, 40, SportType::Ride).unwrap();
        assert!((target.distance_m - 333.6).abs() < 1.0);
        assert!(target.bearing_deg.abs() < 0.01);
    }

    #[test]
    fn test_match_offset_route() {
        let defining = route(37.0, -122.0, 100);
        let profile = RouteProfile::from_streams(&defining).unwrap();
        let target = SegmentTarget::from_range(&profile, 20, 80, SportType::Ride).unwrap();

        // Same road recorded 10 m east with samples shifted by half a step
        let other = route(37.00005, -121.999887, 100);
        let other_profile = RouteProfile::from_streams(&other).unwrap();
        let found = find_match(&other_profile, &target, &MatchParams::default()).unwrap();
        assert!(found.start_index == 19 || found.start_index == 20);
        assert!(found.end_index == 79 || found.end_index == 80);
        assert!(found.location_error_m < 40.0);
    }

    #[test]
    fn test_reverse_direction_is_rejected() {
        let defining = route(37.0, -122.0, 100);
        let profile = RouteProfile::from_streams(&defining).unwrap();
        let target = SegmentTarget::from_range(&profile, 20, 80, SportType::Run).unwrap();

        // Southward recording of the same road
        let mut reversed = defining.clone();
        if let Some(points) = reversed.latlng.as_mut() {
            points.reverse();
        }
        let reversed_profile = RouteProfile::from_streams(&reversed).unwrap();
        assert!(find_match(&reversed_profile, &target, &MatchParams::default()).is_none());
    }

    #[test]
    fn test_far_away_route_does_not_match() {
        let defining = route(37.0, -122.0, 100);
        let profile = RouteProfile::from_streams(&defining).unwrap();
        let target = SegmentTarget::from_range(&profile, 20, 80, SportType::Ride).unwrap();
        let elsewhere = route(38.0, -122.0, 100);
        let elsewhere_profile = RouteProfile::from_streams(&elsewhere).unwrap();
        assert!(find_match(&elsewhere_profile, &target, &MatchParams::default()).is_none());
    }

    #[test]
    fn test_families_and_fingerprint() {
        let streams = route(37.0, -122.0, 50);
        let profile = RouteProfile::from_streams(&streams).unwrap();
        let target = SegmentTarget::from_range(&profile, 0, 30, SportType::Run).unwrap();
        assert!(target.accepts(SportType::Walk));
        assert!(!target.accepts(SportType::Ride));
        assert!(!target.accepts(SportType::Swim));

        let same = SegmentTarget::from_range(&profile, 0, 30, SportType::Walk).unwrap();
        assert_eq!(target.fingerprint(), same.fingerprint());
        let ride = SegmentTarget::from_range(&profile, 0, 30, SportType::Ride).unwrap();
        assert_ne!(target.fingerprint(), ride.fingerprint());
    }
}
