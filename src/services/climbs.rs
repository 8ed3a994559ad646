// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Climb detection.
//!
//! A single pass over consecutive samples grows a candidate climb from the
//! first ascending step and closes it once the route has gone flat or
//! downhill for too long, dropped too far below its summit, or exceeded
//! the distance or time caps. A closed candidate is trimmed to its summit
//! and accepted if it is long, high and steep enough.
//!
//! Ascending steps use a hysteresis reference: the altitude must rise more
//! than the noise threshold above the last registered level, so densely
//! sampled gentle grades still register and GPS jitter does not.

use crate::models::{ClimbCategory, DetectedClimb, LatLng, SportType, Streams};
use crate::parsers::normalize::cumulative_distance;
use crate::services::dedup::hash_key;
use crate::services::naming::climb_label;
use std::borrow::Cow;

/// Tunable thresholds. The defaults are empirically tuned.
#[derive(Debug, Clone, PartialEq)]
pub struct ClimbParams {
    /// Minimum rise that counts as an ascending step
    pub ascend_noise_m: f64,
    pub min_distance_m: f64,
    pub min_gain_m: f64,
    pub min_grade_pct: f64,
    /// Flat or descending distance that closes a candidate
    pub max_flat_run_m: f64,
    /// Drop below the running summit that closes a candidate
    pub max_drop_m: f64,
    /// Candidate length cap; no accepted climb is longer
    pub max_distance_m: f64,
    pub max_elapsed_s: u32,
    /// Long gentle climbs below `min_grade_pct` are accepted with these floors
    pub relaxed_min_distance_m: f64,
    pub relaxed_min_gain_m: f64,
    pub relaxed_min_grade_pct: f64,
}

impl Default for ClimbParams {
    fn default() -> Self {
        Self {
            ascend_noise_m: 0.8,
            min_distance_m: 500.0,
            min_gain_m: 20.0,
            min_grade_pct: 3.0,
            max_flat_run_m: 400.0,
            max_drop_m: 25.0,
            max_distance_m: 30_000.0,
            max_elapsed_s: 4 * 3600,
            relaxed_min_distance_m: 10_000.0,
            relaxed_min_gain_m: 300.0,
            relaxed_min_grade_pct: 1.8,
        }
    }
}

/// Index-aligned time, altitude and distance for one activity.
///
/// Distance comes from the native stream when it is present and
/// non-decreasing, and from great-circle steps between positions otherwise.
#[derive(Debug, Clone)]
pub struct RouteProfile<'a> {
    pub time: &'a [u32],
    pub altitude: Option<&'a [f64]>,
    pub distance: Cow<'a, [f64]>,
    pub latlng: Option<&'a [LatLng]>,
}

impl<'a> RouteProfile<'a> {
    pub fn from_streams(streams: &'a Streams) -> Option<Self> {
        let n = streams.time.len();
        let latlng = streams.latlng.as_deref().filter(|p| p.len() == n);
        let altitude = streams.altitude.as_deref().filter(|a| a.len() == n);

        let native = streams
            .distance
            .as_deref()
            .filter(|d| d.len() == n && d.windows(2).all(|w| w[1] >= w[0]));
        let distance = match (native, latlng) {
            (Some(d), _) => Cow::Borrowed(d),
            (None, Some(points)) => Cow::Owned(cumulative_distance(points)),
            (None, None) => return None,
        };
        if n < 2 {
            return None;
        }

        Some(Self {
            time: &streams.time,
            altitude,
            distance,
            latlng,
        })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn point(&self, index: usize) -> Option<LatLng> {
        self.latlng.and_then(|p| p.get(index).copied())
    }

    pub fn span_distance(&self, start: usize, end: usize) -> f64 {
        self.distance[end] - self.distance[start]
    }

    pub fn span_elapsed(&self, start: usize, end: usize) -> u32 {
        self.time[end].saturating_sub(self.time[start])
    }

    /// Net gain over a range, 0 without altitude.
    pub fn span_gain(&self, start: usize, end: usize) -> f64 {
        self.altitude.map_or(0.0, |a| a[end] - a[start])
    }
}

/// Grade in percent, 0 for a zero-length span.
pub fn grade_pct(gain_m: f64, distance_m: f64) -> f64 {
    if distance_m > 0.0 {
        gain_m / distance_m * 100.0
    } else {
        0.0
    }
}

/// Difficulty category from `distance_km × grade` and raw gain; the higher wins.
pub fn categorize(distance_m: f64, gain_m: f64, grade: f64) -> Option<ClimbCategory> {
    let score = distance_m / 1000.0 * grade;
    let by_score = if score >= 80.0 {
        Some(ClimbCategory::Hc)
    } else if score >= 64.0 {
        Some(ClimbCategory::Cat1)
    } else if score >= 32.0 {
        Some(ClimbCategory::Cat2)
    } else if score >= 16.0 {
        Some(ClimbCategory::Cat3)
    } else if score >= 8.0 {
        Some(ClimbCategory::Cat4)
    } else {
        None
    };
    let by_gain = if gain_m >= 1000.0 {
        Some(ClimbCategory::Hc)
    } else if gain_m >= 650.0 {
        Some(ClimbCategory::Cat1)
    } else if gain_m >= 400.0 {
        Some(ClimbCategory::Cat2)
    } else if gain_m >= 200.0 {
        Some(ClimbCategory::Cat3)
    } else {
        None
    };
    by_score.max(by_gain)
}

fn round_to_10(value: f64) -> i64 {
    ((value / 10.0).round() * 10.0) as i64
}

/// Stable identity of a climb across detection runs.
pub fn climb_fingerprint(
    sport: SportType,
    start: Option<LatLng>,
    end: Option<LatLng>,
    start_distance_m: f64,
    distance_m: f64,
    gain_m: f64,
    grade: f64,
) -> String {
    let endpoints = match (start, end) {
        (Some(s), Some(e)) => format!("{:.4}|{:.4}|{:.4}|{:.4}", s.lat, s.lng, e.lat, e.lng),
        _ => format!("d{}", round_to_10(start_distance_m)),
    };
    let key = format!(
        "climb|{}|{}|{}|{}|{:.1}",
        sport.as_str().to_ascii_lowercase(),
        endpoints,
        round_to_10(distance_m),
        gain_m.round() as i64,
        grade
    );
    let mut digest = hash_key(&key);
    digest.truncate(32);
    digest
}

struct Candidate {
    start: usize,
    peak: usize,
    /// Hysteresis level for ascending steps
    reference: f64,
    last_ascent_distance: f64,
}

/// Find climbs in one activity. Deterministic and single-threaded.
pub fn detect_climbs(streams: &Streams, sport: SportType, params: &ClimbParams) -> Vec<DetectedClimb> {
    let Some(profile) = RouteProfile::from_streams(streams) else {
        return Vec::new();
    };
    let Some(alt) = profile.altitude else {
        return Vec::new();
    };
    let dist = &profile.distance;
    let n = profile.len();

    let mut climbs = Vec::new();
    let mut base = 0usize;
    let mut candidate: Option<Candidate> = None;
    let mut i = 1;

    while i < n {
        let Some(c) = candidate.as_mut() else {
            if alt[i] - alt[base] > params.ascend_noise_m {
                candidate = Some(Candidate {
                    start: base,
                    peak: i,
                    reference: alt[i],
                    last_ascent_distance: dist[i],
                });
            } else if alt[i] <= alt[base] || dist[i] - dist[base] > params.max_flat_run_m {
                base = i;
            }
            i += 1;
            continue;
        };

        // Caps are checked before sample i joins, so the summit so far stays within them
        if dist[i] - dist[c.start] > params.max_distance_m
            || profile.span_elapsed(c.start, i) > params.max_elapsed_s
        {
            let (start, peak) = (c.start, c.peak);
            climbs.extend(evaluate(&profile, alt, start, peak, sport, params));
            candidate = None;
            base = peak;
            continue;
        }

        if alt[i] > alt[c.peak] {
            c.peak = i;
        }
        if alt[i] > c.reference + params.ascend_noise_m {
            c.reference = alt[i];
            c.last_ascent_distance = dist[i];
        } else if alt[i] < c.reference - params.ascend_noise_m {
            c.reference = alt[i];
        }

        let flat_run = dist[i] - c.last_ascent_distance;
        let drop = alt[c.peak] - alt[i];
        if flat_run > params.max_flat_run_m || drop > params.max_drop_m {
            let (start, peak) = (c.start, c.peak);
            climbs.extend(evaluate(&profile, alt, start, peak, sport, params));
            candidate = None;
            base = (peak..=i)
                .min_by(|&a, &b| alt[a].total_cmp(&alt[b]))
                .unwrap_or(i);
        }
        i += 1;
    }

    if let Some(c) = candidate {
        climbs.extend(evaluate(&profile, alt, c.start, c.peak, sport, params));
    }

    tracing::debug!(samples = n, climbs = climbs.len(), "Climb detection finished");
    climbs
}

fn evaluate(
    profile: &RouteProfile<'_>,
    alt: &[f64],
    start: usize,
    end: usize,
    sport: SportType,
    params: &ClimbParams,
) -> Option<DetectedClimb> {
    if end <= start {
        return None;
    }
    let distance = profile.span_distance(start, end);
    let gain = alt[end] - alt[start];
    if distance <= 0.0 || distance > params.max_distance_m {
        return None;
    }
    let grade = grade_pct(gain, distance);

    let strict = grade >= params.min_grade_pct;
    let relaxed = distance >= params.relaxed_min_distance_m
        && gain >= params.relaxed_min_gain_m
        && grade >= params.relaxed_min_grade_pct;
    if distance < params.min_distance_m || gain < params.min_gain_m || !(strict || relaxed) {
        return None;
    }

    let total_ascent: f64 = alt[start..=end]
        .windows(2)
        .map(|w| (w[1] - w[0]).max(0.0))
        .sum();
    let start_latlng = profile.point(start);
    let end_latlng = profile.point(end);
    let start_distance = profile.distance[start];
    let category = categorize(distance, gain, grade);

    Some(DetectedClimb {
        start_index: start,
        end_index: end,
        distance_m: distance,
        elevation_gain_m: gain,
        total_ascent_m: total_ascent,
        avg_grade_pct: grade,
        elapsed_s: profile.span_elapsed(start, end),
        start_latlng,
        end_latlng,
        start_distance_m: start_distance,
        fingerprint: climb_fingerprint(
            sport,
            start_latlng,
            end_latlng,
            start_distance,
            distance,
            gain,
            grade,
        ),
        name: climb_label(distance, grade, category),
        category,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Straight northward route sampled every `step_m`, altitude from `f(distance)`.
    fn profile(length_m: f64, step_m: f64, f: impl Fn(f64) -> f64) -> Streams {
        let n = (length_m / step_m).round() as usize + 1;
        let distance: Vec<f64> = (0..n).map(|i| i as f64 * step_m).collect();
        Streams {
            time: (0..n as u32).collect(),
            altitude: Some(distance.iter().map(|&d| f(d)).collect()),
            distance: Some(distance),
            ..Streams::default()
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(categorize(900.0, 45.0, 5.0), None);
        assert_eq!(categorize(2_000.0, 100.0, 5.0), Some(ClimbCategory::Cat4));
        assert_eq!(categorize(5_000.0, 300.0, 6.0), Some(ClimbCategory::Cat2));
        // Gain floor lifts a long gentle climb
        assert_eq!(categorize(24_000.0, 456.0, 1.9), Some(ClimbCategory::Cat2));
        assert_eq!(categorize(20_000.0, 1_600.0, 8.0), Some(ClimbCategory::Hc));
    }

    #[test]
    fn test_climb_then_descent() {
        let streams = profile(3_000.0, 10.0, |d| {
            if d <= 1_000.0 {
                100.0
            } else if d <= 2_000.0 {
                100.0 + (d - 1_000.0) * 0.06
            } else {
                160.0 - (d - 2_000.0) * 0.06
            }
        });
        let climbs = detect_climbs(&streams, SportType::Ride, &ClimbParams::default());
        assert_eq!(climbs.len(), 1);
        let climb = &climbs[0];
        assert_eq!(climb.end_index, 200);
        assert!(climb.start_index >= 99 && climb.start_index <= 100);
        assert!((climb.elevation_gain_m - 60.0).abs() < 0.01);
        assert!((climb.avg_grade_pct - 6.0).abs() < 0.1);
        assert_eq!(climb.start_latlng, None);
        assert_eq!(climb.fingerprint.len(), 32);
    }

    #[test]
    fn test_short_flat_inside_climb_does_not_split_it() {
        let streams = profile(2_200.0, 10.0, |d| {
            if d <= 1_000.0 {
                d * 0.05
            } else if d <= 1_200.0 {
                50.0
            } else {
                50.0 + (d - 1_200.0) * 0.05
            }
        });
        let climbs = detect_climbs(&streams, SportType::Run, &ClimbParams::default());
        assert_eq!(climbs.len(), 1);
        assert!((climbs[0].elevation_gain_m - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_fingerprint_is_stable_and_geometry_sensitive() {
        let a = climb_fingerprint(SportType::Ride, None, None, 1_000.0, 900.0, 45.0, 5.0);
        let b = climb_fingerprint(SportType::Ride, None, None, 1_002.0, 901.0, 45.2, 5.01);
        let c = climb_fingerprint(SportType::Ride, None, None, 2_000.0, 900.0, 45.0, 5.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_altitude_yields_nothing() {
        let mut streams = profile(2_000.0, 10.0, |d| d * 0.1);
        streams.altitude = None;
        assert!(detect_climbs(&streams, SportType::Ride, &ClimbParams::default()).is_empty());
    }

    #[test]
    fn test_profile_falls_back_to_positions() {
        let points: Vec<LatLng> = (0..11)
            .map(|i| LatLng::new(37.0 + i as f64 * 0.001, -122.0))
            .collect();
        let streams = Streams {
            time: (0..11).collect(),
            latlng: Some(points),
            distance: Some(vec![0.0, 5.0, 3.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0]),
            ..Streams::default()
        };
        let profile = RouteProfile::from_streams(&streams).unwrap();
        assert!((profile.span_distance(0, 10) - 1_112.0).abs() < 5.0);
    }
}
