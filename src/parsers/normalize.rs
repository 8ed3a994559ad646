// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Turns raw per-point samples into a [`ParsedActivity`].
//!
//! Parsers collect [`Sample`]s plus whatever summary totals the file
//! carries; everything else (ordering, time offsets, gap filling, distance
//! and speed derivation, aggregates) happens here so the three formats
//! behave the same.

use crate::error::{AppError, Result};
use crate::models::{ActivityMetadata, LatLng, ParsedActivity, SportType, Streams};
use crate::services::geo_utils::haversine_m;
use chrono::{DateTime, Utc};

/// Minimum altitude step counted towards recomputed elevation gain.
const GAIN_STEP_M: f64 = 0.1;

/// One trackpoint as read from a file.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub time: Option<DateTime<Utc>>,
    pub latlng: Option<LatLng>,
    pub altitude: Option<f64>,
    pub heartrate: Option<f64>,
    pub power: Option<f64>,
    pub cadence: Option<f64>,
    /// Cumulative distance embedded in the file
    pub distance: Option<f64>,
    pub speed: Option<f64>,
}

/// Activity-level totals reported by the file itself.
#[derive(Debug, Clone, Default)]
pub struct SummaryTotals {
    pub start_time: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub distance_m: Option<f64>,
    pub elevation_gain_m: Option<f64>,
    pub avg_heartrate: Option<f64>,
    pub max_heartrate: Option<f64>,
    pub avg_power: Option<f64>,
    pub max_power: Option<f64>,
    pub avg_cadence: Option<f64>,
    pub max_cadence: Option<f64>,
}

/// Everything a parser extracted, before normalization.
#[derive(Debug, Clone)]
pub struct RawActivity {
    pub format: &'static str,
    pub name: Option<String>,
    pub sport_label: Option<String>,
    pub device: Option<String>,
    pub external_id: Option<String>,
    pub samples: Vec<Sample>,
    pub summary: SummaryTotals,
}

impl RawActivity {
    pub fn new(format: &'static str) -> Self {
        Self {
            format,
            name: None,
            sport_label: None,
            device: None,
            external_id: None,
            samples: Vec::new(),
            summary: SummaryTotals::default(),
        }
    }
}

/// Normalize a raw activity.
///
/// Fails if no sample has a timestamp. XML formats additionally need a
/// timestamped sample with a position or a positive cumulative distance;
/// FIT records may carry only sensor data (indoor trainer rides).
pub fn build_activity(raw: RawActivity, fallback_name: &str) -> Result<ParsedActivity> {
    let RawActivity {
        format,
        name,
        sport_label,
        device,
        external_id,
        samples,
        summary,
    } = raw;

    let mut samples: Vec<(DateTime<Utc>, Sample)> = samples
        .into_iter()
        .filter_map(|mut s| {
            s.latlng = s.latlng.filter(LatLng::is_valid);
            s.time.map(|t| (t, s))
        })
        .collect();
    samples.sort_by_key(|(t, _)| *t);

    let has_signal = samples
        .iter()
        .any(|(_, s)| s.latlng.is_some() || s.distance.is_some_and(|d| d > 0.0));
    if format != "fit" && !has_signal {
        return Err(AppError::parse(
            format,
            "no trackpoint with both a timestamp and a position or distance",
        ));
    }

    let Some(start) = samples.first().map(|(t, _)| *t) else {
        return Err(AppError::parse(format, "no timestamped samples"));
    };
    let time: Vec<u32> = samples
        .iter()
        .map(|(t, _)| (*t - start).num_seconds().max(0) as u32)
        .collect();

    let latlng = fill(samples.iter().map(|(_, s)| s.latlng).collect());
    let altitude = fill(samples.iter().map(|(_, s)| s.altitude).collect());
    let heartrate = fill(samples.iter().map(|(_, s)| s.heartrate).collect());
    let power = fill(samples.iter().map(|(_, s)| s.power).collect());
    let cadence = fill(samples.iter().map(|(_, s)| s.cadence).collect());

    let embedded_distance: Vec<Option<f64>> = samples.iter().map(|(_, s)| s.distance).collect();
    let distance = resolve_distance(&embedded_distance, latlng.as_deref());

    let embedded_speed = fill(samples.iter().map(|(_, s)| s.speed).collect());
    let speed = embedded_speed.or_else(|| {
        distance
            .as_deref()
            .map(|d| derive_speed(d, &time))
    });

    let raw_values = |get: fn(&Sample) -> Option<f64>| -> Vec<f64> {
        samples.iter().filter_map(|(_, s)| get(s)).collect()
    };
    let hr_values = raw_values(|s| s.heartrate);
    let power_values = raw_values(|s| s.power);
    let cadence_values = raw_values(|s| s.cadence);

    let stream_duration = time.last().copied().unwrap_or(0) as f64;
    let stream_distance = distance
        .as_ref()
        .and_then(|d| d.last().copied())
        .unwrap_or(0.0);

    let metadata = ActivityMetadata {
        name: name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| Some(fallback_name.to_string()).filter(|n| !n.is_empty())),
        sport_type: sport_label
            .as_deref()
            .map(SportType::from_label)
            .unwrap_or(SportType::Workout),
        start_time: summary.start_time.unwrap_or(start),
        duration_s: summary.duration_s.unwrap_or(stream_duration),
        distance_m: summary.distance_m.unwrap_or(stream_distance),
        elevation_gain_m: summary
            .elevation_gain_m
            .or_else(|| altitude.as_deref().map(elevation_gain)),
        avg_heartrate: summary.avg_heartrate.or_else(|| mean(&hr_values)),
        max_heartrate: summary.max_heartrate.or_else(|| max(&hr_values)),
        avg_power: summary.avg_power.or_else(|| mean(&power_values)),
        max_power: summary.max_power.or_else(|| max(&power_values)),
        avg_cadence: summary.avg_cadence.or_else(|| mean(&cadence_values)),
        max_cadence: summary.max_cadence.or_else(|| max(&cadence_values)),
        device,
        external_id,
    };

    Ok(ParsedActivity {
        metadata,
        streams: Streams {
            time,
            latlng,
            altitude,
            heartrate,
            power,
            cadence,
            distance,
            speed,
        },
    })
}

/// Activity with summary totals only and empty streams.
pub fn summary_only(raw: RawActivity, start_time: DateTime<Utc>, fallback_name: &str) -> ParsedActivity {
    let summary = raw.summary;
    ParsedActivity {
        metadata: ActivityMetadata {
            name: raw
                .name
                .filter(|n| !n.trim().is_empty())
                .or_else(|| Some(fallback_name.to_string())),
            sport_type: raw
                .sport_label
                .as_deref()
                .map(SportType::from_label)
                .unwrap_or(SportType::Workout),
            start_time,
            duration_s: summary.duration_s.unwrap_or(0.0),
            distance_m: summary.distance_m.unwrap_or(0.0),
            elevation_gain_m: summary.elevation_gain_m,
            avg_heartrate: summary.avg_heartrate,
            max_heartrate: summary.max_heartrate,
            avg_power: summary.avg_power,
            max_power: summary.max_power,
            avg_cadence: summary.avg_cadence,
            max_cadence: summary.max_cadence,
            device: raw.device,
            external_id: raw.external_id,
        },
        streams: Streams::default(),
    }
}

/// Build a stream from optional values.
///
/// Returns `None` when no value is present. Gaps take the nearest earlier
/// value; leading gaps take the first value.
pub fn fill<T: Copy>(values: Vec<Option<T>>) -> Option<Vec<T>> {
    let first = values.iter().flatten().next().copied()?;
    let mut last = first;
    Some(
        values
            .into_iter()
            .map(|v| {
                if let Some(v) = v {
                    last = v;
                }
                last
            })
            .collect(),
    )
}

/// Pick the distance stream.
///
/// Embedded cumulative distance wins when it is non-decreasing and ends
/// above zero; otherwise distance is accumulated along the coordinates.
fn resolve_distance(embedded: &[Option<f64>], latlng: Option<&[LatLng]>) -> Option<Vec<f64>> {
    let present: Vec<f64> = embedded.iter().flatten().copied().collect();
    let monotonic = present.windows(2).all(|w| w[1] >= w[0]);
    let usable = !present.is_empty() && monotonic && present.last().is_some_and(|d| *d > 0.0);

    if usable {
        return fill(embedded.to_vec());
    }
    if let Some(points) = latlng {
        return Some(cumulative_distance(points));
    }
    // No coordinates: keep whatever embedded signal exists, clamped to be monotonic
    fill(embedded.to_vec()).map(|mut d| {
        for i in 1..d.len() {
            if d[i] < d[i - 1] {
                d[i] = d[i - 1];
            }
        }
        d
    })
}

/// Cumulative great-circle distance along a path.
pub fn cumulative_distance(points: &[LatLng]) -> Vec<f64> {
    let mut out = Vec::with_capacity(points.len());
    let mut total = 0.0;
    for (i, point) in points.iter().enumerate() {
        if i > 0 {
            total += haversine_m(points[i - 1], *point);
        }
        out.push(total);
    }
    out
}

/// Speed as distance delta over time delta; repeats the previous value when
/// two samples share a timestamp.
fn derive_speed(distance: &[f64], time: &[u32]) -> Vec<f64> {
    let mut out = Vec::with_capacity(distance.len());
    let mut last = 0.0;
    for i in 0..distance.len() {
        if i > 0 {
            let dt = time[i].saturating_sub(time[i - 1]) as f64;
            if dt > 0.0 {
                last = ((distance[i] - distance[i - 1]) / dt).max(0.0);
            }
        }
        out.push(last);
    }
    if out.len() > 1 {
        out[0] = out[1];
    }
    out
}

/// Sum of positive altitude steps above [`GAIN_STEP_M`].
pub fn elevation_gain(altitude: &[f64]) -> f64 {
    altitude
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| *d > GAIN_STEP_M)
        .sum()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample(offset: i64, lat: f64, alt: f64) -> Sample {
        Sample {
            time: Some(Utc.with_ymd_and_hms(2024, 4, 1, 7, 0, 0).unwrap() + Duration::seconds(offset)),
            latlng: Some(LatLng::new(lat, -122.0)),
            altitude: Some(alt),
            ..Default::default()
        }
    }

    #[test]
    fn test_samples_sorted_and_offset_from_zero() {
        let mut raw = RawActivity::new("gpx");
        raw.sport_label = Some("running".to_string());
        raw.samples = vec![sample(10, 37.001, 12.0), sample(0, 37.0, 10.0), sample(5, 37.0005, 11.0)];
        let parsed = build_activity(raw, "morning").unwrap();

        assert_eq!(parsed.streams.time, vec![0, 5, 10]);
        assert_eq!(parsed.metadata.sport_type, SportType::Run);
        assert_eq!(parsed.metadata.name.as_deref(), Some("morning"));
        let distance = parsed.streams.distance.unwrap();
        assert_eq!(distance[0], 0.0);
        assert!((distance[2] - 111.2).abs() < 1.0, "got {}", distance[2]);
        assert!((parsed.metadata.elevation_gain_m.unwrap() - 2.0).abs() < 1e-9);
        assert!(parsed.streams.speed.is_some());
    }

    #[test]
    fn test_fill_forward_and_leading() {
        assert_eq!(fill(vec![None, Some(2), None, Some(4), None]), Some(vec![2, 2, 2, 4, 4]));
        assert_eq!(fill::<u8>(vec![None, None]), None);
    }

    #[test]
    fn test_non_monotonic_embedded_distance_is_replaced() {
        let mut raw = RawActivity::new("tcx");
        raw.samples = vec![sample(0, 37.0, 0.0), sample(1, 37.001, 0.0)];
        raw.samples[0].distance = Some(50.0);
        raw.samples[1].distance = Some(10.0);
        let parsed = build_activity(raw, "x").unwrap();
        let distance = parsed.streams.distance.unwrap();
        assert!(distance[1] > 100.0);
    }

    #[test]
    fn test_fails_without_position_or_distance() {
        let mut raw = RawActivity::new("gpx");
        raw.samples = vec![Sample {
            time: Some(Utc::now()),
            heartrate: Some(120.0),
            ..Default::default()
        }];
        assert!(matches!(
            build_activity(raw, "x"),
            Err(AppError::Parse { format: "gpx", .. })
        ));
    }

    #[test]
    fn test_fit_sensor_only_records_are_accepted() {
        let start = Utc.with_ymd_and_hms(2024, 1, 10, 18, 0, 0).unwrap();
        let mut raw = RawActivity::new("fit");
        raw.samples = (0..10)
            .map(|i| Sample {
                time: Some(start + Duration::seconds(i)),
                heartrate: Some(130.0 + i as f64),
                power: Some(200.0),
                ..Default::default()
            })
            .collect();
        let parsed = build_activity(raw, "trainer").unwrap();

        assert_eq!(parsed.streams.time, (0..10).collect::<Vec<u32>>());
        assert!(parsed.streams.latlng.is_none());
        assert!(parsed.streams.distance.is_none());
        assert_eq!(parsed.streams.power.as_deref(), Some(&[200.0; 10][..]));
        assert_eq!(parsed.metadata.duration_s, 9.0);
        assert_eq!(parsed.metadata.distance_m, 0.0);
    }

    #[test]
    fn test_summary_totals_take_precedence() {
        let mut raw = RawActivity::new("fit");
        raw.samples = vec![sample(0, 37.0, 10.0), sample(60, 37.01, 30.0)];
        raw.summary.distance_m = Some(1234.0);
        raw.summary.elevation_gain_m = Some(25.0);
        let parsed = build_activity(raw, "x").unwrap();
        assert_eq!(parsed.metadata.distance_m, 1234.0);
        assert_eq!(parsed.metadata.elevation_gain_m, Some(25.0));
        assert_eq!(parsed.metadata.duration_s, 60.0);
    }
}
