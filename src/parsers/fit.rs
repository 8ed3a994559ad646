// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! FIT binary parser.

use crate::error::{AppError, Result};
use crate::models::{LatLng, ParsedActivity};
use crate::parsers::normalize::{self, RawActivity, Sample};
use chrono::{DateTime, Utc};
use fitparser::profile::MesgNum;
use fitparser::{FitDataRecord, Value};

const FORMAT: &str = "fit";

/// Semicircles per 180 degrees.
const SEMICIRCLE_SCALE: f64 = 2_147_483_648.0;

/// Parse a FIT file.
///
/// A file with no record messages and no session start time (device info,
/// settings, course files) fails with [`AppError::MetadataOnly`] rather than
/// a parse error, so batch callers can skip it.
pub fn parse(bytes: &[u8], fallback_name: &str) -> Result<ParsedActivity> {
    let messages =
        fitparser::de::from_bytes(bytes).map_err(|e| AppError::parse(FORMAT, e.to_string()))?;

    let mut raw = RawActivity::new(FORMAT);
    let mut manufacturer: Option<String> = None;
    let mut product: Option<String> = None;

    for message in &messages {
        match message.kind() {
            MesgNum::Record => {
                if let Some(sample) = record_sample(message) {
                    raw.samples.push(sample);
                }
            }
            MesgNum::Session => read_session(message, &mut raw),
            MesgNum::Sport => {
                for field in message.fields() {
                    match field.name() {
                        "sport" if raw.sport_label.is_none() => {
                            raw.sport_label = value_string(field.value())
                        }
                        "name" if raw.name.is_none() => raw.name = value_string(field.value()),
                        _ => {}
                    }
                }
            }
            MesgNum::FileId | MesgNum::DeviceInfo => {
                for field in message.fields() {
                    match field.name() {
                        "manufacturer" if manufacturer.is_none() => {
                            manufacturer = value_string(field.value())
                        }
                        "product_name" | "garmin_product" | "product" if product.is_none() => {
                            product = value_string(field.value())
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    raw.device = match (manufacturer, product) {
        (Some(m), Some(p)) => Some(format!("{} {}", m, p)),
        (Some(m), None) => Some(m),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    };

    let has_timed_record = raw.samples.iter().any(|s| s.time.is_some());
    if !has_timed_record {
        return match raw.summary.start_time {
            Some(start) => Ok(normalize::summary_only(raw, start, fallback_name)),
            None => Err(AppError::MetadataOnly(format!(
                "{} has no records and no session start time",
                fallback_name
            ))),
        };
    }

    normalize::build_activity(raw, fallback_name)
}

fn record_sample(message: &FitDataRecord) -> Option<Sample> {
    let mut sample = Sample::default();
    let mut lat: Option<f64> = None;
    let mut lng: Option<f64> = None;

    for field in message.fields() {
        let value = field.value();
        match field.name() {
            "timestamp" => sample.time = value_time(value),
            "position_lat" => lat = fit_value_to_f64(value).map(to_degrees),
            "position_long" => lng = fit_value_to_f64(value).map(to_degrees),
            "enhanced_altitude" => sample.altitude = fit_value_to_f64(value),
            "altitude" if sample.altitude.is_none() => sample.altitude = fit_value_to_f64(value),
            "heart_rate" => sample.heartrate = fit_value_to_f64(value),
            "power" => sample.power = fit_value_to_f64(value),
            "cadence" => sample.cadence = fit_value_to_f64(value),
            "distance" => sample.distance = fit_value_to_f64(value),
            "enhanced_speed" => sample.speed = fit_value_to_f64(value),
            "speed" if sample.speed.is_none() => sample.speed = fit_value_to_f64(value),
            _ => {}
        }
    }

    if let (Some(lat), Some(lng)) = (lat, lng) {
        sample.latlng = Some(LatLng::new(lat, lng));
    }
    sample.time.map(|_| sample)
}

fn read_session(message: &FitDataRecord, raw: &mut RawActivity) {
    let summary = &mut raw.summary;
    for field in message.fields() {
        let value = field.value();
        match field.name() {
            "start_time" => summary.start_time = summary.start_time.or(value_time(value)),
            "total_elapsed_time" => summary.duration_s = fit_value_to_f64(value),
            "total_timer_time" if summary.duration_s.is_none() => {
                summary.duration_s = fit_value_to_f64(value)
            }
            "total_distance" => summary.distance_m = fit_value_to_f64(value),
            "total_ascent" => summary.elevation_gain_m = fit_value_to_f64(value),
            "avg_heart_rate" => summary.avg_heartrate = fit_value_to_f64(value),
            "max_heart_rate" => summary.max_heartrate = fit_value_to_f64(value),
            "avg_power" => summary.avg_power = fit_value_to_f64(value),
            "max_power" => summary.max_power = fit_value_to_f64(value),
            "avg_cadence" => summary.avg_cadence = fit_value_to_f64(value),
            "max_cadence" => summary.max_cadence = fit_value_to_f64(value),
            "sport" => {
                if let Some(sport) = value_string(value) {
                    raw.sport_label = Some(sport);
                }
            }
            _ => {}
        }
    }
}

/// Convert a raw position to degrees.
///
/// Devices report semicircles; values already within +/-180 are taken as degrees.
fn to_degrees(value: f64) -> f64 {
    if value.abs() > 180.0 {
        value * 180.0 / SEMICIRCLE_SCALE
    } else {
        value
    }
}

fn value_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(ts) => Some(ts.with_timezone(&Utc)),
        _ => None,
    }
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::String(_) => None,
        other => fit_value_to_f64(other).map(|v| format!("{}", v)),
    }
}

fn fit_value_to_f64(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Float32(v) => *v as f64,
        Value::Float64(v) => *v,
        Value::SInt8(v) => *v as f64,
        Value::SInt16(v) => *v as f64,
        Value::SInt32(v) => *v as f64,
        Value::SInt64(v) => *v as f64,
        Value::UInt8(v) => *v as f64,
        Value::UInt8z(v) => *v as f64,
        Value::UInt16(v) => *v as f64,
        Value::UInt16z(v) => *v as f64,
        Value::UInt32(v) => *v as f64,
        Value::UInt32z(v) => *v as f64,
        Value::UInt64(v) => *v as f64,
        Value::UInt64z(v) => *v as f64,
        Value::Byte(v) => *v as f64,
        Value::Array(values) => return values.iter().find_map(fit_value_to_f64),
        _ => return None,
    };
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semicircles_converted() {
        let deg = to_degrees(445_000_000.0);
        assert!((deg - 37.3).abs() < 0.01, "got {}", deg);
        assert_eq!(to_degrees(37.3), 37.3);
        assert!((to_degrees(-1_455_000_000.0) + 121.96).abs() < 0.01);
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = parse(b"definitely not a fit file", "x.fit").unwrap_err();
        assert!(matches!(err, AppError::Parse { format: "fit", .. }));
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(fit_value_to_f64(&Value::UInt16(150)), Some(150.0));
        assert_eq!(
            fit_value_to_f64(&Value::Array(vec![Value::String("x".into()), Value::SInt8(-3)])),
            Some(-3.0)
        );
        assert_eq!(value_string(&Value::String("cycling".into())), Some("cycling".into()));
    }
}
