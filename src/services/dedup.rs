// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Content hashes and activity fingerprints.

use crate::models::ActivityMetadata;
use crate::time_utils::format_utc_rfc3339;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the raw uploaded bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of an arbitrary key string.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Semantic fingerprint of an activity.
///
/// Two exports of the same workout in different formats agree on start
/// time, whole-second duration, distance to the nearest 10 m and sport.
pub fn activity_fingerprint(metadata: &ActivityMetadata) -> String {
    let key = format!(
        "{}|{}|{}|{}",
        format_utc_rfc3339(metadata.start_time),
        metadata.duration_s.round() as i64,
        ((metadata.distance_m / 10.0).round() * 10.0) as i64,
        metadata.sport_type.as_str().to_ascii_lowercase()
    );
    hash_key(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SportType;
    use chrono::{TimeZone, Utc};

    fn metadata(duration_s: f64, distance_m: f64) -> ActivityMetadata {
        ActivityMetadata {
            name: Some("Morning Ride".to_string()),
            sport_type: SportType::Ride,
            start_time: Utc.with_ymd_and_hms(2024, 5, 4, 7, 0, 0).unwrap(),
            duration_s,
            distance_m,
            elevation_gain_m: None,
            avg_heartrate: None,
            max_heartrate: None,
            avg_power: None,
            max_power: None,
            avg_cadence: None,
            max_cadence: None,
            device: None,
            external_id: None,
        }
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fingerprint_tolerates_rounding() {
        let a = activity_fingerprint(&metadata(3600.2, 40_001.0));
        let b = activity_fingerprint(&metadata(3599.8, 40_004.4));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_sport_and_distance() {
        let base = metadata(3600.0, 40_000.0);
        let mut run = base.clone();
        run.sport_type = SportType::Run;
        assert_ne!(activity_fingerprint(&base), activity_fingerprint(&run));
        assert_ne!(
            activity_fingerprint(&base),
            activity_fingerprint(&metadata(3600.0, 40_020.0))
        );
    }

    #[test]
    fn test_name_does_not_affect_fingerprint() {
        let a = metadata(100.0, 1000.0);
        let mut b = a.clone();
        b.name = None;
        assert_eq!(activity_fingerprint(&a), activity_fingerprint(&b));
    }
}
