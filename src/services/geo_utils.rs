// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Great-circle helpers.

use crate::models::LatLng;
use geo::{Coord, LineString};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters.
pub fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Initial great-circle bearing from `a` to `b`, in degrees [0, 360).
pub fn bearing_deg(a: LatLng, b: LatLng) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Smallest angle between two bearings, in degrees [0, 180].
pub fn bearing_delta(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    if d > 180.0 {
        360.0 - d
    } else {
        d
    }
}

/// Encode a path as a precision-5 polyline.
pub fn encode_path(points: &[LatLng]) -> Option<String> {
    if points.len() < 2 {
        return None;
    }
    let line: LineString<f64> = points.iter().map(|p| Coord::from(*p)).collect();
    polyline::encode_coordinates(line, 5).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_value() {
        // London to Paris is roughly 344 km
        let london = LatLng::new(51.5074, -0.1278);
        let paris = LatLng::new(48.8566, 2.3522);
        let d = haversine_m(london, paris);
        assert!((d - 343_560.0).abs() < 5_000.0, "got {}", d);
        assert_eq!(haversine_m(london, london), 0.0);
    }

    #[test]
    fn test_bearings() {
        let origin = LatLng::new(37.0, -122.0);
        assert!(bearing_deg(origin, LatLng::new(37.1, -122.0)).abs() < 0.01);
        assert!((bearing_deg(origin, LatLng::new(37.0, -121.9)) - 90.0).abs() < 0.1);
        assert!((bearing_deg(origin, LatLng::new(36.9, -122.0)) - 180.0).abs() < 0.01);
        assert_eq!(bearing_delta(350.0, 10.0), 20.0);
        assert_eq!(bearing_delta(90.0, 270.0), 180.0);
    }

    #[test]
    fn test_encode_path() {
        let encoded = encode_path(&[LatLng::new(38.5, -120.2), LatLng::new(40.7, -120.95)]);
        assert_eq!(encoded.as_deref(), Some("_p~iF~ps|U_ulLnnqC"));
        assert!(encode_path(&[LatLng::new(1.0, 1.0)]).is_none());
    }
}
