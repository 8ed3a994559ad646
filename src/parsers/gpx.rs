// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! GPX parser.

use crate::error::{AppError, Result};
use crate::models::{LatLng, ParsedActivity};
use crate::parsers::normalize::{self, RawActivity, Sample};
use crate::parsers::xml::{self, XmlNode};

const FORMAT: &str = "gpx";

const HR_TAGS: &[&str] = &["hr", "heartrate", "heart_rate"];
const CADENCE_TAGS: &[&str] = &["cad", "cadence", "runcadence"];
const POWER_TAGS: &[&str] = &["power", "watts"];
const SPEED_TAGS: &[&str] = &["speed"];
const DISTANCE_TAGS: &[&str] = &["distance"];

pub fn parse(bytes: &[u8], fallback_name: &str) -> Result<ParsedActivity> {
    let root = xml::parse_document(bytes, FORMAT)?;
    let gpx = root
        .find(&["gpx"])
        .ok_or_else(|| AppError::parse(FORMAT, "missing <gpx> root element"))?;

    let mut raw = RawActivity::new(FORMAT);
    raw.device = gpx
        .attr("creator")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let mut points = Vec::new();
    gpx.descendants("trkpt", &mut points);
    // Files without a track fall back to their route points
    let path = if points.is_empty() {
        gpx.descendants("rtept", &mut points);
        gpx.child("rte")
    } else {
        gpx.child("trk")
    };

    raw.name = path
        .and_then(|p| p.child_text("name"))
        .or_else(|| gpx.child("metadata").and_then(|m| m.child_text("name")))
        .map(str::to_string);
    // Only the track or route type names a sport; <metadata><link><type> is a MIME type
    raw.sport_label = path.and_then(|p| p.child_text("type")).map(str::to_string);
    raw.samples = points.into_iter().map(trackpoint).collect();

    normalize::build_activity(raw, fallback_name)
}

fn trackpoint(point: &XmlNode) -> Sample {
    let coord = |name: &str| point.attr(name).and_then(|v| v.trim().parse::<f64>().ok());
    let latlng = match (coord("lat"), coord("lon")) {
        (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
        _ => None,
    };

    let extensions = point.child("extensions");
    let ext = |tags: &[&str]| extensions.and_then(|e| e.find_f64(tags));

    Sample {
        time: point.child_text("time").and_then(xml::parse_timestamp),
        latlng,
        altitude: point
            .child_text("ele")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite()),
        heartrate: ext(HR_TAGS),
        power: ext(POWER_TAGS).or_else(|| point.find_f64(POWER_TAGS)),
        cadence: ext(CADENCE_TAGS),
        distance: ext(DISTANCE_TAGS),
        speed: ext(SPEED_TAGS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SportType;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx creator="Garmin Connect" version="1.1"
  xmlns:ns3="http://www.garmin.com/xmlschemas/TrackPointExtension/v1">
  <metadata>
    <link href="connect.garmin.com"><text>Garmin Connect</text><type>text/html</type></link>
    <time>2024-06-01T08:30:00Z</time>
  </metadata>
  <trk>
    <name>Hill repeats</name>
    <type>running</type>
    <trkseg>
      <trkpt lat="37.0000" lon="-122.0000"><ele>10.0</ele><time>2024-06-01T08:30:00Z</time>
        <extensions><ns3:TrackPointExtension><ns3:hr>120</ns3:hr><ns3:cad>80</ns3:cad></ns3:TrackPointExtension></extensions>
      </trkpt>
      <trkpt lat="37.0010" lon="-122.0000"><ele>15.0</ele><time>2024-06-01T08:30:30Z</time>
        <extensions><ns3:TrackPointExtension><ns3:hr>130</ns3:hr></ns3:TrackPointExtension></extensions>
      </trkpt>
      <trkpt lat="37.0020" lon="-122.0000"><ele>20.0</ele><time>2024-06-01T08:31:00Z</time>
        <extensions><power>250</power></extensions>
      </trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn test_parse_gpx_with_extensions() {
        let parsed = parse(SAMPLE.as_bytes(), "fallback").unwrap();
        assert_eq!(parsed.metadata.name.as_deref(), Some("Hill repeats"));
        assert_eq!(parsed.metadata.sport_type, SportType::Run);
        assert_eq!(parsed.metadata.device.as_deref(), Some("Garmin Connect"));
        assert_eq!(parsed.streams.time, vec![0, 30, 60]);
        assert_eq!(parsed.streams.heartrate, Some(vec![120.0, 130.0, 130.0]));
        assert_eq!(parsed.streams.cadence, Some(vec![80.0, 80.0, 80.0]));
        assert_eq!(parsed.streams.power, Some(vec![250.0, 250.0, 250.0]));
        assert_eq!(parsed.metadata.duration_s, 60.0);
        assert!((parsed.metadata.distance_m - 222.4).abs() < 1.0);
        assert_eq!(parsed.metadata.elevation_gain_m, Some(10.0));
        assert_eq!(parsed.metadata.max_heartrate, Some(130.0));
    }

    #[test]
    fn test_mime_type_never_becomes_sport() {
        let doc = SAMPLE.replace("<type>running</type>", "");
        let parsed = parse(doc.as_bytes(), "fallback").unwrap();
        assert_eq!(parsed.metadata.sport_type, SportType::Workout);
    }

    #[test]
    fn test_route_points_used_without_track() {
        let doc = r#"<gpx><rte><name>Commute</name><type>cycling</type>
            <rtept lat="37.0000" lon="-122.0"><ele>5</ele><time>2024-06-01T07:00:00Z</time></rtept>
            <rtept lat="37.0010" lon="-122.0"><ele>6</ele><time>2024-06-01T07:00:20Z</time></rtept>
        </rte></gpx>"#;
        let parsed = parse(doc.as_bytes(), "x").unwrap();
        assert_eq!(parsed.metadata.name.as_deref(), Some("Commute"));
        assert_eq!(parsed.metadata.sport_type, SportType::Ride);
        assert_eq!(parsed.streams.time, vec![0, 20]);
        assert!((parsed.metadata.distance_m - 111.2).abs() < 1.0);
    }

    #[test]
    fn test_route_without_times_fails() {
        let doc = r#"<gpx><rte><rtept lat="37.0" lon="-122.0"/></rte></gpx>"#;
        assert!(matches!(
            parse(doc.as_bytes(), "x"),
            Err(AppError::Parse { format: "gpx", .. })
        ));
    }
}
