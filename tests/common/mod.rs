// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use activity_ingest::config::Config;
use activity_ingest::db::MemoryStore;
use activity_ingest::time_utils::ManualClock;
use activity_ingest::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Arc;
use tempfile::TempDir;

/// Meters per degree of latitude.
const METERS_PER_DEG: f64 = 111_195.0;

/// Engine over an in-memory store, a manual clock and a scratch data dir.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub dir: TempDir,
}

#[allow(dead_code)]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

/// Engine with fast retry settings: base 1 s, max 5 s, 3 attempts.
#[allow(dead_code)]
pub fn test_engine() -> TestEngine {
    test_engine_with(|_| {})
}

#[allow(dead_code)]
pub fn test_engine_with(customize: impl FnOnce(&mut Config)) -> TestEngine {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::test_default();
    config.data_dir = dir.path().to_path_buf();
    config.database_path = dir.path().join("ingest.db");
    config.queue.poll_interval = std::time::Duration::from_secs(1);
    config.queue.base_delay = std::time::Duration::from_secs(1);
    config.queue.max_delay = std::time::Duration::from_secs(5);
    config.queue.max_attempts = 3;
    customize(&mut config);

    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = Engine::with_geocoder(config, store.clone(), clock.clone(), None);
    TestEngine {
        engine,
        store,
        clock,
        dir,
    }
}

/// Flat, climb at `grade`, then a descent, sampled every 10 m.
#[allow(dead_code)]
pub fn climb_profile(flat_m: f64, climb_m: f64, grade_pct: f64) -> Vec<f64> {
    let step = 10.0;
    let base = 100.0;
    let top = base + climb_m * grade_pct / 100.0;
    let mut elevations = Vec::new();
    let mut d = 0.0;
    while d <= flat_m {
        elevations.push(base);
        d += step;
    }
    let mut climbed = step;
    while climbed <= climb_m {
        elevations.push(base + climbed * grade_pct / 100.0);
        climbed += step;
    }
    // Steep enough descent to close the climb
    for i in 1..=60 {
        elevations.push(top - i as f64 * 1.0);
    }
    elevations
}

/// GPX track heading north from (`lat0`, `lng`), one point every 10 m and 3 s.
#[allow(dead_code)]
pub fn gpx_track(
    name: &str,
    sport: &str,
    start: DateTime<Utc>,
    lat0: f64,
    lng: f64,
    elevations: &[f64],
) -> Vec<u8> {
    gpx_track_with_creator(name, sport, "test-suite", start, lat0, lng, elevations)
}

#[allow(dead_code)]
pub fn gpx_track_with_creator(
    name: &str,
    sport: &str,
    creator: &str,
    start: DateTime<Utc>,
    lat0: f64,
    lng: f64,
    elevations: &[f64],
) -> Vec<u8> {
    let mut doc = String::new();
    let _ = write!(
        doc,
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<gpx version=\"1.1\" creator=\"{}\">\n<trk><name>{}</name><type>{}</type><trkseg>\n",
        creator, name, sport
    );
    for (i, ele) in elevations.iter().enumerate() {
        let lat = lat0 + (i as f64 * 10.0) / METERS_PER_DEG;
        let time = start + Duration::seconds(i as i64 * 3);
        let _ = writeln!(
            doc,
            "<trkpt lat=\"{:.7}\" lon=\"{:.7}\"><ele>{:.2}</ele><time>{}</time></trkpt>",
            lat,
            lng,
            ele,
            time.format("%Y-%m-%dT%H:%M:%SZ")
        );
    }
    doc.push_str("</trkseg></trk>\n</gpx>\n");
    doc.into_bytes()
}

/// Short flat ride, distinct per `minute` offset.
#[allow(dead_code)]
pub fn simple_ride(minute: i64) -> Vec<u8> {
    gpx_track(
        "Easy spin",
        "cycling",
        t0() + Duration::minutes(minute),
        37.40,
        -122.20,
        &[20.0; 50],
    )
}

#[allow(dead_code)]
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, bytes) in entries {
        writer.start_file(*name, options).expect("start zip entry");
        writer.write_all(bytes).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

#[allow(dead_code)]
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).expect("gzip");
    encoder.finish().expect("gzip finish")
}
