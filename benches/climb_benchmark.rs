use activity_ingest::models::{LatLng, SportType, Streams};
use activity_ingest::services::climbs::RouteProfile;
use activity_ingest::services::matcher::find_match;
use activity_ingest::services::{detect_climbs, ClimbParams, MatchParams, SegmentTarget};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

/// A hilly ride of `samples` points, one every ~11 m heading north.
fn hilly_ride(samples: usize, lng: f64) -> Streams {
    let latlng: Vec<LatLng> = (0..samples)
        .map(|i| LatLng::new(37.0 + i as f64 * 0.0001, lng))
        .collect();
    // Rolling terrain: 2 km waves with 60 m amplitude plus small noise
    let altitude: Vec<f64> = (0..samples)
        .map(|i| {
            let d = i as f64 * 11.1;
            200.0 + 60.0 * (d / 2_000.0 * std::f64::consts::TAU).sin() + ((i * 37) % 10) as f64 * 0.1
        })
        .collect();
    Streams {
        time: (0..samples as u32).map(|t| t * 3).collect(),
        latlng: Some(latlng),
        altitude: Some(altitude),
        ..Streams::default()
    }
}

fn benchmark_detect_climbs(c: &mut Criterion) {
    // About 110 km, a long day in the saddle
    let ride = hilly_ride(10_000, -122.0);
    let params = ClimbParams::default();

    let mut group = c.benchmark_group("climb_detection");
    group.bench_function("rolling_110km", |b| {
        b.iter(|| detect_climbs(black_box(&ride), SportType::Ride, &params))
    });
    group.finish();
}

fn benchmark_find_match(c: &mut Criterion) {
    let defining = hilly_ride(2_000, -122.0);
    let profile = RouteProfile::from_streams(&defining).expect("profile");
    let target = SegmentTarget::from_range(&profile, 400, 900, SportType::Ride).expect("target");
    let params = MatchParams::default();

    // Same road offset slightly east, and a parallel road far away
    let nearby = hilly_ride(10_000, -121.99989);
    let nearby_profile = RouteProfile::from_streams(&nearby).expect("profile");
    let far = hilly_ride(10_000, -117.0);
    let far_profile = RouteProfile::from_streams(&far).expect("profile");

    let mut group = c.benchmark_group("segment_matching");

    group.bench_function("nearby_activity_matches", |b| {
        b.iter(|| find_match(black_box(&nearby_profile), &target, &params))
    });

    group.bench_function("far_activity_no_match", |b| {
        b.iter(|| find_match(black_box(&far_profile), &target, &params))
    });

    group.finish();
}

criterion_group!(benches, benchmark_detect_climbs, benchmark_find_match);
criterion_main!(benches);
