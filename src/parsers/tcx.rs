// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! TCX (Training Center Database) parser.

use crate::error::{AppError, Result};
use crate::models::{LatLng, ParsedActivity};
use crate::parsers::normalize::{self, RawActivity, Sample};
use crate::parsers::xml::{self, XmlNode};

const FORMAT: &str = "tcx";

pub fn parse(bytes: &[u8], fallback_name: &str) -> Result<ParsedActivity> {
    let root = xml::parse_document(bytes, FORMAT)?;
    let activity = root
        .find(&["activity"])
        .ok_or_else(|| AppError::parse(FORMAT, "missing <Activity> element"))?;

    let mut raw = RawActivity::new(FORMAT);
    raw.sport_label = activity
        .attr("sport")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    raw.name = activity.child_text("notes").map(str::to_string);
    raw.device = activity
        .child("creator")
        .and_then(|c| c.child_text("name"))
        .map(str::to_string);
    raw.summary.start_time = activity.child_text("id").and_then(xml::parse_timestamp);

    let laps: Vec<&XmlNode> = activity.children_named("lap").collect();
    if !laps.is_empty() {
        let total = |tag: &str| -> Option<f64> {
            let values: Vec<f64> = laps
                .iter()
                .filter_map(|lap| lap.child_text(tag).and_then(|v| v.parse::<f64>().ok()))
                .collect();
            (!values.is_empty()).then(|| values.iter().sum())
        };
        raw.summary.duration_s = total("totaltimeseconds");
        raw.summary.distance_m = total("distancemeters");
    }

    let mut points = Vec::new();
    activity.descendants("trackpoint", &mut points);
    raw.samples = points.into_iter().map(trackpoint).collect();

    normalize::build_activity(raw, fallback_name)
}

fn trackpoint(point: &XmlNode) -> Sample {
    let number = |node: Option<&XmlNode>| {
        node.and_then(|n| n.text.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    };

    let latlng = point.child("position").and_then(|pos| {
        let lat = number(pos.child("latitudedegrees"))?;
        let lng = number(pos.child("longitudedegrees"))?;
        Some(LatLng::new(lat, lng))
    });

    let heartrate = point
        .child("heartratebpm")
        .and_then(|hr| number(hr.child("value")).or_else(|| number(Some(hr))));
    let extensions = point.child("extensions");
    let ext = |tags: &[&str]| extensions.and_then(|e| e.find_f64(tags));

    Sample {
        time: point.child_text("time").and_then(xml::parse_timestamp),
        latlng,
        altitude: number(point.child("altitudemeters")),
        heartrate,
        power: ext(&["watts", "power"]),
        cadence: number(point.child("cadence")).or_else(|| ext(&["runcadence", "cadence"])),
        distance: number(point.child("distancemeters")),
        speed: ext(&["speed"]),
    }
}
