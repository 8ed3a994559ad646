// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Segment names.

use crate::models::{ClimbCategory, LatLng};
use crate::services::geocode::CachedGeocoder;
use std::sync::Arc;

/// Name built from geometry alone, e.g. "Cat 3 climb 4.2 km at 6.1%".
pub fn climb_label(distance_m: f64, grade_pct: f64, category: Option<ClimbCategory>) -> String {
    let size = format!("{:.1} km at {:.1}%", distance_m / 1000.0, grade_pct);
    match category {
        Some(category) => format!("{} climb {}", category, size),
        None => format!("Climb {}", size),
    }
}

/// Name with a place label, e.g. "Cat 3 Kings Mountain Road climb (4.2 km at 6.1%)".
pub fn climb_name_at(
    place: &str,
    distance_m: f64,
    grade_pct: f64,
    category: Option<ClimbCategory>,
) -> String {
    let size = format!("{:.1} km at {:.1}%", distance_m / 1000.0, grade_pct);
    match category {
        Some(category) => format!("{} {} climb ({})", category, place, size),
        None => format!("{} climb ({})", place, size),
    }
}

/// Default name for a manual segment.
pub fn manual_label(distance_m: f64) -> String {
    format!("Segment {:.1} km", distance_m / 1000.0)
}

/// Names climbs, consulting the geocoder when one is configured.
#[derive(Clone, Default)]
pub struct ClimbNamer {
    geocoder: Option<Arc<CachedGeocoder>>,
}

impl ClimbNamer {
    pub fn new(geocoder: Option<Arc<CachedGeocoder>>) -> Self {
        Self { geocoder }
    }

    pub fn has_geocoder(&self) -> bool {
        self.geocoder.is_some()
    }

    /// Place label for the climb's summit, falling back to its start.
    async fn place(&self, start: Option<LatLng>, end: Option<LatLng>) -> Option<String> {
        let geocoder = self.geocoder.as_ref()?;
        if let Some(end) = end {
            if let Some(label) = geocoder.label(end).await {
                return Some(label);
            }
        }
        match start {
            Some(start) => geocoder.label(start).await,
            None => None,
        }
    }

    pub async fn name_climb(
        &self,
        start: Option<LatLng>,
        end: Option<LatLng>,
        distance_m: f64,
        grade_pct: f64,
        category: Option<ClimbCategory>,
    ) -> String {
        match self.place(start, end).await {
            Some(place) => climb_name_at(&place, distance_m, grade_pct, category),
            None => climb_label(distance_m, grade_pct, category),
        }
    }
}
