// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Reverse geocoding used to name segments.
//!
//! Providers implement [`ReverseGeocoder`] and are registered by name in a
//! [`GeocoderRegistry`]; the configured one is resolved once at startup.
//! [`CachedGeocoder`] wraps a provider with a bounded per-instance memo that
//! also remembers failures, so an unreachable service is asked at most once
//! per location for the lifetime of the cache.

use crate::config::GeocodeConfig;
use crate::error::{AppError, Result};
use crate::models::LatLng;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("activity-ingest/", env!("CARGO_PKG_VERSION"));

/// Lookup of a human-readable place label for a coordinate.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the provider answered but has no label for the point.
    async fn reverse(&self, point: LatLng, locale: &str) -> Result<Option<String>>;
}

/// Nominatim (OpenStreetMap) reverse geocoder.
pub struct NominatimGeocoder {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    name: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    address: HashMap<String, String>,
}

impl NominatimResponse {
    fn label(self) -> Option<String> {
        let pick = |v: &String| {
            let v = v.trim();
            (!v.is_empty()).then(|| v.to_string())
        };
        ["road", "path", "track", "footway", "cycleway"]
            .iter()
            .find_map(|k| self.address.get(*k).and_then(pick))
            .or_else(|| self.name.as_ref().and_then(pick))
            .or_else(|| {
                self.display_name
                    .as_deref()
                    .and_then(|d| d.split(',').next())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
    }
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::Geocode(format!("failed building HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    async fn reverse(&self, point: LatLng, locale: &str) -> Result<Option<String>> {
        let url = format!("{}/reverse", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", format!("{:.6}", point.lat)),
                ("lon", format!("{:.6}", point.lng)),
                ("zoom", "16".to_string()),
                ("accept-language", locale.to_string()),
            ])
            .send()
            .await
            .map_err(|e| AppError::Geocode(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Geocode(format!("HTTP {}: {}", status, body)));
        }

        let body: NominatimResponse = response
            .json()
            .await
            .map_err(|e| AppError::Geocode(format!("JSON parse error: {}", e)))?;
        Ok(body.label())
    }
}

type GeocoderFactory = fn(&GeocodeConfig) -> Result<Option<Arc<dyn ReverseGeocoder>>>;

/// Named geocoder implementations.
pub struct GeocoderRegistry {
    factories: HashMap<&'static str, GeocoderFactory>,
}

impl Default for GeocoderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("none", |_| Ok(None));
        registry.register("nominatim", |config| {
            Ok(Some(Arc::new(NominatimGeocoder::new(config)?) as Arc<dyn ReverseGeocoder>))
        });
        registry
    }
}

impl GeocoderRegistry {
    pub fn register(&mut self, name: &'static str, factory: GeocoderFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Build the provider named in the config; `None` when geocoding is off.
    pub fn resolve(&self, config: &GeocodeConfig) -> Result<Option<Arc<dyn ReverseGeocoder>>> {
        let name = config.provider.trim().to_ascii_lowercase();
        let factory = self.factories.get(name.as_str()).ok_or_else(|| {
            AppError::Geocode(format!(
                "unknown geocoder {:?} (available: {})",
                config.provider,
                self.names().join(", ")
            ))
        })?;
        let geocoder = factory(config)?;
        tracing::info!(provider = %name, enabled = geocoder.is_some(), "Resolved reverse geocoder");
        Ok(geocoder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    lat_e3: i64,
    lng_e3: i64,
    locale: String,
}

impl CacheKey {
    /// Three decimals is roughly 100 m, close enough to share a label.
    fn new(point: LatLng, locale: &str) -> Self {
        Self {
            lat_e3: (point.lat * 1_000.0).round() as i64,
            lng_e3: (point.lng * 1_000.0).round() as i64,
            locale: locale.to_string(),
        }
    }
}

/// Bounded memo in front of a geocoder. Failures are cached as `None`.
pub struct CachedGeocoder {
    inner: Arc<dyn ReverseGeocoder>,
    cache: DashMap<CacheKey, Option<String>>,
    capacity: usize,
    timeout: Duration,
    locale: String,
}

impl CachedGeocoder {
    pub fn new(inner: Arc<dyn ReverseGeocoder>, config: &GeocodeConfig) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            capacity: config.cache_capacity.max(1),
            timeout: config.timeout,
            locale: config.locale.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Label for a point, or `None` if unknown or the provider failed.
    pub async fn label(&self, point: LatLng) -> Option<String> {
        let key = CacheKey::new(point, &self.locale);
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }

        let label = match tokio::time::timeout(self.timeout, self.inner.reverse(point, &self.locale))
            .await
        {
            Ok(Ok(label)) => label,
            Ok(Err(e)) => {
                tracing::debug!(provider = self.inner.name(), error = %e, "Reverse geocoding failed");
                None
            }
            Err(_) => {
                tracing::debug!(provider = self.inner.name(), "Reverse geocoding timed out");
                None
            }
        };

        self.insert(key, label.clone());
        label
    }

    fn insert(&self, key: CacheKey, value: Option<String>) {
        if self.cache.len() >= self.capacity && !self.cache.contains_key(&key) {
            let victim = self.cache.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                self.cache.remove(&victim);
            }
        }
        self.cache.insert(key, value);
    }
}
