//! Public locator query: venues near a point.
//!
//! Bounding-box prefilter in SQL, exact haversine cut in process, optional
//! chain dedup (closest location wins), `slim` projection for bandwidth-
//! sensitive callers, and a small TTL cache keyed on the rounded query.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ProductionVenue, WEEKDAYS};

use super::ApiState;

const EARTH_RADIUS_KM: f64 = 6371.0;
const DEFAULT_RADIUS_KM: f64 = 10.0;
const MAX_RADIUS_KM: f64 = 100.0;
const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: Option<f64>,
    #[serde(rename = "type")]
    pub venue_type: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub slim: bool,
    #[serde(default)]
    pub open_now: bool,
    pub product_sku: Option<String>,
    #[serde(default)]
    pub dedupe_chains: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyVenue {
    pub id: String,
    pub name: String,
    pub venue_type: String,
    pub distance_km: f64,
    pub lat: f64,
    pub lng: f64,
    pub city: String,
    pub country: String,
    pub platforms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// Full projection only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<crate::models::Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opening_hours: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_zones: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct NearbyResponse {
    pub venues: Vec<NearbyVenue>,
    pub count: usize,
    pub cached: bool,
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Cache key: rounded coordinates plus the parameters that change the
/// base projection.
fn cache_key(query: &NearbyQuery, radius: f64, limit: usize) -> String {
    format!(
        "{:.3}|{:.3}|{:.1}|{}|{}|{}",
        query.lat,
        query.lng,
        radius,
        query.venue_type.as_deref().unwrap_or("-"),
        limit,
        query.slim,
    )
}

/// Bounded TTL cache for proximity responses.
pub struct NearbyCache {
    entries: Mutex<HashMap<String, (Instant, Vec<NearbyVenue>)>>,
    capacity: usize,
    ttl: Duration,
}

impl NearbyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<Vec<NearbyVenue>> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .and_then(|(at, venues)| (at.elapsed() < self.ttl).then(|| venues.clone()))
    }

    fn put(&self, key: String, venues: Vec<NearbyVenue>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, (at, _)| at.elapsed() < ttl);
            if entries.len() >= self.capacity {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, (at, _))| *at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, (Instant::now(), venues));
    }
}

pub async fn nearby(
    Query(query): Query<NearbyQuery>,
    State(state): State<ApiState>,
) -> Result<Json<NearbyResponse>, StatusCode> {
    if !(-90.0..=90.0).contains(&query.lat) || !(-180.0..=180.0).contains(&query.lng) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let radius = query
        .radius_km
        .unwrap_or(DEFAULT_RADIUS_KM)
        .clamp(0.1, MAX_RADIUS_KM);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 500);

    let key = cache_key(&query, radius, limit);
    // Filters applied after the cache (open_now, product_sku,
    // dedupe_chains) are excluded from the key, so only the base
    // projection is cached.
    let base = if !query.open_now && query.product_sku.is_none() && !query.dedupe_chains {
        state.nearby_cache.get(&key)
    } else {
        None
    };
    let cached = base.is_some();

    let mut venues = match base {
        Some(venues) => venues,
        None => {
            let computed =
                compute_nearby(&state, &query, radius, limit).map_err(|e| {
                    tracing::error!(error = %e, "nearby query failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                })?;
            if !query.open_now && query.product_sku.is_none() && !query.dedupe_chains {
                state.nearby_cache.put(key, computed.clone());
            }
            computed
        }
    };

    if query.open_now {
        venues.retain(|v| v.opening_hours_open_now());
    }
    if let Some(sku) = &query.product_sku {
        venues = filter_by_product(&state, venues, sku).map_err(|e| {
            tracing::error!(error = %e, "product filter failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    }
    if query.dedupe_chains {
        venues = dedupe_chains(venues);
    }
    venues.truncate(limit);

    Ok(Json(NearbyResponse {
        count: venues.len(),
        venues,
        cached,
    }))
}

fn compute_nearby(
    state: &ApiState,
    query: &NearbyQuery,
    radius: f64,
    limit: usize,
) -> anyhow::Result<Vec<NearbyVenue>> {
    // Bounding-box prefilter: 1° latitude ≈ 111 km.
    let lat_delta = radius / 111.0;
    let lng_delta = radius / (111.0 * query.lat.to_radians().cos().abs().max(0.01));
    let candidates = state.store.production_venues_in_bbox(
        query.lat - lat_delta,
        query.lat + lat_delta,
        query.lng - lng_delta,
        query.lng + lng_delta,
    )?;
    debug!(candidates = candidates.len(), radius, "nearby prefilter");

    let mut venues: Vec<NearbyVenue> = candidates
        .into_iter()
        .filter(|v| {
            query
                .venue_type
                .as_deref()
                .map(|t| v.venue_type == t)
                .unwrap_or(true)
        })
        .filter_map(|venue| {
            let distance =
                haversine_km(query.lat, query.lng, venue.coordinates.lat, venue.coordinates.lng);
            (distance <= radius).then(|| project(venue, distance, query.slim))
        })
        .collect();

    venues.sort_by(|a, b| {
        a.distance_km
            .partial_cmp(&b.distance_km)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    venues.truncate(limit);
    Ok(venues)
}

fn project(venue: ProductionVenue, distance_km: f64, slim: bool) -> NearbyVenue {
    let platforms = venue
        .platform_links
        .iter()
        .map(|l| l.platform.as_str().to_string())
        .collect();
    NearbyVenue {
        id: venue.id,
        name: venue.name,
        venue_type: venue.venue_type,
        distance_km: (distance_km * 100.0).round() / 100.0,
        lat: venue.coordinates.lat,
        lng: venue.coordinates.lng,
        city: venue.address.city.clone(),
        country: venue.address.country.clone(),
        platforms,
        chain_id: venue.chain_id,
        address: (!slim).then_some(venue.address),
        opening_hours: (!slim).then(|| {
            serde_json::json!({
                "hours": venue.opening_hours,
                "source": venue.hours_source,
            })
        }),
        delivery_zones: (!slim).then_some(venue.delivery_zones),
    }
}

impl NearbyVenue {
    /// Open-now check against the full projection. Default-sourced hours
    /// count as unknown and pass the filter rather than hiding the venue.
    fn opening_hours_open_now(&self) -> bool {
        let Some(hours) = &self.opening_hours else {
            return true; // slim projection: no basis to exclude
        };
        if hours.get("source").and_then(|s| s.as_str()) == Some("default") {
            return true;
        }
        let now = Utc::now();
        let day = WEEKDAYS[now.weekday().num_days_from_monday() as usize];
        let Some(window) = hours.get("hours").and_then(|h| h.get(day)) else {
            return false;
        };
        let (Some(open), Some(close)) = (
            window.get("open").and_then(|v| v.as_str()),
            window.get("close").and_then(|v| v.as_str()),
        ) else {
            return false;
        };
        let time = now.format("%H:%M").to_string();
        open <= time.as_str() && time.as_str() < close
    }
}

fn filter_by_product(
    state: &ApiState,
    venues: Vec<NearbyVenue>,
    sku: &str,
) -> anyhow::Result<Vec<NearbyVenue>> {
    let mut kept = Vec::new();
    for venue in venues {
        let dishes = state.store.production_dishes_for_venue(&venue.id)?;
        if dishes.iter().any(|d| d.product_tag.as_str() == sku) {
            kept.push(venue);
        }
    }
    Ok(kept)
}

/// Keep the closest venue per chain; chainless venues always stay.
fn dedupe_chains(venues: Vec<NearbyVenue>) -> Vec<NearbyVenue> {
    let mut seen: Vec<String> = Vec::new();
    venues
        .into_iter()
        .filter(|venue| match &venue.chain_id {
            None => true,
            Some(chain) => {
                if seen.contains(chain) {
                    false
                } else {
                    seen.push(chain.clone());
                    true
                }
            }
        })
        .collect()
}
