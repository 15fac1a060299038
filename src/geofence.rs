use regex::Regex;
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::GeocoderConfig;
use crate::models::{DistanceGroup, Listing, ListingOrigin, Search};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("Location not found: {0}")]
    NotFound(String),

    #[error("Geocoding request for '{query}' failed: {source}")]
    Request {
        query: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid geocoding response for '{query}': {reason}")]
    InvalidResponse { query: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

pub trait Geocoder {
    fn geocode(&self, query: &str) -> Result<Coordinates, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    lat: String,
    lon: String,
}

/// Geocoder backed by the OpenStreetMap Nominatim search API.
pub struct NominatimGeocoder {
    client: reqwest::blocking::Client,
    base_url: String,
    country_codes: Option<String>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocoderConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            country_codes: config.country_codes.clone().filter(|c| !c.is_empty()),
        })
    }
}

impl Geocoder for NominatimGeocoder {
    fn geocode(&self, query: &str) -> Result<Coordinates, GeocodeError> {
        let mut params = vec![("q", query), ("format", "json"), ("limit", "1")];
        if let Some(codes) = &self.country_codes {
            params.push(("countrycodes", codes.as_str()));
        }

        let request_error = |source| GeocodeError::Request {
            query: query.to_string(),
            source,
        };
        let response: Vec<NominatimResponse> = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&params)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(request_error)?
            .json()
            .map_err(request_error)?;

        let first = response
            .first()
            .ok_or_else(|| GeocodeError::NotFound(query.to_string()))?;
        let invalid = |reason: String| GeocodeError::InvalidResponse {
            query: query.to_string(),
            reason,
        };
        let latitude = first
            .lat
            .parse::<f64>()
            .map_err(|e| invalid(format!("latitude: {e}")))?;
        let longitude = first
            .lon
            .parse::<f64>()
            .map_err(|e| invalid(format!("longitude: {e}")))?;

        debug!(query, latitude, longitude, "Geocoded location");
        Ok(Coordinates { latitude, longitude })
    }
}

/// Memoises lookups for the lifetime of one run; zipcodes repeat across listings.
pub struct CachedGeocoder<G> {
    inner: G,
    cache: RefCell<HashMap<String, Coordinates>>,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl<G: Geocoder> Geocoder for CachedGeocoder<G> {
    fn geocode(&self, query: &str) -> Result<Coordinates, GeocodeError> {
        if let Some(hit) = self.cache.borrow().get(query) {
            return Ok(*hit);
        }
        let coordinates = self.inner.geocode(query)?;
        self.cache.borrow_mut().insert(query.to_string(), coordinates);
        Ok(coordinates)
    }
}

/// Great-circle distance via the haversine formula.
pub fn distance_km(a: Coordinates, b: Coordinates) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlng / 2.0).sin().powi(2);

    EARTH_RADIUS_KM * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Zipcode part of a listing location ("10115 Mitte"), else the whole text.
pub fn location_query(location_text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\d+").expect("Invalid regex"));

    re.find(location_text)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| location_text.trim().to_string())
}

/// Search-specific groups win over the global filter; `None` when neither is set.
pub fn groups_for<'a>(search: &'a Search, fallback: &'a [DistanceGroup]) -> Option<&'a [DistanceGroup]> {
    match &search.zipcodes {
        Some(groups) => Some(groups.as_slice()),
        None if !fallback.is_empty() => Some(fallback),
        None => None,
    }
}

/// Whether the geofence runs for this listing at all.
pub fn applies(listing: &Listing, worth_messaging: bool, force_priority: bool) -> bool {
    if listing.origin == ListingOrigin::CrossSource || !worth_messaging {
        return false;
    }
    force_priority || listing.is_pickup_only()
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeofenceOutcome {
    InRange { zipcode: String, distance_km: u32 },
    OutOfRange,
}

/// Walks groups and zipcodes in order; the first one within reach wins.
pub fn check(
    geocoder: &dyn Geocoder,
    location_text: &str,
    groups: &[DistanceGroup],
) -> Result<GeofenceOutcome, GeocodeError> {
    let origin = geocoder.geocode(&location_query(location_text))?;

    for group in groups {
        for zipcode in &group.zipcodes {
            let reference = geocoder.geocode(zipcode)?;
            let distance = distance_km(origin, reference).round_ties_even() as u32;
            if distance <= group.max_distance_km {
                debug!(zipcode = %zipcode, distance, max = group.max_distance_km, "Listing within area");
                return Ok(GeofenceOutcome::InRange {
                    zipcode: zipcode.clone(),
                    distance_km: distance,
                });
            }
        }
    }

    if groups.is_empty() {
        warn!("Geofence checked without any distance groups");
    }
    Ok(GeofenceOutcome::OutOfRange)
}
