use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::geocode_cache::{GeocodeCache, GeocodeOutcome};
use crate::geocoder::{GeocodeMatch, GeocodingService};
use crate::rate_limit::RateLimiter;
use crate::record::{Coordinates, PlaceRecord};

/// Identifying fields of a place, trimmed; empty values are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaceQuery<'a> {
    pub name: Option<&'a str>,
    pub address: Option<&'a str>,
    pub city: Option<&'a str>,
}

impl<'a> PlaceQuery<'a> {
    pub fn new(name: &'a str, address: Option<&'a str>, city: Option<&'a str>) -> Self {
        Self {
            name: present(Some(name)),
            address: present(address),
            city: present(city),
        }
    }

    pub fn from_record(record: &'a PlaceRecord) -> Self {
        Self::new(
            &record.name,
            record.address.as_deref(),
            record.city.as_deref(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.address.is_none()
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Context appended to queries that lack a city or country.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub default_city: String,
    pub country: String,
}

impl QueryContext {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_city: config.default_city.clone(),
            country: config.country.clone(),
        }
    }
}

/// One rule for turning a place into a geocoder query.
#[derive(Clone, Copy)]
pub struct Strategy {
    pub name: &'static str,
    pub build: fn(&PlaceQuery<'_>, &QueryContext) -> Option<String>,
}

pub const COMBINED: Strategy = Strategy {
    name: "combined",
    build: combined_query,
};

pub const ADDRESS_ONLY: Strategy = Strategy {
    name: "address",
    build: address_query,
};

pub const NAME_ONLY: Strategy = Strategy {
    name: "name",
    build: name_query,
};

pub const DEFAULT_STRATEGIES: [Strategy; 3] = [COMBINED, ADDRESS_ONLY, NAME_ONLY];

fn join(parts: &[Option<&str>]) -> String {
    parts.iter().flatten().copied().collect::<Vec<_>>().join(", ")
}

fn combined_query(place: &PlaceQuery<'_>, ctx: &QueryContext) -> Option<String> {
    let (name, address) = (place.name?, place.address?);
    Some(join(&[
        Some(name),
        Some(address),
        place.city,
        Some(ctx.country.as_str()),
    ]))
}

fn address_query(place: &PlaceQuery<'_>, ctx: &QueryContext) -> Option<String> {
    let address = place.address?;
    Some(join(&[Some(address), place.city.or(Some(ctx.country.as_str()))]))
}

fn name_query(place: &PlaceQuery<'_>, ctx: &QueryContext) -> Option<String> {
    if place.address.is_some() {
        return None;
    }
    let name = place.name?;
    Some(join(&[
        Some(name),
        place.city.or(Some(ctx.default_city.as_str())),
        Some(ctx.country.as_str()),
    ]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Geocoder,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub coordinates: Option<Coordinates>,
    /// Address the geocoder matched for the winning query, if it reported one.
    pub formatted_address: Option<String>,
    pub source: Option<ResolutionSource>,
    pub strategy: Option<&'static str>,
    pub query: Option<String>,
    pub attempted: Vec<String>,
    pub cache_hits: usize,
    pub geocoder_calls: usize,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        self.coordinates.is_some()
    }
}

/// Walks the strategies in order, consulting the geocode cache before every
/// external call and recording every outcome.
pub struct GeocodingResolver {
    cache: Arc<GeocodeCache>,
    geocoder: GeocodingService,
    rate_limiter: RateLimiter,
    strategies: Vec<Strategy>,
    context: QueryContext,
    retry_failed: bool,
}

impl GeocodingResolver {
    pub fn new(cache: Arc<GeocodeCache>, geocoder: GeocodingService, config: &AppConfig) -> Self {
        Self {
            cache,
            geocoder,
            rate_limiter: RateLimiter::new(config.geocode_rate_limit_qps),
            strategies: DEFAULT_STRATEGIES.to_vec(),
            context: QueryContext::from_config(config),
            retry_failed: config.retry_failed_geocodes,
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub async fn resolve_record(&self, record: &PlaceRecord) -> Resolution {
        self.resolve_query(&PlaceQuery::from_record(record)).await
    }

    pub async fn resolve(&self, name: &str, address: &str, city: &str) -> Resolution {
        self.resolve_query(&PlaceQuery::new(name, Some(address), Some(city)))
            .await
    }

    pub async fn resolve_query(&self, place: &PlaceQuery<'_>) -> Resolution {
        let mut resolution = Resolution::default();
        if place.is_empty() {
            debug!(target: "resolver", "nothing to geocode without a name or address");
            return resolution;
        }

        for strategy in &self.strategies {
            let Some(query) = (strategy.build)(place, &self.context) else {
                continue;
            };
            resolution.attempted.push(query.clone());

            if let Some(entry) = self.cache.get(&query) {
                resolution.cache_hits += 1;
                match entry.outcome {
                    GeocodeOutcome::Found { .. } => {
                        if let Some(coordinates) = entry.outcome.coordinates() {
                            debug!(target: "resolver", strategy = strategy.name, query = %query, "geocode cache hit");
                            let hit = GeocodeMatch {
                                coordinates,
                                formatted_address: entry.outcome.formatted_address().map(str::to_string),
                            };
                            return found(resolution, strategy, query, hit, ResolutionSource::Cache);
                        }
                        continue;
                    }
                    GeocodeOutcome::Failed { .. } if self.retry_failed => {
                        debug!(target: "resolver", strategy = strategy.name, query = %query, "retrying previously failed query");
                    }
                    _ => {
                        debug!(target: "resolver", strategy = strategy.name, query = %query, "cached miss; skipping strategy");
                        continue;
                    }
                }
            }

            if !self.geocoder.is_available() {
                continue;
            }

            self.rate_limiter.wait().await;
            resolution.geocoder_calls += 1;
            match self.geocoder.geocode(&query).await {
                Ok(Some(hit)) => {
                    info!(
                        target: "resolver",
                        strategy = strategy.name,
                        query = %query,
                        latitude = hit.coordinates.latitude,
                        longitude = hit.coordinates.longitude,
                        matched = hit.formatted_address.as_deref().unwrap_or(""),
                        "geocoded"
                    );
                    self.cache.insert(&query, GeocodeOutcome::found(hit.clone()));
                    return found(resolution, strategy, query, hit, ResolutionSource::Geocoder);
                }
                Ok(None) => {
                    info!(target: "resolver", strategy = strategy.name, query = %query, "no geocode match");
                    self.cache.insert(&query, GeocodeOutcome::NotFound);
                }
                Err(err) => {
                    warn!(target: "resolver", strategy = strategy.name, query = %query, error = %err, "geocode request failed");
                    self.cache.insert(
                        &query,
                        GeocodeOutcome::Failed {
                            reason: err.to_string(),
                        },
                    );
                }
            }
        }

        debug!(target: "resolver", attempted = ?resolution.attempted, "all strategies exhausted");
        resolution
    }
}

fn found(
    mut resolution: Resolution,
    strategy: &Strategy,
    query: String,
    hit: GeocodeMatch,
    source: ResolutionSource,
) -> Resolution {
    resolution.coordinates = Some(hit.coordinates);
    resolution.formatted_address = hit.formatted_address;
    resolution.source = Some(source);
    resolution.strategy = Some(strategy.name);
    resolution.query = Some(query);
    resolution
}
