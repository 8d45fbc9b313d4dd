use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::rate_limit::RateLimiter;
use crate::record::PlaceRecord;

const DETAILS_QPS: u32 = 5;
const HOURS_SEPARATOR: &str = "<br>";

/// Fields the Places API can fill in for a venue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceDetails {
    /// One line per weekday, joined with `<br>` for the map popup.
    pub opening_hours: Option<String>,
    pub instagram_url: Option<String>,
}

#[async_trait]
pub trait PlaceDetailsLookup: Send + Sync {
    /// `Ok(None)` when the service could not identify the place.
    async fn lookup(&self, name: &str, address: Option<&str>) -> AppResult<Option<PlaceDetails>>;
}

/// Google Places "find place" followed by "place details".
pub struct HttpPlaceDetails {
    http: Client,
    find_endpoint: Url,
    details_endpoint: Url,
    api_key: SecretString,
}

impl HttpPlaceDetails {
    pub fn new(api_base: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let base = api_base.trim_end_matches('/');
        let endpoint = |path: &str| {
            Url::parse(&format!("{base}/{path}"))
                .map_err(|err| AppError::Config(format!("invalid places endpoint: {err}")))
        };
        let http = Client::builder()
            .user_agent(concat!("happyhour-places/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            find_endpoint: endpoint("findplacefromtext/json")?,
            details_endpoint: endpoint("details/json")?,
            api_key,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, mut url: Url, params: &[(&str, &str)]) -> AppResult<T> {
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in params {
                query.append_pair(name, value);
            }
            query.append_pair("key", self.api_key.expose_secret());
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| AppError::Http(err.without_url()))?;
        response
            .json()
            .await
            .map_err(|err| AppError::Http(err.without_url()))
    }
}

fn status_error(status: &str, message: Option<String>) -> AppError {
    AppError::PlaceDetails(match message {
        Some(message) => format!("{status}: {message}"),
        None => status.to_string(),
    })
}

#[async_trait]
impl PlaceDetailsLookup for HttpPlaceDetails {
    async fn lookup(&self, name: &str, address: Option<&str>) -> AppResult<Option<PlaceDetails>> {
        #[derive(Deserialize)]
        struct FindResponse {
            status: String,
            #[serde(default)]
            candidates: Vec<Candidate>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct Candidate {
            place_id: String,
        }

        #[derive(Deserialize)]
        struct DetailsResponse {
            status: String,
            result: Option<DetailsResult>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct DetailsResult {
            opening_hours: Option<OpeningHours>,
            website: Option<String>,
        }

        #[derive(Deserialize)]
        struct OpeningHours {
            #[serde(default)]
            weekday_text: Vec<String>,
        }

        let input = match address {
            Some(address) => format!("{name} {address}"),
            None => name.to_string(),
        };
        let found: FindResponse = self
            .get_json(
                self.find_endpoint.clone(),
                &[
                    ("input", input.as_str()),
                    ("inputtype", "textquery"),
                    ("fields", "place_id"),
                ],
            )
            .await?;
        let place_id = match found.status.as_str() {
            "OK" => match found.candidates.into_iter().next() {
                Some(candidate) => candidate.place_id,
                None => return Ok(None),
            },
            "ZERO_RESULTS" => return Ok(None),
            other => return Err(status_error(other, found.error_message)),
        };

        let details: DetailsResponse = self
            .get_json(
                self.details_endpoint.clone(),
                &[
                    ("place_id", place_id.as_str()),
                    ("fields", "opening_hours,website"),
                ],
            )
            .await?;
        match details.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" | "NOT_FOUND" => return Ok(None),
            other => return Err(status_error(other, details.error_message)),
        }
        let Some(result) = details.result else {
            return Ok(None);
        };

        let opening_hours = result
            .opening_hours
            .map(|hours| hours.weekday_text)
            .filter(|lines| !lines.is_empty())
            .map(|lines| lines.join(HOURS_SEPARATOR));
        let instagram_url = result
            .website
            .filter(|site| site.to_ascii_lowercase().contains("instagram.com"));
        Ok(Some(PlaceDetails {
            opening_hours,
            instagram_url,
        }))
    }
}

/// Fills missing opening hours and Instagram links on assembled records.
/// Answers are remembered per venue for the life of the process, and
/// lookups are spaced at five per second.
pub struct DetailsEnricher {
    lookup: Arc<dyn PlaceDetailsLookup>,
    rate_limiter: RateLimiter,
    answered: Mutex<HashMap<String, Option<PlaceDetails>>>,
}

impl DetailsEnricher {
    pub fn new(lookup: Arc<dyn PlaceDetailsLookup>) -> Self {
        Self {
            lookup,
            rate_limiter: RateLimiter::new(DETAILS_QPS),
            answered: Mutex::new(HashMap::new()),
        }
    }

    /// `None` unless `PLACE_DETAILS_ENABLED` is set and an API key exists.
    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        if !config.place_details_enabled {
            return Ok(None);
        }
        let Some(key) = config.google_maps_api_key.clone() else {
            warn!(target: "details", "PLACE_DETAILS_ENABLED without GOOGLE_MAPS_API_KEY; skipping details");
            return Ok(None);
        };
        let lookup = HttpPlaceDetails::new(
            &config.places_api_base,
            key,
            Duration::from_secs(config.geocode_timeout_secs),
        )?;
        Ok(Some(Self::new(Arc::new(lookup))))
    }

    pub fn wants(record: &PlaceRecord) -> bool {
        record.opening_hours.is_none() || record.instagram_url.is_none()
    }

    /// Returns true when at least one field was filled. Fields the record
    /// already has are never replaced, and failed lookups are not remembered.
    pub async fn enrich(&self, record: &mut PlaceRecord) -> bool {
        if !Self::wants(record) {
            return false;
        }

        let key = record.normalized_name();
        let remembered = self.answered.lock().get(&key).cloned();
        let details = match remembered {
            Some(details) => {
                debug!(target: "details", name = %record.name, "details already looked up");
                details
            }
            None => {
                self.rate_limiter.wait().await;
                match self.lookup.lookup(&record.name, record.address.as_deref()).await {
                    Ok(details) => {
                        self.answered.lock().insert(key, details.clone());
                        details
                    }
                    Err(err) => {
                        warn!(target: "details", name = %record.name, error = %err, "place details lookup failed");
                        return false;
                    }
                }
            }
        };

        let Some(details) = details else {
            return false;
        };
        let mut filled = false;
        if record.opening_hours.is_none() && details.opening_hours.is_some() {
            record.opening_hours = details.opening_hours;
            filled = true;
        }
        if record.instagram_url.is_none() && details.instagram_url.is_some() {
            record.instagram_url = details.instagram_url;
            filled = true;
        }
        if filled {
            info!(target: "details", name = %record.name, "filled place details");
        }
        filled
    }
}
