use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::record::Coordinates;

/// A geocoder hit: where the place is and the address the service matched.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeMatch {
    pub coordinates: Coordinates,
    pub formatted_address: Option<String>,
}

impl GeocodeMatch {
    pub fn at(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            formatted_address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.formatted_address = Some(address.into());
        self
    }
}

/// External free-text geocoding capability.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the service answered with no match; `Err` means it
    /// did not answer.
    async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeMatch>>;

    fn is_available(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct GeocodingService {
    inner: Arc<dyn Geocoder>,
}

impl GeocodingService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        match config.google_maps_api_key.clone() {
            Some(key) => {
                let client = HttpGeocoder::new(
                    &config.geocode_endpoint,
                    key,
                    Duration::from_secs(config.geocode_timeout_secs),
                )?;
                Ok(Self {
                    inner: Arc::new(client),
                })
            }
            None => {
                warn!("GOOGLE_MAPS_API_KEY not set; records without coordinates stay unlocated");
                Ok(Self {
                    inner: Arc::new(OfflineGeocoder),
                })
            }
        }
    }

    pub fn from_geocoder(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { inner: geocoder }
    }

    pub fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    pub async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeMatch>> {
        self.inner.geocode(query).await
    }
}

/// Google Geocoding API client.
pub struct HttpGeocoder {
    http: Client,
    endpoint: Url,
    api_key: SecretString,
}

impl HttpGeocoder {
    pub fn new(endpoint: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid geocode endpoint: {err}")))?;
        let http = Client::builder()
            .user_agent(concat!("happyhour-places/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, query: &str) -> AppResult<Option<GeocodeMatch>> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
            formatted_address: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("address", query)
            .append_pair("key", self.api_key.expose_secret());

        // strip the URL from transport errors so the key never reaches the logs
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| AppError::Http(err.without_url()))?;
        let parsed: Response = response
            .json()
            .await
            .map_err(|err| AppError::Http(err.without_url()))?;

        match parsed.status.as_str() {
            "OK" => Ok(parsed.results.into_iter().next().and_then(|result| {
                let location = result.geometry.location;
                let coordinates = Coordinates::new(location.lat, location.lng)?;
                Some(GeocodeMatch {
                    coordinates,
                    formatted_address: result
                        .formatted_address
                        .map(|address| address.trim().to_string())
                        .filter(|address| !address.is_empty()),
                })
            })),
            "ZERO_RESULTS" => Ok(None),
            other => Err(AppError::Geocoder(match parsed.error_message {
                Some(message) => format!("{other}: {message}"),
                None => other.to_string(),
            })),
        }
    }
}

/// Stand-in used when no API key is configured.
pub struct OfflineGeocoder;

#[async_trait]
impl Geocoder for OfflineGeocoder {
    async fn geocode(&self, _query: &str) -> AppResult<Option<GeocodeMatch>> {
        Err(AppError::Config("geocoding is not configured".into()))
    }

    fn is_available(&self) -> bool {
        false
    }
}
