use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_PLACES_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_PLACES_CSV_PATH: &str = "places.csv";
const DEFAULT_SUBMISSIONS_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_SUBMISSIONS_MAX_FILES: usize = 5;
const DEFAULT_PLACE_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
pub(crate) const MAX_GEOCODE_QPS: u32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeCacheBackend {
    Json,
    Sqlite,
}

impl GeocodeCacheBackend {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" | "db" => GeocodeCacheBackend::Sqlite,
            _ => GeocodeCacheBackend::Json,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub google_maps_api_key: Option<SecretString>,
    pub geocode_endpoint: String,
    pub geocode_timeout_secs: u64,
    pub geocode_rate_limit_qps: u32,
    pub geocode_cache_path: PathBuf,
    pub geocode_cache_backend: GeocodeCacheBackend,
    pub retry_failed_geocodes: bool,
    pub default_city: String,
    pub country: String,
    pub places_csv_path: Option<PathBuf>,
    pub places_csv_url: Option<String>,
    pub place_cache_ttl_secs: u64,
    pub cleared_categories: Vec<String>,
    pub place_details_enabled: bool,
    pub places_api_base: String,
    pub submissions_dir: PathBuf,
    pub submissions_max_bytes: u64,
    pub submissions_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocode_endpoint: String,
    pub geocode_timeout_secs: u64,
    pub geocode_rate_limit_qps: u32,
    pub geocode_cache_path: String,
    pub geocode_cache_backend: GeocodeCacheBackend,
    pub retry_failed_geocodes: bool,
    pub default_city: String,
    pub country: String,
    pub places_csv_path: Option<String>,
    pub places_csv_url: Option<String>,
    pub place_cache_ttl_secs: u64,
    pub cleared_categories: Vec<String>,
    pub place_details_enabled: bool,
    pub places_api_base: String,
    pub has_google_maps_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let places_csv_url = non_empty("PLACES_CSV_URL");
        Self {
            google_maps_api_key: non_empty("GOOGLE_MAPS_API_KEY").map(SecretString::from),
            geocode_endpoint: non_empty("GEOCODE_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_GEOCODE_ENDPOINT.to_string()),
            geocode_timeout_secs: parse_u64("GEOCODE_TIMEOUT_SECS", 10).max(1),
            geocode_rate_limit_qps: parse_u32("GEOCODE_RATE_LIMIT_QPS", 5)
                .clamp(1, MAX_GEOCODE_QPS),
            geocode_cache_path: non_empty("GEOCODE_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("geocode_cache.json")),
            geocode_cache_backend: non_empty("GEOCODE_CACHE_BACKEND")
                .map(|v| GeocodeCacheBackend::parse(&v))
                .unwrap_or(GeocodeCacheBackend::Json),
            retry_failed_geocodes: parse_bool("GEOCODE_RETRY_FAILED", false),
            default_city: non_empty("GEOCODE_DEFAULT_CITY")
                .unwrap_or_else(|| "Tel Aviv".to_string()),
            country: non_empty("GEOCODE_COUNTRY").unwrap_or_else(|| "Israel".to_string()),
            places_csv_path: csv_path_or_default(
                non_empty("PLACES_CSV_PATH"),
                places_csv_url.as_deref(),
            ),
            places_csv_url,
            place_cache_ttl_secs: parse_u64("PLACE_CACHE_TTL_SECS", DEFAULT_PLACE_CACHE_TTL_SECS)
                .max(1),
            cleared_categories: non_empty("CLEARED_CATEGORIES")
                .map(|v| parse_list(&v))
                .unwrap_or_else(|| vec!["Restaurant".to_string()]),
            place_details_enabled: parse_bool("PLACE_DETAILS_ENABLED", false),
            places_api_base: non_empty("PLACES_API_BASE")
                .unwrap_or_else(|| DEFAULT_PLACES_API_BASE.to_string()),
            submissions_dir: non_empty("SUBMISSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            submissions_max_bytes: parse_u64(
                "SUBMISSIONS_MAX_BYTES",
                DEFAULT_SUBMISSIONS_MAX_BYTES,
            ),
            submissions_max_files: parse_usize(
                "SUBMISSIONS_MAX_FILES",
                DEFAULT_SUBMISSIONS_MAX_FILES,
            )
            .max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocode_endpoint: self.geocode_endpoint.clone(),
            geocode_timeout_secs: self.geocode_timeout_secs,
            geocode_rate_limit_qps: self.geocode_rate_limit_qps,
            geocode_cache_path: self.geocode_cache_path.to_string_lossy().to_string(),
            geocode_cache_backend: self.geocode_cache_backend,
            retry_failed_geocodes: self.retry_failed_geocodes,
            default_city: self.default_city.clone(),
            country: self.country.clone(),
            places_csv_path: self
                .places_csv_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            places_csv_url: self.places_csv_url.clone(),
            place_cache_ttl_secs: self.place_cache_ttl_secs,
            cleared_categories: self.cleared_categories.clone(),
            place_details_enabled: self.place_details_enabled,
            places_api_base: self.places_api_base.clone(),
            has_google_maps_key: self.google_maps_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            google_maps_api_key: None,
            geocode_endpoint: DEFAULT_GEOCODE_ENDPOINT.to_string(),
            geocode_timeout_secs: 10,
            geocode_rate_limit_qps: 5,
            geocode_cache_path: PathBuf::from("geocode_cache.json"),
            geocode_cache_backend: GeocodeCacheBackend::Json,
            retry_failed_geocodes: false,
            default_city: "Tel Aviv".to_string(),
            country: "Israel".to_string(),
            places_csv_path: None,
            places_csv_url: None,
            place_cache_ttl_secs: DEFAULT_PLACE_CACHE_TTL_SECS,
            cleared_categories: vec!["Restaurant".to_string()],
            place_details_enabled: false,
            places_api_base: DEFAULT_PLACES_API_BASE.to_string(),
            submissions_dir: PathBuf::from("data"),
            submissions_max_bytes: DEFAULT_SUBMISSIONS_MAX_BYTES,
            submissions_max_files: DEFAULT_SUBMISSIONS_MAX_FILES,
        }
    }
}

/// The local export is read from `places.csv` unless a path is given or a
/// published sheet replaces it.
fn csv_path_or_default(path: Option<String>, url: Option<&str>) -> Option<PathBuf> {
    match (path, url) {
        (Some(path), _) => Some(PathBuf::from(path)),
        (None, None) => Some(PathBuf::from(DEFAULT_PLACES_CSV_PATH)),
        (None, Some(_)) => None,
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
