use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, GeocodeCacheBackend};
use crate::db;
use crate::errors::{AppError, AppResult};
use crate::geocoder::GeocodeMatch;
use crate::record::Coordinates;

const CACHE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GeocodeOutcome {
    Found {
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        formatted_address: Option<String>,
    },
    /// The geocoder answered and had no match.
    NotFound,
    /// The geocoder did not answer (timeout, transport error, quota).
    Failed { reason: String },
}

impl GeocodeOutcome {
    pub fn found(found: GeocodeMatch) -> Self {
        GeocodeOutcome::Found {
            latitude: found.coordinates.latitude,
            longitude: found.coordinates.longitude,
            formatted_address: found.formatted_address,
        }
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match self {
            GeocodeOutcome::Found {
                latitude,
                longitude,
                ..
            } => Coordinates::new(*latitude, *longitude),
            _ => None,
        }
    }

    /// The address the geocoder matched, for `found` entries that have one.
    pub fn formatted_address(&self) -> Option<&str> {
        match self {
            GeocodeOutcome::Found {
                formatted_address, ..
            } => formatted_address.as_deref(),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            GeocodeOutcome::Found { .. } => "found",
            GeocodeOutcome::NotFound => "not_found",
            GeocodeOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeEntry {
    #[serde(flatten)]
    pub outcome: GeocodeOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeocodeCacheSummary {
    pub found: usize,
    pub not_found: usize,
    pub failed: usize,
}

pub type GeocodeEntries = BTreeMap<String, GeocodeEntry>;

/// Durable backing for [`GeocodeCache`].
pub trait GeocodeStore: Send + Sync {
    fn describe(&self) -> String;

    fn load(&self) -> AppResult<GeocodeEntries>;

    /// Persists `query` after it was added to `entries`.
    fn record(&self, entries: &GeocodeEntries, query: &str) -> AppResult<()>;

    fn replace_all(&self, entries: &GeocodeEntries) -> AppResult<()>;
}

/// Query → outcome map shared by every resolution in the process.
pub struct GeocodeCache {
    entries: Mutex<GeocodeEntries>,
    store: Option<Box<dyn GeocodeStore>>,
}

impl GeocodeCache {
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(GeocodeEntries::new()),
            store: None,
        }
    }

    /// Loads `store`; an unreadable store starts the cache empty.
    pub fn open(store: Box<dyn GeocodeStore>) -> Self {
        let entries = match store.load() {
            Ok(entries) => {
                info!(
                    target: "geocode_cache",
                    store = %store.describe(),
                    entries = entries.len(),
                    "geocode cache loaded"
                );
                entries
            }
            Err(err) => {
                warn!(
                    target: "geocode_cache",
                    store = %store.describe(),
                    error = %err,
                    "geocode cache unreadable; starting empty"
                );
                GeocodeEntries::new()
            }
        };
        Self {
            entries: Mutex::new(entries),
            store: Some(store),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let path = config.geocode_cache_path.clone();
        match config.geocode_cache_backend {
            GeocodeCacheBackend::Json => Self::open(Box::new(JsonFileStore::new(path))),
            GeocodeCacheBackend::Sqlite => match SqliteStore::open(&path) {
                Ok(store) => Self::open(Box::new(store)),
                Err(err) => {
                    warn!(
                        target: "geocode_cache",
                        path = %path.display(),
                        error = %err,
                        "sqlite geocode store unavailable; caching in memory only"
                    );
                    Self::in_memory()
                }
            },
        }
    }

    pub fn get(&self, query: &str) -> Option<GeocodeEntry> {
        self.entries.lock().get(query).cloned()
    }

    pub fn insert(&self, query: &str, outcome: GeocodeOutcome) {
        let entry = GeocodeEntry {
            outcome,
            recorded_at: Utc::now(),
        };
        let mut entries = self.entries.lock();
        debug!(target: "geocode_cache", query, status = entry.outcome.as_tag(), "caching geocode outcome");
        entries.insert(query.to_string(), entry);
        if let Some(store) = &self.store {
            if let Err(err) = store.record(&entries, query) {
                warn!(
                    target: "geocode_cache",
                    store = %store.describe(),
                    error = %err,
                    "failed to persist geocode cache; keeping entry in memory"
                );
            }
        }
    }

    /// Drops every `failed` entry so those queries are tried again.
    pub fn purge_failures(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !matches!(entry.outcome, GeocodeOutcome::Failed { .. }));
        let removed = before - entries.len();
        if removed > 0 {
            if let Some(store) = &self.store {
                if let Err(err) = store.replace_all(&entries) {
                    warn!(
                        target: "geocode_cache",
                        store = %store.describe(),
                        error = %err,
                        "failed to persist purged geocode cache"
                    );
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn summary(&self) -> GeocodeCacheSummary {
        let entries = self.entries.lock();
        entries
            .values()
            .fold(GeocodeCacheSummary::default(), |mut acc, entry| {
                match entry.outcome {
                    GeocodeOutcome::Found { .. } => acc.found += 1,
                    GeocodeOutcome::NotFound => acc.not_found += 1,
                    GeocodeOutcome::Failed { .. } => acc.failed += 1,
                }
                acc
            })
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: GeocodeEntries,
}

/// Whole-file JSON store, rewritten on every new entry.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GeocodeStore for JsonFileStore {
    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    fn load(&self) -> AppResult<GeocodeEntries> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(GeocodeEntries::new()),
            Ok(contents) => {
                let file: CacheFile = serde_json::from_str(&contents)?;
                Ok(file.entries)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(GeocodeEntries::new()),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    fn record(&self, entries: &GeocodeEntries, _query: &str) -> AppResult<()> {
        self.replace_all(entries)
    }

    fn replace_all(&self, entries: &GeocodeEntries) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = CacheFile {
            version: CACHE_FILE_VERSION,
            entries: entries.clone(),
        };
        let serialized = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, serialized)?;
        Ok(())
    }
}

/// Row-per-query store for caches that outgrow a single JSON file.
pub struct SqliteStore {
    connection: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        let db = db::open_geocode_db(path)?;
        if db.recreated {
            warn!(
                target: "geocode_cache",
                path = %path.display(),
                "geocode database was recreated; previous entries are lost"
            );
        }
        Ok(Self {
            connection: Mutex::new(db.connection),
            path: path.to_path_buf(),
        })
    }

    fn upsert(connection: &Connection, query: &str, entry: &GeocodeEntry) -> AppResult<()> {
        let (latitude, longitude, reason) = match &entry.outcome {
            GeocodeOutcome::Found {
                latitude,
                longitude,
                ..
            } => (Some(*latitude), Some(*longitude), None),
            GeocodeOutcome::NotFound => (None, None, None),
            GeocodeOutcome::Failed { reason } => (None, None, Some(reason.as_str())),
        };
        connection.execute(
            "INSERT INTO geocode_cache
                (query, status, latitude, longitude, formatted_address, reason, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(query) DO UPDATE SET
                status = excluded.status,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                formatted_address = excluded.formatted_address,
                reason = excluded.reason,
                recorded_at = excluded.recorded_at",
            params![
                query,
                entry.outcome.as_tag(),
                latitude,
                longitude,
                entry.outcome.formatted_address(),
                reason,
                entry.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl GeocodeStore for SqliteStore {
    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn load(&self) -> AppResult<GeocodeEntries> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(
            "SELECT query, status, latitude, longitude, formatted_address, reason, recorded_at
            FROM geocode_cache",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = GeocodeEntries::new();
        for (query, status, latitude, longitude, formatted_address, reason, recorded_at) in rows {
            let outcome = match (status.as_str(), latitude, longitude) {
                ("found", Some(latitude), Some(longitude)) => GeocodeOutcome::Found {
                    latitude,
                    longitude,
                    formatted_address,
                },
                ("not_found", _, _) => GeocodeOutcome::NotFound,
                ("failed", _, _) => GeocodeOutcome::Failed {
                    reason: reason.unwrap_or_default(),
                },
                _ => {
                    warn!(target: "geocode_cache", query = %query, status = %status, "skipping malformed geocode row");
                    continue;
                }
            };
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            entries.insert(
                query,
                GeocodeEntry {
                    outcome,
                    recorded_at,
                },
            );
        }
        Ok(entries)
    }

    fn record(&self, entries: &GeocodeEntries, query: &str) -> AppResult<()> {
        let Some(entry) = entries.get(query) else {
            return Ok(());
        };
        let conn = self.connection.lock();
        Self::upsert(&conn, query, entry)
    }

    fn replace_all(&self, entries: &GeocodeEntries) -> AppResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM geocode_cache", [])?;
        for (query, entry) in entries {
            Self::upsert(&tx, query, entry)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn romano() -> GeocodeOutcome {
        GeocodeOutcome::found(GeocodeMatch::at(Coordinates::new(32.0618, 34.7712).unwrap()))
    }

    #[test]
    fn json_store_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("geocode_cache.json");
        {
            let cache = GeocodeCache::open(Box::new(JsonFileStore::new(&path)));
            assert!(cache.is_empty());
            cache.insert("Romano, Tel Aviv, Israel", romano());
            cache.insert("Nowhere, Israel", GeocodeOutcome::NotFound);
        }

        let reopened = GeocodeCache::open(Box::new(JsonFileStore::new(&path)));
        assert_eq!(reopened.len(), 2);
        let hit = reopened.get("Romano, Tel Aviv, Israel").unwrap();
        assert_eq!(hit.outcome.coordinates(), Coordinates::new(32.0618, 34.7712));
        assert_eq!(
            reopened.get("Nowhere, Israel").unwrap().outcome,
            GeocodeOutcome::NotFound
        );
    }

    #[test]
    fn corrupt_or_missing_json_starts_empty() {
        let dir = tempdir().unwrap();
        let missing = GeocodeCache::open(Box::new(JsonFileStore::new(dir.path().join("nope.json"))));
        assert!(missing.is_empty());

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        let cache = GeocodeCache::open(Box::new(JsonFileStore::new(&path)));
        assert!(cache.is_empty());

        cache.insert("Romano, Tel Aviv, Israel", romano());
        let reopened = GeocodeCache::open(Box::new(JsonFileStore::new(&path)));
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn write_failure_keeps_entry_in_memory() {
        let dir = tempdir().unwrap();
        // a directory where the file should be makes every write fail
        let cache = GeocodeCache::open(Box::new(JsonFileStore::new(dir.path())));
        cache.insert("Romano, Tel Aviv, Israel", romano());
        assert!(cache.get("Romano, Tel Aviv, Israel").is_some());
    }

    #[test]
    fn sqlite_store_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geocode.db");
        {
            let cache = GeocodeCache::open(Box::new(SqliteStore::open(&path).unwrap()));
            cache.insert("Romano, Tel Aviv, Israel", romano());
            cache.insert(
                "Bar 223, Israel",
                GeocodeOutcome::Failed {
                    reason: "timed out".into(),
                },
            );
            cache.insert("Bar 223, Israel", GeocodeOutcome::NotFound);
        }

        let reopened = GeocodeCache::open(Box::new(SqliteStore::open(&path).unwrap()));
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.summary(),
            GeocodeCacheSummary {
                found: 1,
                not_found: 1,
                failed: 0
            }
        );
    }

    #[test]
    fn matched_address_survives_restart_in_both_stores() {
        let dir = tempdir().unwrap();
        let outcome = GeocodeOutcome::found(
            GeocodeMatch::at(Coordinates::new(32.0633, 34.7745).unwrap())
                .with_address("Rothschild Blvd 1, Tel Aviv-Yafo, Israel"),
        );

        let json_path = dir.path().join("geocode_cache.json");
        GeocodeCache::open(Box::new(JsonFileStore::new(&json_path)))
            .insert("Bellboy, Tel Aviv, Israel", outcome.clone());
        let from_json = GeocodeCache::open(Box::new(JsonFileStore::new(&json_path)));

        let db_path = dir.path().join("geocode.db");
        GeocodeCache::open(Box::new(SqliteStore::open(&db_path).unwrap()))
            .insert("Bellboy, Tel Aviv, Israel", outcome.clone());
        let from_db = GeocodeCache::open(Box::new(SqliteStore::open(&db_path).unwrap()));

        for cache in [from_json, from_db] {
            let entry = cache.get("Bellboy, Tel Aviv, Israel").unwrap();
            assert_eq!(entry.outcome, outcome);
            assert_eq!(
                entry.outcome.formatted_address(),
                Some("Rothschild Blvd 1, Tel Aviv-Yafo, Israel")
            );
        }
    }

    #[test]
    fn cache_files_without_addresses_still_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geocode_cache.json");
        std::fs::write(
            &path,
            r#"{"version":1,"entries":{"Romano, Tel Aviv, Israel":
                {"status":"found","latitude":32.0618,"longitude":34.7712,
                 "recorded_at":"2024-06-01T18:00:00Z"}}}"#,
        )
        .unwrap();

        let cache = GeocodeCache::open(Box::new(JsonFileStore::new(&path)));
        let entry = cache.get("Romano, Tel Aviv, Israel").unwrap();
        assert_eq!(entry.outcome, romano());
        assert_eq!(entry.outcome.formatted_address(), None);
    }

    #[test]
    fn purge_removes_only_failures() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geocode_cache.json");
        let cache = GeocodeCache::open(Box::new(JsonFileStore::new(&path)));
        cache.insert("a", romano());
        cache.insert("b", GeocodeOutcome::NotFound);
        cache.insert(
            "c",
            GeocodeOutcome::Failed {
                reason: "connection reset".into(),
            },
        );

        assert_eq!(cache.purge_failures(), 1);
        assert_eq!(cache.purge_failures(), 0);

        let reopened = GeocodeCache::open(Box::new(JsonFileStore::new(&path)));
        assert_eq!(reopened.len(), 2);
        assert!(reopened.get("c").is_none());
    }

    #[test]
    fn serializes_outcome_with_status_tag() {
        let entry = GeocodeEntry {
            outcome: GeocodeOutcome::Failed {
                reason: "quota".into(),
            },
            recorded_at: Utc::now(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["reason"], "quota");
        let back: GeocodeEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }
}
