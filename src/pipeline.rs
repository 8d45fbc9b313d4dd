use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::details::DetailsEnricher;
use crate::errors::{AppError, AppResult};
use crate::geocode_cache::{GeocodeCache, GeocodeCacheSummary};
use crate::geocoder::GeocodingService;
use crate::ingestion::{CsvFileSource, FieldAliases, RecordSource, RemoteCsvSource};
use crate::place_cache::PlaceDataCache;
use crate::reconcile::{clear_categories, reconcile_with_stats};
use crate::record::PlaceRecord;
use crate::resolver::{GeocodingResolver, ResolutionSource};

const MAX_TTL_SECS: i64 = 365 * 24 * 60 * 60;

/// Counters for one assembly run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyStats {
    pub records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub dropped: usize,
    pub categories_cleared: usize,
    pub already_located: usize,
    pub cache_hits: usize,
    pub geocoder_calls: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub addresses_filled: usize,
    pub details_filled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub last_refreshed: Option<DateTime<Utc>>,
    pub cache_fresh: bool,
    pub cached_records: Option<usize>,
    pub ttl_secs: i64,
    pub sources: Vec<String>,
    pub geocoder_available: bool,
    pub details_enabled: bool,
    pub geocode_cache: GeocodeCacheSummary,
    pub last_build: Option<AssemblyStats>,
}

/// Sources → reconciler → resolver → place cache. The list cache lives as
/// long as the pipeline value, so callers keep one around to benefit from it.
pub struct PlacePipeline {
    sources: Vec<Arc<dyn RecordSource>>,
    resolver: GeocodingResolver,
    geocoder: GeocodingService,
    cache: PlaceDataCache,
    cleared_categories: Vec<String>,
    details: Option<DetailsEnricher>,
    last_stats: Mutex<Option<AssemblyStats>>,
}

impl PlacePipeline {
    pub fn new(
        sources: Vec<Arc<dyn RecordSource>>,
        resolver: GeocodingResolver,
        geocoder: GeocodingService,
        cache: PlaceDataCache,
    ) -> Self {
        Self {
            sources,
            resolver,
            geocoder,
            cache,
            cleared_categories: Vec::new(),
            details: None,
            last_stats: Mutex::new(None),
        }
    }

    pub fn with_cleared_categories(mut self, categories: Vec<String>) -> Self {
        self.cleared_categories = categories;
        self
    }

    pub fn with_details(mut self, details: DetailsEnricher) -> Self {
        self.details = Some(details);
        self
    }

    /// Wires the configured CSV sources, geocode cache and geocoder.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let aliases = FieldAliases::default();
        let mut sources: Vec<Arc<dyn RecordSource>> = Vec::new();
        if let Some(path) = &config.places_csv_path {
            sources.push(Arc::new(CsvFileSource::new(path, aliases.clone())));
        }
        if let Some(url) = &config.places_csv_url {
            sources.push(Arc::new(RemoteCsvSource::new(
                url.clone(),
                StdDuration::from_secs(config.geocode_timeout_secs),
                aliases,
            )?));
        }
        if sources.is_empty() {
            return Err(AppError::Config(
                "no place source configured; set PLACES_CSV_PATH or PLACES_CSV_URL".into(),
            ));
        }

        let geocoder = GeocodingService::new(config)?;
        let geocode_cache = Arc::new(GeocodeCache::from_config(config));
        let resolver = GeocodingResolver::new(geocode_cache, geocoder.clone(), config);
        let ttl_secs = i64::try_from(config.place_cache_ttl_secs)
            .unwrap_or(MAX_TTL_SECS)
            .min(MAX_TTL_SECS);
        let ttl = Duration::seconds(ttl_secs);

        let pipeline = Self::new(sources, resolver, geocoder, PlaceDataCache::new(ttl))
            .with_cleared_categories(config.cleared_categories.clone());
        Ok(match DetailsEnricher::from_config(config)? {
            Some(details) => pipeline.with_details(details),
            None => pipeline,
        })
    }

    pub fn resolver(&self) -> &GeocodingResolver {
        &self.resolver
    }

    /// Returns the cached list, assembling it on a miss.
    pub async fn places(&self) -> AppResult<Arc<Vec<PlaceRecord>>> {
        if let Some(records) = self.cache.get() {
            debug!(target: "pipeline", count = records.len(), "serving cached place list");
            return Ok(records);
        }
        self.refresh().await
    }

    /// Rebuilds the list regardless of the cache state.
    pub async fn refresh(&self) -> AppResult<Arc<Vec<PlaceRecord>>> {
        let (records, stats) = self.assemble().await?;
        *self.last_stats.lock() = Some(stats);
        Ok(self.cache.put(records))
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            last_refreshed: self.cache.last_refreshed(),
            cache_fresh: self.cache.get().is_some(),
            cached_records: self.cache.cached_len(),
            ttl_secs: self.cache.ttl().num_seconds(),
            sources: self.sources.iter().map(|s| s.label().to_string()).collect(),
            geocoder_available: self.geocoder.is_available(),
            details_enabled: self.details.is_some(),
            geocode_cache: self.resolver.cache().summary(),
            last_build: *self.last_stats.lock(),
        }
    }

    async fn assemble(&self) -> AppResult<(Vec<PlaceRecord>, AssemblyStats)> {
        let mut stats = AssemblyStats::default();
        let mut canonical: Vec<PlaceRecord> = Vec::new();

        for source in &self.sources {
            let rows = source.fetch().await.map_err(|err| {
                warn!(target: "pipeline", source = %source.label(), error = %err, "place source unavailable");
                AppError::SourceUnavailable {
                    label: source.label().to_string(),
                    message: err.to_string(),
                }
            })?;
            let batch = rows.iter().map(PlaceRecord::from_fields).collect();
            let (merged, batch_stats) = reconcile_with_stats(canonical, batch);
            canonical = merged;
            stats.inserted += batch_stats.inserted;
            stats.updated += batch_stats.updated;
            stats.dropped += batch_stats.dropped;
        }

        stats.categories_cleared = clear_categories(&mut canonical, &self.cleared_categories);

        for record in canonical.iter_mut() {
            if record.has_coordinates() {
                stats.already_located += 1;
                continue;
            }
            let resolution = self.resolver.resolve_record(record).await;
            stats.cache_hits += resolution.cache_hits;
            stats.geocoder_calls += resolution.geocoder_calls;
            match resolution.coordinates {
                Some(coordinates) => {
                    record.coordinates = Some(coordinates);
                    stats.resolved += 1;
                    if resolution.source == Some(ResolutionSource::Geocoder) {
                        debug!(target: "pipeline", name = %record.name, "located via geocoder");
                    }
                    if record.address.is_none() {
                        if let Some(address) = resolution.formatted_address {
                            debug!(target: "pipeline", name = %record.name, address = %address, "filled address from geocoder");
                            record.address = Some(address);
                            stats.addresses_filled += 1;
                        }
                    }
                }
                None => stats.unresolved += 1,
            }
        }

        if let Some(details) = &self.details {
            for record in canonical.iter_mut() {
                if details.enrich(record).await {
                    stats.details_filled += 1;
                }
            }
        }

        stats.records = canonical.len();
        info!(
            target: "pipeline",
            records = stats.records,
            already_located = stats.already_located,
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            geocoder_calls = stats.geocoder_calls,
            cache_hits = stats.cache_hits,
            addresses_filled = stats.addresses_filled,
            details_filled = stats.details_filled,
            "assembled place list"
        );
        Ok((canonical, stats))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::details::tests::{weekday_hours, FixedDetails};
    use crate::ingestion::StaticSource;
    use crate::place_cache::ManualClock;
    use crate::record::{
        Coordinates, RawRecord, FIELD_ADDRESS, FIELD_CATEGORY, FIELD_INSTAGRAM_URL, FIELD_LATITUDE,
        FIELD_LONGITUDE, FIELD_NAME, FIELD_OPENING_HOURS,
    };
    use crate::resolver::tests::{test_config, ScriptedGeocoder};

    struct CountingSource {
        inner: StaticSource,
        fetches: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new(rows: Vec<RawRecord>) -> Self {
            Self {
                inner: StaticSource::new("counting", rows, &FieldAliases::default()),
                fetches: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl RecordSource for CountingSource {
        fn label(&self) -> &str {
            self.inner.label()
        }

        async fn fetch(&self) -> AppResult<Vec<RawRecord>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Config("sheet offline".into()));
            }
            self.inner.fetch().await
        }
    }

    fn row(fields: &[(&str, &str)]) -> RawRecord {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pipeline(
        sources: Vec<Arc<dyn RecordSource>>,
        geocoder: Arc<ScriptedGeocoder>,
        clock: Arc<ManualClock>,
    ) -> PlacePipeline {
        let service = GeocodingService::from_geocoder(geocoder);
        let resolver = GeocodingResolver::new(
            Arc::new(GeocodeCache::in_memory()),
            service.clone(),
            &test_config(),
        );
        PlacePipeline::new(
            sources,
            resolver,
            service,
            PlaceDataCache::with_clock(Duration::hours(24), clock),
        )
        .with_cleared_categories(vec!["Restaurant".into()])
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn assembles_and_geocodes_missing_coordinates() {
        let source = Arc::new(CountingSource::new(vec![
            row(&[(FIELD_NAME, "Romano"), (FIELD_ADDRESS, ""), (FIELD_LATITUDE, ""), (FIELD_LONGITUDE, "")]),
            row(&[(FIELD_NAME, "Bellboy"), (FIELD_LATITUDE, "32.06"), (FIELD_LONGITUDE, "34.77"), (FIELD_CATEGORY, "Restaurant")]),
        ]));
        let geocoder = Arc::new(ScriptedGeocoder::default().answer(
            "Romano, Tel Aviv, Israel",
            32.0618,
            34.7712,
        ));
        let pipeline = pipeline(vec![source], geocoder.clone(), clock());

        let places = pipeline.places().await.unwrap();
        assert_eq!(places.len(), 2);
        assert_eq!(places[0].coordinates, Coordinates::new(32.0618, 34.7712));
        assert_eq!(places[1].coordinates, Coordinates::new(32.06, 34.77));
        assert!(places[1].category.is_none());
        assert_eq!(geocoder.calls(), vec!["Romano, Tel Aviv, Israel"]);

        let stats = pipeline.status().last_build.unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.already_located, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.categories_cleared, 1);
    }

    #[tokio::test]
    async fn geocoded_address_fills_only_missing_addresses() {
        let source = Arc::new(CountingSource::new(vec![
            row(&[(FIELD_NAME, "Bellboy")]),
            row(&[(FIELD_NAME, "Bar 223"), (FIELD_ADDRESS, "Dizengoff 223")]),
        ]));
        let geocoder = Arc::new(
            ScriptedGeocoder::default()
                .answer_at(
                    "Bellboy, Tel Aviv, Israel",
                    32.0633,
                    34.7745,
                    "Berdiczewski St 14, Tel Aviv-Yafo, Israel",
                )
                .answer_at(
                    "Bar 223, Dizengoff 223, Israel",
                    32.0854,
                    34.7739,
                    "Dizengoff St 223, Tel Aviv-Yafo, Israel",
                ),
        );
        let pipeline = pipeline(vec![source], geocoder.clone(), clock());

        let places = pipeline.places().await.unwrap();
        assert_eq!(
            places[0].address.as_deref(),
            Some("Berdiczewski St 14, Tel Aviv-Yafo, Israel")
        );
        assert_eq!(places[1].address.as_deref(), Some("Dizengoff 223"));
        assert_eq!(pipeline.status().last_build.unwrap().addresses_filled, 1);

        // the next build finds the matched address in the geocode cache
        pipeline.invalidate();
        let rebuilt = pipeline.places().await.unwrap();
        assert_eq!(rebuilt[0].address, places[0].address);
        assert_eq!(geocoder.calls().len(), 2);
    }

    #[tokio::test]
    async fn details_fill_hours_and_instagram_once_per_venue() {
        let source = Arc::new(CountingSource::new(vec![
            row(&[(FIELD_NAME, "Romano"), (FIELD_LATITUDE, "32.06"), (FIELD_LONGITUDE, "34.77")]),
            row(&[
                (FIELD_NAME, "Kuli Alma"),
                (FIELD_LATITUDE, "32.06"),
                (FIELD_LONGITUDE, "34.77"),
                (FIELD_OPENING_HOURS, "Daily 20:00-04:00"),
                (FIELD_INSTAGRAM_URL, "https://instagram.com/kulialma"),
            ]),
        ]));
        let lookup = Arc::new(FixedDetails {
            details: Some(weekday_hours()),
            ..FixedDetails::default()
        });
        let pipeline = pipeline(vec![source], Arc::new(ScriptedGeocoder::default()), clock())
            .with_details(DetailsEnricher::new(lookup.clone()));

        let places = pipeline.places().await.unwrap();
        assert_eq!(places[0].opening_hours, weekday_hours().opening_hours);
        assert_eq!(places[0].instagram_url, weekday_hours().instagram_url);
        assert_eq!(places[1].opening_hours.as_deref(), Some("Daily 20:00-04:00"));
        assert_eq!(*lookup.calls.lock(), vec!["Romano"]);
        assert!(pipeline.status().details_enabled);
        assert_eq!(pipeline.status().last_build.unwrap().details_filled, 1);

        pipeline.refresh().await.unwrap();
        assert_eq!(lookup.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_all_work() {
        let source = Arc::new(CountingSource::new(vec![row(&[(FIELD_NAME, "Louie")])]));
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let pipeline = pipeline(vec![source.clone()], geocoder.clone(), clock());

        let first = pipeline.places().await.unwrap();
        let second = pipeline.places().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(geocoder.calls().len(), 1);
    }

    #[tokio::test]
    async fn expired_or_invalidated_cache_rebuilds_using_geocode_cache() {
        let source = Arc::new(CountingSource::new(vec![row(&[(FIELD_NAME, "Romano")])]));
        let geocoder = Arc::new(ScriptedGeocoder::default().answer(
            "Romano, Tel Aviv, Israel",
            32.0618,
            34.7712,
        ));
        let clock = clock();
        let pipeline = pipeline(vec![source.clone()], geocoder.clone(), clock.clone());

        pipeline.places().await.unwrap();
        clock.advance(Duration::hours(24) + Duration::minutes(1));
        let rebuilt = pipeline.places().await.unwrap();
        pipeline.invalidate();
        let again = pipeline.places().await.unwrap();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(geocoder.calls().len(), 1);
        assert_eq!(rebuilt[0].coordinates, again[0].coordinates);
        assert_eq!(pipeline.status().last_build.unwrap().cache_hits, 1);
    }

    #[tokio::test]
    async fn later_sources_merge_into_earlier_ones() {
        let sheet = Arc::new(CountingSource::new(vec![row(&[
            (FIELD_NAME, "Alibi"),
            (FIELD_CATEGORY, "Bar"),
        ])]));
        let manual = Arc::new(CountingSource::new(vec![row(&[
            (FIELD_NAME, " alibi "),
            (FIELD_LATITUDE, "32.07"),
            (FIELD_LONGITUDE, "34.78"),
        ])]));
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let pipeline = pipeline(vec![sheet, manual], geocoder.clone(), clock());

        let places = pipeline.refresh().await.unwrap();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].name, "Alibi");
        assert_eq!(places[0].category.as_deref(), Some("Bar"));
        assert!(places[0].has_coordinates());
        assert!(geocoder.calls().is_empty());
    }

    #[tokio::test]
    async fn source_failure_propagates_and_caches_nothing() {
        let pipeline = pipeline(
            vec![Arc::new(CountingSource::failing())],
            Arc::new(ScriptedGeocoder::default()),
            clock(),
        );

        let err = pipeline.places().await.unwrap_err();
        assert!(matches!(err, AppError::SourceUnavailable { ref label, .. } if label == "counting"));
        assert!(pipeline.status().last_refreshed.is_none());
        assert!(pipeline.status().last_build.is_none());
    }

    #[tokio::test]
    async fn valid_cache_masks_a_failing_source_until_expiry() {
        let source = Arc::new(CountingSource::new(vec![row(&[(FIELD_NAME, "Noama")])]));
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let clock = clock();
        let healthy = pipeline(vec![source], geocoder.clone(), clock.clone());
        let cached = healthy.places().await.unwrap();

        let broken = PlacePipeline {
            sources: vec![Arc::new(CountingSource::failing())],
            ..healthy
        };
        assert_eq!(broken.places().await.unwrap(), cached);

        clock.advance(Duration::days(1));
        assert!(broken.places().await.is_err());
        assert_eq!(broken.status().cached_records, Some(1));
    }
}
