pub mod config;
mod db;
pub mod details;
pub mod errors;
pub mod geocode_cache;
pub mod geocoder;
pub mod ingestion;
pub mod pipeline;
pub mod place_cache;
pub mod rate_limit;
pub mod reconcile;
pub mod record;
pub mod resolver;
pub mod submissions;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::AppConfig;
pub use details::{DetailsEnricher, HttpPlaceDetails, PlaceDetails, PlaceDetailsLookup};
pub use errors::{AppError, AppResult};
pub use geocode_cache::{GeocodeCache, GeocodeOutcome, JsonFileStore, SqliteStore};
pub use geocoder::{GeocodeMatch, Geocoder, GeocodingService, HttpGeocoder};
pub use ingestion::{CsvFileSource, FieldAliases, RecordSource, RemoteCsvSource, StaticSource};
pub use pipeline::{AssemblyStats, PipelineStatus, PlacePipeline};
pub use place_cache::{Clock, ManualClock, PlaceDataCache, SystemClock};
pub use reconcile::{reconcile, reconcile_with_stats};
pub use record::{Coordinates, DayOfWeek, PlaceRecord, RawRecord};
pub use resolver::{GeocodingResolver, Resolution, Strategy};
pub use submissions::SubmissionLog;

/// Installs the global fmt subscriber once; later calls are no-ops.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,happyhour_places=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
