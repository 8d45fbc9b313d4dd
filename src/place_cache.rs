use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::record::PlaceRecord;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

struct CachedPlaces {
    records: Arc<Vec<PlaceRecord>>,
    inserted_at: DateTime<Utc>,
}

/// Single-slot cache for the assembled place list.
pub struct PlaceDataCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<CachedPlaces>>,
}

impl PlaceDataCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the stored list while it is younger than the TTL.
    pub fn get(&self) -> Option<Arc<Vec<PlaceRecord>>> {
        let slot = self.slot.lock();
        let cached = slot.as_ref()?;
        let age = self.clock.now() - cached.inserted_at;
        if age < self.ttl {
            Some(Arc::clone(&cached.records))
        } else {
            debug!(target: "place_cache", age_secs = age.num_seconds(), "cached place list is stale");
            None
        }
    }

    pub fn put(&self, records: Vec<PlaceRecord>) -> Arc<Vec<PlaceRecord>> {
        let records = Arc::new(records);
        *self.slot.lock() = Some(CachedPlaces {
            records: Arc::clone(&records),
            inserted_at: self.clock.now(),
        });
        debug!(target: "place_cache", count = records.len(), "stored place list");
        records
    }

    pub fn invalidate(&self) {
        if self.slot.lock().take().is_some() {
            debug!(target: "place_cache", "place list invalidated");
        }
    }

    /// Insertion time of the current entry, stale or not.
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.slot.lock().as_ref().map(|cached| cached.inserted_at)
    }

    /// Record count of the current entry, stale or not.
    pub fn cached_len(&self) -> Option<usize> {
        self.slot.lock().as_ref().map(|cached| cached.records.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn cache() -> (PlaceDataCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap(),
        ));
        (
            PlaceDataCache::with_clock(Duration::hours(24), clock.clone()),
            clock,
        )
    }

    #[test]
    fn empty_cache_misses() {
        let (cache, _) = cache();
        assert!(cache.get().is_none());
        assert!(cache.last_refreshed().is_none());
    }

    #[test]
    fn entry_expires_after_ttl() {
        let (cache, clock) = cache();
        cache.put(vec![PlaceRecord::named("Romano")]);

        clock.advance(Duration::hours(23) + Duration::minutes(59));
        assert_eq!(cache.get().map(|list| list.len()), Some(1));

        clock.advance(Duration::minutes(2));
        assert!(cache.get().is_none());
    }

    #[test]
    fn ttl_boundary_is_exclusive() {
        let (cache, clock) = cache();
        cache.put(Vec::new());
        clock.advance(Duration::hours(24));
        assert!(cache.get().is_none());
    }

    #[test]
    fn invalidate_forces_a_miss() {
        let (cache, _) = cache();
        cache.put(vec![PlaceRecord::named("Bellboy")]);
        cache.invalidate();
        assert!(cache.get().is_none());
        assert!(cache.last_refreshed().is_none());
    }

    #[test]
    fn stale_entry_is_kept_until_replaced() {
        let (cache, clock) = cache();
        let first_put = clock.now();
        cache.put(vec![PlaceRecord::named("Alibi")]);
        clock.advance(Duration::days(2));

        assert!(cache.get().is_none());
        assert_eq!(cache.last_refreshed(), Some(first_put));
        assert_eq!(cache.cached_len(), Some(1));

        cache.put(vec![PlaceRecord::named("Alibi"), PlaceRecord::named("Noama")]);
        assert_eq!(cache.get().map(|list| list.len()), Some(2));
        assert_eq!(cache.last_refreshed(), Some(clock.now()));
    }
}
