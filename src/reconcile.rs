use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::record::PlaceRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub updated: usize,
    pub dropped: usize,
}

/// Upserts `incoming` into `existing` by normalized name.
pub fn reconcile(existing: Vec<PlaceRecord>, incoming: Vec<PlaceRecord>) -> Vec<PlaceRecord> {
    reconcile_with_stats(existing, incoming).0
}

pub fn reconcile_with_stats(
    existing: Vec<PlaceRecord>,
    incoming: Vec<PlaceRecord>,
) -> (Vec<PlaceRecord>, ReconcileStats) {
    let mut stats = ReconcileStats::default();
    let mut canonical: Vec<PlaceRecord> = Vec::with_capacity(existing.len() + incoming.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(canonical.capacity());

    for record in existing {
        let key = record.normalized_name();
        if key.is_empty() || index.contains_key(&key) {
            debug!(target: "reconcile", name = %record.name, "dropping unnamed or duplicate existing record");
            stats.dropped += 1;
            continue;
        }
        index.insert(key, canonical.len());
        canonical.push(record);
    }

    for record in incoming {
        let key = record.normalized_name();
        if key.is_empty() {
            debug!(target: "reconcile", "dropping incoming record without a name");
            stats.dropped += 1;
            continue;
        }
        match index.get(&key) {
            Some(&position) => {
                canonical[position].merge_from(record);
                stats.updated += 1;
            }
            None => {
                index.insert(key, canonical.len());
                canonical.push(record);
                stats.inserted += 1;
            }
        }
    }

    canonical.retain(|record| !record.normalized_name().is_empty());

    info!(
        target: "reconcile",
        total = canonical.len(),
        inserted = stats.inserted,
        updated = stats.updated,
        dropped = stats.dropped,
        "reconciled place records"
    );
    (canonical, stats)
}

/// Blanks categories listed in `cleared` (case-insensitive), e.g. a catch-all
/// "Restaurant" tag that carries no information on the map.
pub fn clear_categories(records: &mut [PlaceRecord], cleared: &[String]) -> usize {
    if cleared.is_empty() {
        return 0;
    }
    let mut count = 0;
    for record in records.iter_mut() {
        let matches = record.category.as_deref().is_some_and(|category| {
            cleared
                .iter()
                .any(|c| c.trim().eq_ignore_ascii_case(category.trim()))
        });
        if matches {
            record.category = None;
            count += 1;
        }
    }
    if count > 0 {
        debug!(target: "reconcile", count, "cleared placeholder categories");
    }
    count
}
