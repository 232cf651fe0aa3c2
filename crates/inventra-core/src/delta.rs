//! # Delta Merge
//!
//! Pure merge of a [`Delta`] into a cached [`CacheSnapshot`].
//!
//! ## Rules
//! ```text
//! ┌──────────────────┬──────────────────────────────────────────────────────┐
//! │ Collection       │ Merge                                                │
//! ├──────────────────┼──────────────────────────────────────────────────────┤
//! │ products         │ replace by id (row-level last-write-wins),           │
//! │ variants         │ new ids appended in delta order                      │
//! │ locations        │                                                      │
//! ├──────────────────┼──────────────────────────────────────────────────────┤
//! │ events           │ append only, deduplicated by event id;               │
//! │                  │ an already-known id is never replaced                │
//! ├──────────────────┼──────────────────────────────────────────────────────┤
//! │ watermarks       │ per collection max(cached, delta); never backward    │
//! │                  │ overall mark = max(cached, delta.fetched_at)         │
//! └──────────────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! `captured_at` is left alone: the caller stamps it when the merged snapshot
//! is committed. Merging the same delta twice is a no-op.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CacheSnapshot, Delta, Keyed, MovementEvent};

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Reference rows whose id was new.
    pub inserted: usize,
    /// Reference rows whose content changed.
    pub replaced: usize,
    /// Reference rows present in the delta but identical to the cache.
    pub unchanged: usize,
    /// Events appended.
    pub events_appended: usize,
    /// Events already known by id.
    pub events_skipped: usize,
    /// True if the watermark moved forward.
    pub watermark_advanced: bool,
}

impl MergeStats {
    /// True if the merge changed any row.
    pub fn changed(&self) -> bool {
        self.inserted + self.replaced + self.events_appended > 0
    }
}

/// Per-collection row counts of a fetched delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaStats {
    pub products: usize,
    pub variants: usize,
    pub locations: usize,
    pub events: usize,
    /// Page requests issued to fetch the delta.
    pub requests: usize,
}

impl DeltaStats {
    pub fn for_delta(delta: &Delta, requests: usize) -> Self {
        DeltaStats {
            products: delta.products.len(),
            variants: delta.variants.len(),
            locations: delta.locations.len(),
            events: delta.events.len(),
            requests,
        }
    }

    pub fn total(&self) -> usize {
        self.products + self.variants + self.locations + self.events
    }
}

/// Merges `delta` into `cached`, returning the new snapshot and stats.
pub fn merge(cached: &CacheSnapshot, delta: &Delta) -> (CacheSnapshot, MergeStats) {
    let mut stats = MergeStats::default();
    let mut merged = cached.clone();

    upsert_rows(&mut merged.products, &delta.products, &mut stats);
    upsert_rows(&mut merged.variants, &delta.variants, &mut stats);
    upsert_rows(&mut merged.locations, &delta.locations, &mut stats);
    append_events(&mut merged.events, &delta.events, &mut stats);

    let next = advance_watermark(cached.last_sync_watermark, delta.fetched_at);
    let marks = cached.watermarks.merged(&delta.watermarks);
    stats.watermark_advanced = next != cached.last_sync_watermark || marks != cached.watermarks;
    merged.last_sync_watermark = next;
    merged.watermarks = marks;

    (merged, stats)
}

/// Returns the later of two watermarks.
pub fn advance_watermark(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(c), Some(n)) => Some(c.max(n)),
        (c, n) => c.or(n),
    }
}

/// Replaces rows by key, appending new keys in delta order.
pub fn upsert_rows<T>(rows: &mut Vec<T>, changed: &[T], stats: &mut MergeStats)
where
    T: Keyed + Clone + PartialEq,
{
    let mut index: HashMap<String, usize> = rows
        .iter()
        .enumerate()
        .map(|(i, r)| (r.key().to_string(), i))
        .collect();

    for row in changed {
        match index.get(row.key()) {
            Some(&i) if rows[i] == *row => stats.unchanged += 1,
            Some(&i) => {
                rows[i] = row.clone();
                stats.replaced += 1;
            }
            None => {
                index.insert(row.key().to_string(), rows.len());
                rows.push(row.clone());
                stats.inserted += 1;
            }
        }
    }
}

fn append_events(events: &mut Vec<MovementEvent>, incoming: &[MovementEvent], stats: &mut MergeStats) {
    let mut known: HashSet<String> = events.iter().map(|e| e.id.clone()).collect();

    for event in incoming {
        if known.insert(event.id.clone()) {
            events.push(event.clone());
            stats.events_appended += 1;
        } else {
            stats.events_skipped += 1;
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Product, Variant, Watermarks};
    use chrono::{Duration, TimeZone};

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn product(id: &str, name: &str, at: DateTime<Utc>) -> Product {
        Product {
            id: id.into(),
            name: name.into(),
            category: None,
            updated_at: at,
        }
    }

    fn receipt(id: &str, at: DateTime<Utc>) -> MovementEvent {
        MovementEvent {
            id: id.into(),
            variant_id: "v1".into(),
            from_location_id: None,
            to_location_id: Some("A".into()),
            quantity: 1,
            timestamp: at,
            recorded_at: None,
            reference: None,
        }
    }

    fn cached() -> CacheSnapshot {
        let mut snapshot = CacheSnapshot::empty(t(1));
        snapshot.products = vec![product("p1", "Kurta", t(1)), product("p2", "Shawl", t(1))];
        snapshot.events = vec![receipt("e1", t(1))];
        snapshot.last_sync_watermark = Some(t(1));
        snapshot
    }

    #[test]
    fn test_changed_row_replaces_cached_row() {
        let delta = Delta::new(
            Some(t(1)),
            vec![product("p2", "Pashmina Shawl", t(3)), product("p3", "Dupatta", t(2))],
            vec![],
            vec![],
            vec![],
        );
        let (merged, stats) = merge(&cached(), &delta);

        assert_eq!(merged.products.len(), 3);
        assert_eq!(merged.products[1].name, "Pashmina Shawl");
        assert_eq!(merged.products[2].id, "p3");
        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(merged.last_sync_watermark, Some(t(3)));
        assert!(stats.watermark_advanced);
    }

    #[test]
    fn test_events_are_deduplicated_never_replaced() {
        let mut dup = receipt("e1", t(5));
        dup.quantity = 999;
        let delta = Delta::new(Some(t(1)), vec![], vec![], vec![], vec![dup, receipt("e2", t(2))]);
        let (merged, stats) = merge(&cached(), &delta);

        assert_eq!(merged.events.len(), 2);
        assert_eq!(merged.events[0].quantity, 1);
        assert_eq!(stats.events_appended, 1);
        assert_eq!(stats.events_skipped, 1);
    }

    #[test]
    fn test_merging_same_delta_twice_is_noop() {
        let delta = Delta::new(
            Some(t(1)),
            vec![product("p2", "Pashmina Shawl", t(3))],
            vec![],
            vec![],
            vec![receipt("e2", t(2))],
        );
        let (first, _) = merge(&cached(), &delta);
        let (second, stats) = merge(&first, &delta);

        assert_eq!(first, second);
        assert!(!stats.changed());
        assert!(!stats.watermark_advanced);
    }

    #[test]
    fn test_watermark_never_moves_backward() {
        let mut snapshot = cached();
        snapshot.last_sync_watermark = Some(t(9));
        snapshot.watermarks = Watermarks::uniform(Some(t(9)));
        let delta = Delta::new(Some(t(2)), vec![product("p1", "Kurta", t(4))], vec![], vec![], vec![]);
        let (merged, stats) = merge(&snapshot, &delta);
        assert_eq!(merged.last_sync_watermark, Some(t(9)));
        assert_eq!(merged.watermarks.products, Some(t(9)));
        assert!(!stats.watermark_advanced);

        assert_eq!(advance_watermark(None, Some(t(2))), Some(t(2)));
        assert_eq!(advance_watermark(Some(t(2)), None), Some(t(2)));
    }

    #[test]
    fn test_each_collection_keeps_its_own_watermark() {
        let mut snapshot = cached();
        snapshot.watermarks = Watermarks::uniform(Some(t(1)));
        // A future-dated event only moves the event window.
        let delta = Delta::new(Some(t(1)), vec![], vec![], vec![], vec![receipt("e2", t(20))]);
        let (merged, stats) = merge(&snapshot, &delta);

        assert!(stats.watermark_advanced);
        assert_eq!(merged.watermarks.events, Some(t(20)));
        assert_eq!(merged.watermarks.products, Some(t(1)));
        assert_eq!(merged.last_sync_watermark, Some(t(20)));
    }

    #[test]
    fn test_merge_keeps_captured_at() {
        let snapshot = cached();
        let delta = Delta::new(
            Some(t(1)),
            vec![],
            vec![Variant {
                id: "v1".into(),
                product_id: "p1".into(),
                size: Some("M".into()),
                color: None,
                code: "KRT-M".into(),
                updated_at: t(1) + Duration::minutes(5),
            }],
            vec![],
            vec![],
        );
        let (merged, _) = merge(&snapshot, &delta);
        assert_eq!(merged.captured_at, snapshot.captured_at);
        assert_eq!(merged.variants.len(), 1);
    }
}
