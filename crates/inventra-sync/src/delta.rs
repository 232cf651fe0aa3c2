//! # Delta Client
//!
//! Fetches what changed remotely and hands typed rows to the pure merge in
//! `inventra_core::delta`.
//!
//! ## Fetch Paths
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │ fetch_delta(windows)      every collection, rows changed >= its own     │
//! │                           window start; any failed page → Err           │
//! │                                                                          │
//! │ fetch_entity(target)      one row by key (realtime notifications)       │
//! │ fetch_collection(k, since) one collection, when no key was given        │
//! │                           caller merges without moving the watermarks   │
//! │                                                                          │
//! │ full_load(observer)       every row of every collection, paged by       │
//! │                           count; partial results are returned flagged   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collections load in dependency order (products, variants, locations,
//! events) so a partial full load can already render stock for the variants
//! and locations it has.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::loader::{load_all, Completeness, LoadProgress, LoadReport, LoaderOptions};
use crate::remote::RemoteBackend;
use inventra_core::rows::{decode_rows, RemoteRow};
use inventra_core::{
    Delta, DeltaStats, EntityKind, EntityRef, Location, MovementEvent, Product, Variant,
    Watermarks,
};

/// Rows decoded so far during a full load.
#[derive(Debug, Default)]
pub struct PartialDataset {
    pub variants: Vec<Variant>,
    pub locations: Vec<Location>,
    pub events: Vec<MovementEvent>,
}

/// Progress notification from a full load.
#[derive(Debug)]
pub struct LoadUpdate<'a> {
    pub kind: EntityKind,
    pub progress: LoadProgress,
    /// Set when enough event rows have arrived to render a partial view.
    pub partial: Option<&'a PartialDataset>,
}

/// Result of a full load.
#[derive(Debug)]
pub struct FullLoad {
    /// Every row obtained. `fetched_at` is the high-water mark of the rows.
    pub delta: Delta,
    pub stats: DeltaStats,
    /// `None` when every collection loaded completely.
    pub error: Option<SyncError>,
}

impl FullLoad {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Reads remote changes page by page.
#[derive(Clone)]
pub struct DeltaClient {
    backend: Arc<dyn RemoteBackend>,
    options: LoaderOptions,
}

impl DeltaClient {
    pub fn new(backend: Arc<dyn RemoteBackend>, options: LoaderOptions) -> Self {
        DeltaClient { backend, options }
    }

    /// Fetches rows changed at or after each collection's window start.
    ///
    /// A collection without a window is read in full.
    ///
    /// ## Errors
    /// Any page failure or malformed row fails the whole delta.
    pub async fn fetch_delta(&self, windows: &Watermarks) -> SyncResult<(Delta, DeltaStats)> {
        let mut products = Vec::new();
        let mut variants = Vec::new();
        let mut locations = Vec::new();
        let mut events = Vec::new();
        let requests = self.scoped(windows.products, &mut products).await?
            + self.scoped(windows.variants, &mut variants).await?
            + self.scoped(windows.locations, &mut locations).await?
            + self.scoped(windows.events, &mut events).await?;

        let delta = Delta::windowed(*windows, products, variants, locations, events);
        let stats = DeltaStats::for_delta(&delta, requests);

        info!(
            since = ?delta.since,
            rows = stats.total(),
            requests = stats.requests,
            fetched_at = ?delta.fetched_at,
            "Delta fetched"
        );
        Ok((delta, stats))
    }

    /// Re-reads a single entity by key.
    ///
    /// The delta carries no watermarks; a missing row yields an empty delta.
    pub async fn fetch_entity(&self, target: &EntityRef) -> SyncResult<(Delta, DeltaStats)> {
        let row = self.backend.fetch_one(target.kind, &target.id).await?;
        let mut delta = Delta::default();
        match target.kind {
            EntityKind::Product => decode_one(row, &mut delta.products)?,
            EntityKind::Variant => decode_one(row, &mut delta.variants)?,
            EntityKind::Location => decode_one(row, &mut delta.locations)?,
            EntityKind::Event => decode_one(row, &mut delta.events)?,
        }

        let stats = DeltaStats::for_delta(&delta, 1);
        debug!(entity = %target, found = !delta.is_empty(), "Entity fetched");
        Ok((delta, stats))
    }

    /// Fetches one collection's changes since `since` (all rows when `None`).
    pub async fn fetch_collection(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<(Delta, DeltaStats)> {
        let mut delta = Delta {
            since,
            ..Default::default()
        };

        let requests = match kind {
            EntityKind::Product => self.scoped(since, &mut delta.products).await?,
            EntityKind::Variant => self.scoped(since, &mut delta.variants).await?,
            EntityKind::Location => self.scoped(since, &mut delta.locations).await?,
            EntityKind::Event => self.scoped(since, &mut delta.events).await?,
        };
        delta.fetched_at = delta.high_water().or(since);

        let stats = DeltaStats::for_delta(&delta, requests);
        debug!(collection = kind.collection(), rows = stats.total(), "Collection fetched");
        Ok((delta, stats))
    }

    /// Loads every row of every collection.
    ///
    /// Stops at the first collection that fails; rows already decoded are
    /// kept and the result is flagged with the error.
    pub async fn full_load<O>(&self, mut observer: O) -> FullLoad
    where
        O: FnMut(LoadUpdate<'_>),
    {
        let mut partial = PartialDataset::default();
        let mut products: Vec<Product> = Vec::new();
        let mut requests = 0;
        let mut error = None;

        for kind in EntityKind::ALL {
            let total = match self.backend.count(kind).await {
                Ok(total) => total,
                Err(e) => {
                    warn!(collection = kind.collection(), error = %e, "Count failed, paging blind");
                    None
                }
            };
            let options = self.options.clone().with_total(total);

            let report = {
                let backend = &self.backend;
                let fetch = move |offset, limit| backend.fetch_page(kind, offset, limit);
                let reference = &partial;
                load_all(fetch, &options, |progress, rows| {
                    // Events are the only collection worth rendering mid-load.
                    let events = match (kind, rows) {
                        (EntityKind::Event, Some(rows)) => {
                            decode_rows::<MovementEvent>(rows.to_vec(), 0).ok()
                        }
                        _ => None,
                    };
                    match events {
                        Some(events) => {
                            let view = PartialDataset {
                                variants: reference.variants.clone(),
                                locations: reference.locations.clone(),
                                events,
                            };
                            observer(LoadUpdate {
                                kind,
                                progress,
                                partial: Some(&view),
                            });
                        }
                        None => observer(LoadUpdate {
                            kind,
                            progress,
                            partial: None,
                        }),
                    }
                })
                .await
            };
            requests += report.requests;

            let LoadReport { rows, completeness, .. } = report;
            let decoded = match kind {
                EntityKind::Product => decode_rows(rows, 0).map(|r| products = r),
                EntityKind::Variant => decode_rows(rows, 0).map(|r| partial.variants = r),
                EntityKind::Location => decode_rows(rows, 0).map(|r| partial.locations = r),
                EntityKind::Event => decode_rows(rows, 0).map(|r| partial.events = r),
            };

            if let Err(e) = decoded {
                error = Some(e.into());
                break;
            }
            if let Completeness::Partial(e) = completeness {
                error = Some(e);
                break;
            }
        }

        let delta = Delta::new(None, products, partial.variants, partial.locations, partial.events);
        let stats = DeltaStats::for_delta(&delta, requests);

        match &error {
            None => info!(rows = stats.total(), requests, "Full load complete"),
            Some(e) => warn!(rows = stats.total(), requests, error = %e, "Full load partial"),
        }

        FullLoad { delta, stats, error }
    }

    /// Pages one collection's changes and decodes them.
    async fn changed<T: RemoteRow>(&self, since: DateTime<Utc>) -> SyncResult<(Vec<T>, usize)> {
        let backend = &self.backend;
        let fetch = move |offset, limit| backend.fetch_changed(T::KIND, since, offset, limit);
        let report = load_all(fetch, &self.options, |_, _| {}).await;
        let (rows, requests) = report.into_complete()?;
        Ok((decode_rows(rows, 0)?, requests))
    }

    async fn scoped<T: RemoteRow>(
        &self,
        since: Option<DateTime<Utc>>,
        out: &mut Vec<T>,
    ) -> SyncResult<usize> {
        match since {
            Some(since) => {
                let (rows, requests) = self.changed::<T>(since).await?;
                *out = rows;
                Ok(requests)
            }
            None => {
                let backend = &self.backend;
                let fetch = move |offset, limit| backend.fetch_page(T::KIND, offset, limit);
                let report = load_all(fetch, &self.options, |_, _| {}).await;
                let (rows, requests): (Vec<Value>, usize) = report.into_complete()?;
                *out = decode_rows(rows, 0)?;
                Ok(requests)
            }
        }
    }
}

fn decode_one<T: RemoteRow>(row: Option<Value>, out: &mut Vec<T>) -> SyncResult<()> {
    *out = decode_rows(row.into_iter().collect(), 0)?;
    Ok(())
}
