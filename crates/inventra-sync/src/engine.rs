//! # Inventory Sync Engine
//!
//! [`InventorySync`] is the one object the UI layer talks to. It owns the
//! cache store, mutation queue, conflict resolver and delta client, and it
//! decides when to serve, fetch, merge and commit.
//!
//! ## Sync Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sync()                                                                 │
//! │    snapshot fresh (age <= ttl, complete)? ──yes──► Fresh                │
//! │                      │ no                                               │
//! │                      ▼                                                  │
//! │  refresh()   generation += 1                                            │
//! │    watermarks known? ──no──► full load ──────────────┐                  │
//! │          │ yes                  ▲                    │                  │
//! │          ▼                      │ fetch failed       │                  │
//! │    fetch_delta(windows) ────────┘                    │                  │
//! │          │                                           ▼                  │
//! │          └──────────────────────────► ┌────────────────────────────┐    │
//! │                                       │ commit (one at a time)     │    │
//! │                                       │  generation moved? → drop  │    │
//! │                                       │  merge into last snapshot  │    │
//! │                                       │  reconcile with the queue  │    │
//! │                                       │  write cache, swap memory  │    │
//! │                                       └────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reads
//! `get_stock_view` never touches the network. It materializes the last
//! committed snapshot (memory, then cache), falls back to the partial view of
//! an in-progress first load, and finally to an empty view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::delta::{DeltaClient, FullLoad};
use crate::error::{SyncError, SyncResult};
use crate::loader::{LoadProgress, LoaderOptions};
use crate::queue::{DrainReport, MutationQueue, RetryPolicy};
use crate::realtime::{ChangeHandler, ChangeNotification};
use crate::remote::RemoteBackend;
use crate::resolver::ConflictResolver;
use inventra_core::delta::merge;
use inventra_core::ledger::materialize;
use inventra_core::{
    CacheSnapshot, Conflict, Delta, DeltaStats, MergeStats, NewMutation, QueuedMutation,
    ResolutionPolicy, StockPolicy, StockView, Watermarks,
};
use inventra_db::Database;

// =============================================================================
// Status & Outcomes
// =============================================================================

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SyncPhase {
    Idle,
    /// Full load in progress.
    Loading,
    /// Delta sync in progress.
    Syncing,
    /// Last full load stopped early; a partial snapshot is being served.
    Partial,
    Error,
}

/// Engine status for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub progress: Option<LoadProgress>,
    pub pending_mutations: i64,
    pub failed_mutations: i64,
    /// Open conflicts.
    pub conflicts: i64,
    pub last_error: Option<String>,
    #[ts(as = "Option<String>")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[ts(type = "number")]
    pub generation: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            phase: SyncPhase::Idle,
            progress: None,
            pending_mutations: 0,
            failed_mutations: 0,
            conflicts: 0,
            last_error: None,
            last_synced_at: None,
            generation: 0,
        }
    }
}

/// Result of a sync request.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The cached snapshot was fresh; nothing was fetched.
    Fresh,
    /// A delta was fetched and committed.
    Synced {
        stats: DeltaStats,
        merge: MergeStats,
        conflicts: usize,
    },
    /// A full load was committed.
    FullLoad { rows: usize, complete: bool },
    /// A newer sync started before this one could commit; its data was dropped.
    Superseded,
}

// =============================================================================
// Engine
// =============================================================================

struct Inner {
    cache: CacheStore,
    queue: MutationQueue,
    resolver: ConflictResolver,
    delta: DeltaClient,
    dataset: String,
    ttl: chrono::Duration,
    stock_policy: StockPolicy,

    generation: AtomicU64,
    /// Serializes merge + watermark advance + cache write.
    commit: Mutex<()>,
    /// Last committed snapshot.
    snapshot: RwLock<Option<CacheSnapshot>>,
    /// View rendered from a first full load still in progress.
    partial: StdMutex<Option<StockView>>,
    status: watch::Sender<SyncStatus>,
}

/// Offline-first inventory sync service. Cheap to clone.
#[derive(Clone)]
pub struct InventorySync {
    inner: Arc<Inner>,
}

impl InventorySync {
    /// Builds the engine over an open database and a remote backend.
    ///
    /// Interrupted deliveries are returned to the queue and the cached
    /// snapshot (if any) is loaded into memory.
    pub async fn new(
        db: &Database,
        backend: Arc<dyn RemoteBackend>,
        config: &SyncConfig,
    ) -> SyncResult<Self> {
        let queue = MutationQueue::open(
            db.mutations(),
            backend.clone(),
            RetryPolicy::from_config(config),
        )
        .await?;
        let resolver = ConflictResolver::new(
            db.conflicts(),
            db.mutations(),
            config.queue.conflict_policy,
        );
        let options = LoaderOptions {
            page_size: config.page_size(),
            concurrency: config.remote.concurrency,
            progress_every: config.remote.progress_every,
            total: None,
            request_timeout: config.request_timeout(),
        };

        let cache = CacheStore::new(db.cache());
        let dataset = config.cache.dataset.clone();
        let snapshot = cache.load(&dataset).await;
        if let Some(s) = &snapshot {
            info!(
                dataset = %dataset,
                rows = s.row_count(),
                captured_at = %s.captured_at,
                "Loaded cached snapshot"
            );
        }

        let (status, _) = watch::channel(SyncStatus::default());
        let engine = InventorySync {
            inner: Arc::new(Inner {
                cache,
                queue,
                resolver,
                delta: DeltaClient::new(backend, options),
                dataset,
                ttl: config.cache_ttl(),
                stock_policy: config.stock_policy(),
                generation: AtomicU64::new(0),
                commit: Mutex::new(()),
                snapshot: RwLock::new(snapshot),
                partial: StdMutex::new(None),
                status,
            }),
        };
        engine.refresh_counts().await?;
        Ok(engine)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current stock levels, served without waiting on the network.
    pub async fn get_stock_view(&self) -> StockView {
        let now = Utc::now();
        if let Some(snapshot) = self.current_snapshot().await {
            return self.view_of(&snapshot, now);
        }

        let partial = self
            .inner
            .partial
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        partial.unwrap_or_else(StockView::empty)
    }

    /// The last committed snapshot, if any.
    pub async fn snapshot(&self) -> Option<CacheSnapshot> {
        self.current_snapshot().await
    }

    /// Current sync generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn view_of(&self, snapshot: &CacheSnapshot, now: DateTime<Utc>) -> StockView {
        StockView {
            records: materialize(
                &snapshot.events,
                &snapshot.variants,
                &snapshot.locations,
                &self.inner.stock_policy,
            ),
            stale: !snapshot.complete || snapshot.is_stale(self.inner.ttl, now),
            complete: snapshot.complete,
            captured_at: Some(snapshot.captured_at),
        }
    }

    async fn current_snapshot(&self) -> Option<CacheSnapshot> {
        if let Some(snapshot) = self.inner.snapshot.read().await.as_ref() {
            return Some(snapshot.clone());
        }

        let loaded = self.inner.cache.load(&self.inner.dataset).await?;
        let mut slot = self.inner.snapshot.write().await;
        // A commit may have landed while the cache was being read.
        Some(slot.get_or_insert(loaded).clone())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Serves from cache when fresh, otherwise runs [`refresh`](Self::refresh).
    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        if let Some(snapshot) = self.current_snapshot().await {
            let fresh = snapshot.complete
                && snapshot.last_sync_watermark.is_some()
                && !snapshot.is_stale(self.inner.ttl, Utc::now());
            if fresh {
                debug!(captured_at = %snapshot.captured_at, "Snapshot fresh, skipping sync");
                return Ok(SyncOutcome::Fresh);
            }
        }
        self.refresh().await
    }

    /// Fetches remote changes now, regardless of snapshot age.
    ///
    /// Uses a delta from each collection's watermark when the snapshot has
    /// them and is complete; otherwise, or when the delta fetch fails, a
    /// full load.
    pub async fn refresh(&self) -> SyncResult<SyncOutcome> {
        let generation = self.begin(SyncPhase::Syncing);

        let windows = self
            .current_snapshot()
            .await
            .filter(|s| s.complete)
            .and_then(|s| s.delta_windows());

        let result = match windows {
            Some(windows) => match self.inner.delta.fetch_delta(&windows).await {
                Ok((delta, stats)) => self.commit_delta(generation, delta, stats).await,
                Err(e) => {
                    warn!(error = %e, "Delta fetch failed, falling back to full load");
                    self.set_phase(SyncPhase::Loading);
                    self.full_load(generation).await
                }
            },
            None => {
                self.set_phase(SyncPhase::Loading);
                self.full_load(generation).await
            }
        };

        self.finish(&result).await;
        result
    }

    /// Discards in-flight syncs and reloads everything.
    pub async fn force_resync(&self) -> SyncResult<SyncOutcome> {
        let generation = self.begin(SyncPhase::Loading);
        info!(generation, "Forced full resync");

        let result = self.full_load(generation).await;
        self.finish(&result).await;
        result
    }

    fn begin(&self, phase: SyncPhase) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.status.send_modify(|s| {
            s.phase = phase;
            s.progress = None;
            s.generation = generation;
        });
        generation
    }

    fn is_superseded(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) != generation
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.inner.status.send_modify(|s| s.phase = phase);
    }

    async fn commit_delta(
        &self,
        generation: u64,
        delta: Delta,
        stats: DeltaStats,
    ) -> SyncResult<SyncOutcome> {
        let _commit = self.inner.commit.lock().await;
        if self.is_superseded(generation) {
            info!(generation, "Discarding delta from superseded sync");
            return Ok(SyncOutcome::Superseded);
        }

        let now = Utc::now();
        let base = self
            .current_snapshot()
            .await
            .unwrap_or_else(|| CacheSnapshot::empty(now));
        let (mut merged, merge_stats) = merge(&base, &delta);
        let conflicts = self
            .inner
            .resolver
            .reconcile(&delta, &mut merged, now)
            .await?;
        merged.captured_at = now;

        self.store(merged).await?;

        info!(
            rows = stats.total(),
            inserted = merge_stats.inserted,
            replaced = merge_stats.replaced,
            events = merge_stats.events_appended,
            conflicts = conflicts.len(),
            "Delta committed"
        );
        Ok(SyncOutcome::Synced {
            stats,
            merge: merge_stats,
            conflicts: conflicts.len(),
        })
    }

    async fn full_load(&self, generation: u64) -> SyncResult<SyncOutcome> {
        let inner = &self.inner;
        let FullLoad { delta, stats, error } = inner
            .delta
            .full_load(|update| {
                if inner.generation.load(Ordering::SeqCst) == generation {
                    inner.status.send_modify(|s| s.progress = Some(update.progress));
                }
                if let Some(partial) = update.partial {
                    let view = StockView {
                        records: materialize(
                            &partial.events,
                            &partial.variants,
                            &partial.locations,
                            &inner.stock_policy,
                        ),
                        stale: true,
                        complete: false,
                        captured_at: None,
                    };
                    *inner.partial.lock().unwrap_or_else(|p| p.into_inner()) = Some(view);
                }
            })
            .await;

        let _commit = inner.commit.lock().await;
        if self.is_superseded(generation) {
            info!(generation, "Discarding full load from superseded sync");
            return Ok(SyncOutcome::Superseded);
        }

        let previous = self.current_snapshot().await;
        let now = Utc::now();
        let complete = error.is_none();

        if let Some(e) = error {
            if previous.is_some() {
                // Keep serving the last good snapshot.
                return Err(e);
            }
            inner.status.send_modify(|s| s.last_error = Some(e.to_string()));
        }

        let mut snapshot = CacheSnapshot {
            captured_at: now,
            last_sync_watermark: if complete { delta.fetched_at } else { None },
            watermarks: if complete { delta.watermarks } else { Watermarks::default() },
            complete,
            products: delta.products.clone(),
            variants: delta.variants.clone(),
            locations: delta.locations.clone(),
            events: delta.events.clone(),
        };
        if complete {
            inner.resolver.reconcile(&delta, &mut snapshot, now).await?;
        }
        self.store(snapshot).await?;
        *inner.partial.lock().unwrap_or_else(|p| p.into_inner()) = None;

        Ok(SyncOutcome::FullLoad {
            rows: stats.total(),
            complete,
        })
    }

    /// Writes a snapshot to the cache, then makes it the served one.
    async fn store(&self, snapshot: CacheSnapshot) -> SyncResult<()> {
        self.inner.cache.save(&self.inner.dataset, &snapshot).await?;
        *self.inner.snapshot.write().await = Some(snapshot);
        Ok(())
    }

    async fn finish(&self, result: &SyncResult<SyncOutcome>) {
        let now = Utc::now();
        self.inner.status.send_modify(|s| match result {
            Ok(SyncOutcome::Superseded) | Ok(SyncOutcome::Fresh) => {}
            Ok(SyncOutcome::FullLoad { complete: false, .. }) => {
                s.phase = SyncPhase::Partial;
                s.progress = None;
            }
            Ok(_) => {
                s.phase = SyncPhase::Idle;
                s.progress = None;
                s.last_error = None;
                s.last_synced_at = Some(now);
            }
            Err(e) => {
                s.phase = SyncPhase::Error;
                s.progress = None;
                s.last_error = Some(e.to_string());
            }
        });
        if let Err(e) = self.refresh_counts().await {
            warn!(error = %e, "Failed to refresh queue counts");
        }
    }

    // =========================================================================
    // Local Changes
    // =========================================================================

    /// Queues a local change, based on its collection's current watermark.
    pub async fn queue_local_change(&self, mutation: NewMutation) -> SyncResult<QueuedMutation> {
        let base = self
            .current_snapshot()
            .await
            .and_then(|s| s.watermark_for(mutation.target.kind));
        let queued = self.inner.queue.enqueue(mutation, base).await?;
        self.refresh_counts().await?;
        Ok(queued)
    }

    /// Delivers queued changes.
    ///
    /// Entities with an open conflict are held back; conflicts reported by
    /// the remote go to the resolver.
    pub async fn drain_mutations(&self) -> SyncResult<DrainReport> {
        let held = self.inner.resolver.held_entities().await?;
        let report = self.inner.queue.drain(&held).await?;

        let reported: Vec<(QueuedMutation, String)> = report
            .conflicts()
            .map(|(m, message)| (m.clone(), message.to_string()))
            .collect();
        if !reported.is_empty() {
            let _commit = self.inner.commit.lock().await;
            let now = Utc::now();
            let existing = self.current_snapshot().await;
            let had_snapshot = existing.is_some();
            let mut snapshot = existing.unwrap_or_else(|| CacheSnapshot::empty(now));

            for (mutation, message) in &reported {
                self.inner
                    .resolver
                    .route_remote_conflict(mutation, message, &mut snapshot, now)
                    .await?;
            }
            if had_snapshot {
                self.store(snapshot).await?;
            }
        }

        if let Some(reason) = &report.halted {
            self.inner
                .status
                .send_modify(|s| s.last_error = Some(reason.clone()));
        }
        self.refresh_counts().await?;
        Ok(report)
    }

    /// Closes an open conflict with `policy`.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        policy: ResolutionPolicy,
    ) -> SyncResult<Conflict> {
        let _commit = self.inner.commit.lock().await;
        let now = Utc::now();
        let existing = self.current_snapshot().await;
        let had_snapshot = existing.is_some();
        let mut snapshot = existing.unwrap_or_else(|| CacheSnapshot::empty(now));

        let resolved = self
            .inner
            .resolver
            .resolve_conflict(conflict_id, policy, &mut snapshot, now)
            .await?;
        if had_snapshot {
            self.store(snapshot).await?;
        }
        self.refresh_counts().await?;
        Ok(resolved)
    }

    pub async fn open_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        self.inner.resolver.open_conflicts().await
    }

    /// Mutations that will not be retried.
    pub async fn failed_mutations(&self) -> SyncResult<Vec<QueuedMutation>> {
        self.inner.queue.failed().await
    }

    /// Removes delivered mutations from the queue.
    pub async fn prune_synced(&self) -> SyncResult<u64> {
        self.inner.queue.prune().await
    }

    // =========================================================================
    // Realtime
    // =========================================================================

    /// Re-fetches what a change notification names: the one entity when it
    /// carries an id, otherwise its collection since that collection's mark.
    ///
    /// Merged rows show up immediately, but the watermarks are left alone so
    /// the next delta still covers the whole window.
    pub async fn apply_change(&self, notification: &ChangeNotification) -> SyncResult<MergeStats> {
        let Some(kind) = notification.kind() else {
            debug!(collection = %notification.collection, "Ignoring change to unsynced collection");
            return Ok(MergeStats::default());
        };

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let Some(current) = self.current_snapshot().await else {
            debug!("No snapshot yet, leaving change to the first sync");
            return Ok(MergeStats::default());
        };

        let (delta, _) = match notification.target() {
            Some(target) => self.inner.delta.fetch_entity(&target).await?,
            None => {
                self.inner
                    .delta
                    .fetch_collection(kind, current.watermark_for(kind))
                    .await?
            }
        };
        let delta = delta.without_watermarks();

        let _commit = self.inner.commit.lock().await;
        if self.is_superseded(generation) {
            debug!("Sync ran during scoped fetch, dropping its rows");
            return Ok(MergeStats::default());
        }

        let now = Utc::now();
        let base = self
            .current_snapshot()
            .await
            .unwrap_or_else(|| CacheSnapshot::empty(now));
        let (mut merged, stats) = merge(&base, &delta);
        if !stats.changed() {
            return Ok(stats);
        }
        self.inner.resolver.reconcile(&delta, &mut merged, now).await?;
        self.store(merged).await?;

        debug!(
            collection = kind.collection(),
            inserted = stats.inserted,
            replaced = stats.replaced,
            events = stats.events_appended,
            "Applied change notification"
        );
        Ok(stats)
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Status with fresh queue and conflict counts.
    pub async fn sync_status(&self) -> SyncResult<SyncStatus> {
        self.refresh_counts().await?;
        Ok(self.inner.status.borrow().clone())
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    async fn refresh_counts(&self) -> SyncResult<()> {
        let stats = self.inner.queue.stats().await?;
        let conflicts = self.inner.resolver.open_count().await?;
        self.inner.status.send_modify(|s| {
            s.pending_mutations = stats.outstanding();
            s.failed_mutations = stats.failed;
            s.conflicts = conflicts;
        });
        Ok(())
    }

    // =========================================================================
    // Background Loop
    // =========================================================================

    /// Runs drain + refresh every `interval` until the handle shuts it down.
    pub fn spawn(&self, interval: Duration) -> EngineHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let engine = self.clone();

        let task = tokio::spawn(async move {
            info!(?interval, "Sync loop starting");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.tick().await,
                    _ = shutdown_rx.recv() => {
                        info!("Sync loop received shutdown");
                        break;
                    }
                }
            }
        });

        EngineHandle {
            shutdown_tx,
            task,
            status: self.watch_status(),
        }
    }

    async fn tick(&self) {
        match self.drain_mutations().await {
            Ok(report) if !report.outcomes.is_empty() => {
                debug!(delivered = report.delivered(), "Tick drained queue");
            }
            Ok(_) => {}
            Err(SyncError::DrainInProgress) => debug!("Drain already running"),
            Err(e) => warn!(error = %e, "Queue drain failed"),
        }

        match self.refresh().await {
            Ok(outcome) => debug!(?outcome, "Tick sync finished"),
            Err(e) if e.is_retryable() => warn!(error = %e, "Sync failed, will retry next tick"),
            Err(e) => error!(error = %e, kind = e.kind(), "Sync failed"),
        }
    }
}

#[async_trait]
impl ChangeHandler for InventorySync {
    async fn on_change(&self, notification: &ChangeNotification) -> SyncResult<()> {
        self.apply_change(notification).await.map(|_| ())
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Controls a background sync loop started by [`InventorySync::spawn`].
pub struct EngineHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
    status: watch::Receiver<SyncStatus>,
}

impl EngineHandle {
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stops the loop after the current tick and waits for it.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("sync loop failed: {e}")))
    }
}
