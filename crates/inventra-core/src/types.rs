//! # Domain Types
//!
//! Core domain types used throughout the inventory sync engine.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  REFERENCE DATA (remote, row-level last-write-wins)                    │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Product      │◄──│    Variant      │   │    Location     │       │
//! │  │  id, name       │   │  id, code (SKU) │   │  id, code, kind │       │
//! │  │  category       │   │  size, color    │   │  store | godown │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  LEDGER (remote, append-only)        DERIVED (never stored as truth)   │
//! │  ┌─────────────────┐                 ┌─────────────────┐               │
//! │  │ MovementEvent   │ ── materialize ►│  StockRecord    │               │
//! │  │ from? → to?     │                 │ (variant, loc)  │               │
//! │  │ quantity        │                 │ quantity,status │               │
//! │  └─────────────────┘                 └─────────────────┘               │
//! │                                                                         │
//! │  LOCAL ONLY (owned by the engine)                                      │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ CacheSnapshot   │   │ QueuedMutation  │   │    Conflict     │       │
//! │  │ rows+watermark  │   │ status, retries │   │ local vs remote │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;
use uuid::Uuid;

use crate::error::CoreError;

// =============================================================================
// Keyed rows
// =============================================================================

/// A remote row with a primary key and a change timestamp.
///
/// Merge and conflict detection work on any collection through this trait.
pub trait Keyed {
    /// Primary key.
    fn key(&self) -> &str;

    /// When the row last changed on the server (insertion time for events).
    fn changed_at(&self) -> DateTime<Utc>;
}

// =============================================================================
// Entity Kind / Reference
// =============================================================================

/// The remote collections the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Variant,
    Location,
    Event,
}

impl EntityKind {
    /// All kinds, in the order a full load fetches them.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Product,
        EntityKind::Variant,
        EntityKind::Location,
        EntityKind::Event,
    ];

    /// Remote collection name.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Product => "products",
            EntityKind::Variant => "variants",
            EntityKind::Location => "locations",
            EntityKind::Event => "stock_movements",
        }
    }

    /// Stable lowercase name (storage / logs).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Variant => "variant",
            EntityKind::Location => "location",
            EntityKind::Event => "event",
        }
    }

    /// Looks a kind up by remote collection name.
    pub fn from_collection(name: &str) -> Option<Self> {
        EntityKind::ALL.into_iter().find(|k| k.collection() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" | "products" => Ok(EntityKind::Product),
            "variant" | "variants" => Ok(EntityKind::Variant),
            "location" | "locations" => Ok(EntityKind::Location),
            "event" | "stock_movements" => Ok(EntityKind::Event),
            other => Err(CoreError::UnknownVariant {
                kind: "entity kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Identity of a single remote entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        EntityRef {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// =============================================================================
// Reference Data
// =============================================================================

/// A product (reference data, rarely mutated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A sellable variant of a product (the SKU).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub product_id: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    /// SKU code - the stable business key used by the remote upsert path.
    pub code: String,
    pub updated_at: DateTime<Utc>,
}

/// Kind of stock location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    /// Retail floor.
    Store,
    /// Warehouse / back stock.
    Godown,
}

/// A stock location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub code: String,
    pub name: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: LocationKind,
    pub updated_at: DateTime<Utc>,
}

impl Keyed for Product {
    fn key(&self) -> &str {
        &self.id
    }
    fn changed_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Keyed for Variant {
    fn key(&self) -> &str {
        &self.id
    }
    fn changed_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Keyed for Location {
    fn key(&self) -> &str {
        &self.id
    }
    fn changed_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

// =============================================================================
// Movement Event (the ledger)
// =============================================================================

/// An immutable stock movement.
///
/// ## Semantics
/// ```text
/// from = None, to = A     →  receipt into A        (+qty at A)
/// from = A,    to = B     →  transfer A → B        (-qty at A, +qty at B)
/// from = A,    to = None  →  sale / write-off at A (-qty at A)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementEvent {
    pub id: String,
    pub variant_id: String,
    #[serde(default)]
    pub from_location_id: Option<String>,
    #[serde(default)]
    pub to_location_id: Option<String>,
    /// Units moved. Always positive; direction comes from from/to.
    pub quantity: i64,
    /// When the movement happened. Set by the terminal that recorded it, so
    /// an event queued offline can carry a timestamp older than events the
    /// server already holds.
    pub timestamp: DateTime<Utc>,
    /// When the server stored the event (`created_at`). Assigned remotely and
    /// monotonic in insertion order; `None` until the event has been uploaded.
    #[serde(rename = "created_at", default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    /// External reference (sale id, transfer note, import batch).
    #[serde(default)]
    pub reference: Option<String>,
}

impl Keyed for MovementEvent {
    fn key(&self) -> &str {
        &self.id
    }
    /// Server insertion time, so delta windows follow upload order rather
    /// than business time.
    fn changed_at(&self) -> DateTime<Utc> {
        self.recorded_at.unwrap_or(self.timestamp)
    }
}

// =============================================================================
// Stock Record (derived)
// =============================================================================

/// Stock health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    /// Quantity is zero or negative.
    OutOfStock,
    /// At or below the low-stock threshold.
    Low,
    Healthy,
}

/// Derived stock level for one (variant, location) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockRecord {
    pub variant_id: String,
    pub location_id: String,
    pub quantity: i64,
    pub status: StockStatus,
}

/// Stock view handed to the UI layer.
///
/// `stale` is set when the snapshot is older than the cache TTL or when no
/// sync has ever succeeded; `complete` is false when the dataset behind it was
/// only partially loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockView {
    pub records: Vec<StockRecord>,
    pub stale: bool,
    pub complete: bool,
    #[ts(as = "Option<String>")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl StockView {
    /// View with nothing to show yet.
    pub fn empty() -> Self {
        StockView {
            records: Vec::new(),
            stale: true,
            complete: false,
            captured_at: None,
        }
    }
}

// =============================================================================
// Watermarks
// =============================================================================

/// Per-collection high-water marks of server change stamps.
///
/// Each collection advances on its own column, so one collection's clock
/// (or one future-dated row) never hides changes in another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    #[serde(default)]
    pub products: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variants: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locations: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Option<DateTime<Utc>>,
}

impl Watermarks {
    /// The same mark for every collection.
    pub fn uniform(at: Option<DateTime<Utc>>) -> Self {
        Watermarks {
            products: at,
            variants: at,
            locations: at,
            events: at,
        }
    }

    pub fn get(&self, kind: EntityKind) -> Option<DateTime<Utc>> {
        match kind {
            EntityKind::Product => self.products,
            EntityKind::Variant => self.variants,
            EntityKind::Location => self.locations,
            EntityKind::Event => self.events,
        }
    }

    fn slot(&mut self, kind: EntityKind) -> &mut Option<DateTime<Utc>> {
        match kind {
            EntityKind::Product => &mut self.products,
            EntityKind::Variant => &mut self.variants,
            EntityKind::Location => &mut self.locations,
            EntityKind::Event => &mut self.events,
        }
    }

    /// Moves one collection's mark to `candidate` if that is later.
    pub fn advance(&mut self, kind: EntityKind, candidate: Option<DateTime<Utc>>) {
        let slot = self.slot(kind);
        *slot = match (*slot, candidate) {
            (Some(c), Some(n)) => Some(c.max(n)),
            (c, n) => c.or(n),
        };
    }

    /// Per-collection maximum of two sets of marks.
    pub fn merged(&self, other: &Watermarks) -> Watermarks {
        let mut next = *self;
        for kind in EntityKind::ALL {
            next.advance(kind, other.get(kind));
        }
        next
    }

    /// Fills collections without a mark from `fallback`.
    pub fn or(&self, fallback: Option<DateTime<Utc>>) -> Watermarks {
        let mut next = *self;
        for kind in EntityKind::ALL {
            let slot = next.slot(kind);
            *slot = slot.or(fallback);
        }
        next
    }

    pub fn is_empty(&self) -> bool {
        EntityKind::ALL.iter().all(|k| self.get(*k).is_none())
    }

    /// Oldest mark across collections.
    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        EntityKind::ALL.iter().filter_map(|k| self.get(*k)).min()
    }

    /// Newest mark across collections.
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        EntityKind::ALL.iter().filter_map(|k| self.get(*k)).max()
    }
}

// =============================================================================
// Cache Snapshot
// =============================================================================

/// The locally cached dataset.
///
/// Owned by the cache store; superseded atomically on every successful sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub products: Vec<Product>,
    pub variants: Vec<Variant>,
    pub locations: Vec<Location>,
    pub events: Vec<MovementEvent>,
    pub captured_at: DateTime<Utc>,
    /// Newest server change stamp merged so far, across all collections.
    pub last_sync_watermark: Option<DateTime<Utc>>,
    /// Where each collection's next delta window starts.
    #[serde(default)]
    pub watermarks: Watermarks,
    /// False when a full load stopped early.
    #[serde(default = "default_complete")]
    pub complete: bool,
}

fn default_complete() -> bool {
    true
}

impl CacheSnapshot {
    /// An empty snapshot that has never been synced.
    pub fn empty(now: DateTime<Utc>) -> Self {
        CacheSnapshot {
            products: Vec::new(),
            variants: Vec::new(),
            locations: Vec::new(),
            events: Vec::new(),
            captured_at: now,
            last_sync_watermark: None,
            watermarks: Watermarks::default(),
            complete: true,
        }
    }

    /// Delta window start for one collection.
    ///
    /// Snapshots written before per-collection marks existed fall back to
    /// the overall watermark.
    pub fn watermark_for(&self, kind: EntityKind) -> Option<DateTime<Utc>> {
        self.watermarks.get(kind).or(self.last_sync_watermark)
    }

    /// Delta window starts for every collection, or `None` if never synced.
    pub fn delta_windows(&self) -> Option<Watermarks> {
        let windows = self.watermarks.or(self.last_sync_watermark);
        EntityKind::ALL
            .iter()
            .all(|k| windows.get(*k).is_some())
            .then_some(windows)
    }

    /// Returns true if `now - captured_at > ttl`.
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.captured_at) > ttl
    }

    /// Total rows across all collections.
    pub fn row_count(&self) -> usize {
        self.products.len() + self.variants.len() + self.locations.len() + self.events.len()
    }

    /// Returns the cached row for an entity as JSON (for conflict audit).
    pub fn entity_json(&self, target: &EntityRef) -> Option<Value> {
        fn find<T: Keyed + Serialize>(rows: &[T], id: &str) -> Option<Value> {
            rows.iter()
                .find(|r| r.key() == id)
                .and_then(|r| serde_json::to_value(r).ok())
        }

        match target.kind {
            EntityKind::Product => find(&self.products, &target.id),
            EntityKind::Variant => find(&self.variants, &target.id),
            EntityKind::Location => find(&self.locations, &target.id),
            EntityKind::Event => find(&self.events, &target.id),
        }
    }
}

// =============================================================================
// Queued Mutation
// =============================================================================

/// What a queued mutation does remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    /// Idempotent upsert of a reference row, keyed by its business key.
    Upsert,
    /// Append a new movement event (never conflicts).
    AppendEvent,
}

/// Delivery status of a queued mutation.
///
/// ## Transitions
/// ```text
///            claim                ack
/// Pending ─────────► Syncing ─────────► Synced   (terminal)
///    ▲                  │
///    └──── retryable ───┤
///                       └── ceiling / validation ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl MutationStatus {
    /// Returns true if the status change is allowed.
    pub fn can_transition_to(&self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing) | (Pending, Failed) | (Syncing, Synced) | (Syncing, Pending) | (Syncing, Failed)
        )
    }

    /// Not yet delivered with effect.
    pub fn is_unsynced(&self) -> bool {
        matches!(self, MutationStatus::Pending | MutationStatus::Syncing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Syncing => "syncing",
            MutationStatus::Synced => "synced",
            MutationStatus::Failed => "failed",
        }
    }
}

impl Default for MutationStatus {
    fn default() -> Self {
        MutationStatus::Pending
    }
}

/// A local write waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    /// Stable key the remote uses to drop duplicate deliveries.
    pub idempotency_key: String,
    pub target: EntityRef,
    pub op: MutationOp,
    /// Full row (upsert) or event body (append).
    pub payload: Value,
    /// Field-level granularity. `None` means the whole entity.
    pub fields: Option<Vec<String>>,
    pub status: MutationStatus,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    /// Watermark of the snapshot the change was made against.
    pub base_watermark: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A local write as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMutation {
    pub target: EntityRef,
    pub op: MutationOp,
    pub payload: Value,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Caller-supplied idempotency key; generated when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NewMutation {
    /// Whole-entity upsert.
    pub fn upsert(target: EntityRef, payload: Value) -> Self {
        NewMutation {
            target,
            op: MutationOp::Upsert,
            payload,
            fields: None,
            idempotency_key: None,
        }
    }

    /// Append a movement event.
    pub fn append_event(event: &MovementEvent) -> Self {
        NewMutation {
            target: EntityRef::new(EntityKind::Event, event.id.clone()),
            op: MutationOp::AppendEvent,
            payload: serde_json::to_value(event).unwrap_or(Value::Null),
            fields: None,
            idempotency_key: Some(format!("event:{}", event.id)),
        }
    }

    /// Restricts conflict detection to the listed fields.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Sets an explicit idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Stamps the mutation for the queue.
    pub fn into_queued(
        self,
        base_watermark: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QueuedMutation {
        let id = Uuid::new_v4().to_string();
        QueuedMutation {
            idempotency_key: self.idempotency_key.unwrap_or_else(|| id.clone()),
            id,
            target: self.target,
            op: self.op,
            payload: self.payload,
            fields: self.fields,
            status: MutationStatus::Pending,
            attempt_count: 0,
            last_error: None,
            base_watermark,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Queue counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    pub failed: i64,
}

impl QueueStats {
    /// Entries not yet delivered.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.syncing
    }
}

// =============================================================================
// Conflict
// =============================================================================

/// Recorded outcome of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLocal,
    KeepRemote,
    Merged,
    Unresolved,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::KeepLocal => "keep_local",
            ConflictResolution::KeepRemote => "keep_remote",
            ConflictResolution::Merged => "merged",
            ConflictResolution::Unresolved => "unresolved",
        }
    }
}

/// Policy applied to a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Re-apply the queued change over the remote value.
    KeepLocal,
    /// Discard the queued change.
    KeepRemote,
    /// Leave for the operator.
    #[default]
    Manual,
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionPolicy::KeepLocal => write!(f, "keep_local"),
            ResolutionPolicy::KeepRemote => write!(f, "keep_remote"),
            ResolutionPolicy::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for ResolutionPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep_local" | "local" => Ok(ResolutionPolicy::KeepLocal),
            "keep_remote" | "remote" => Ok(ResolutionPolicy::KeepRemote),
            "manual" => Ok(ResolutionPolicy::Manual),
            other => Err(CoreError::UnknownVariant {
                kind: "resolution policy",
                value: other.to_string(),
            }),
        }
    }
}

/// A divergence between a queued local change and a remote change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub target: EntityRef,
    pub mutation_id: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub detected_at: DateTime<Utc>,
    pub resolution: ConflictResolution,
    pub resolved_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        self.resolution == ConflictResolution::Unresolved
    }
}

// =============================================================================
// Delta
// =============================================================================

/// Rows changed remotely at or after each collection's window start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Earliest window start among the fetched collections.
    pub since: Option<DateTime<Utc>>,
    /// Server-side high-water mark of the rows in this delta.
    pub fetched_at: Option<DateTime<Utc>>,
    /// Per-collection high-water marks (window start when a collection
    /// returned nothing).
    #[serde(default)]
    pub watermarks: Watermarks,
    pub products: Vec<Product>,
    pub variants: Vec<Variant>,
    pub locations: Vec<Location>,
    pub events: Vec<MovementEvent>,
}

impl Delta {
    /// Builds a delta whose collections were all fetched from `since`.
    pub fn new(
        since: Option<DateTime<Utc>>,
        products: Vec<Product>,
        variants: Vec<Variant>,
        locations: Vec<Location>,
        events: Vec<MovementEvent>,
    ) -> Self {
        Self::windowed(Watermarks::uniform(since), products, variants, locations, events)
    }

    /// Builds a delta fetched from per-collection window starts and derives
    /// its high-water marks from the rows.
    pub fn windowed(
        since: Watermarks,
        products: Vec<Product>,
        variants: Vec<Variant>,
        locations: Vec<Location>,
        events: Vec<MovementEvent>,
    ) -> Self {
        let mut delta = Delta {
            since: since.earliest(),
            fetched_at: None,
            watermarks: Watermarks::default(),
            products,
            variants,
            locations,
            events,
        };
        delta.watermarks = since.merged(&delta.row_marks());
        delta.fetched_at = delta.high_water().or(since.latest());
        delta
    }

    /// Latest change timestamp among all rows.
    pub fn high_water(&self) -> Option<DateTime<Utc>> {
        self.row_marks().latest()
    }

    /// Latest change timestamp per collection.
    pub fn row_marks(&self) -> Watermarks {
        fn max_of<T: Keyed>(rows: &[T]) -> Option<DateTime<Utc>> {
            rows.iter().map(Keyed::changed_at).max()
        }
        Watermarks {
            products: max_of(&self.products),
            variants: max_of(&self.variants),
            locations: max_of(&self.locations),
            events: max_of(&self.events),
        }
    }

    /// Drops the high-water marks so merging moves no watermark.
    pub fn without_watermarks(mut self) -> Self {
        self.fetched_at = None;
        self.watermarks = Watermarks::default();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
            && self.variants.is_empty()
            && self.locations.is_empty()
            && self.events.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.products.len() + self.variants.len() + self.locations.len() + self.events.len()
    }

    /// The changed row for an entity, as JSON, with its change timestamp.
    pub fn changed_entity(&self, target: &EntityRef) -> Option<(Value, DateTime<Utc>)> {
        fn find<T: Keyed + Serialize>(rows: &[T], id: &str) -> Option<(Value, DateTime<Utc>)> {
            // Last occurrence wins if the remote returned a row twice.
            rows.iter()
                .rev()
                .find(|r| r.key() == id)
                .and_then(|r| serde_json::to_value(r).ok().map(|v| (v, r.changed_at())))
        }

        match target.kind {
            EntityKind::Product => find(&self.products, &target.id),
            EntityKind::Variant => find(&self.variants, &target.id),
            EntityKind::Location => find(&self.locations, &target.id),
            EntityKind::Event => find(&self.events, &target.id),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_entity_kind_parsing() {
        assert_eq!("variant".parse::<EntityKind>().unwrap(), EntityKind::Variant);
        assert_eq!("stock_movements".parse::<EntityKind>().unwrap(), EntityKind::Event);
        assert!("sale".parse::<EntityKind>().is_err());
        assert_eq!(EntityKind::from_collection("locations"), Some(EntityKind::Location));
    }

    #[test]
    fn test_status_transitions_never_leave_synced() {
        use MutationStatus::*;
        for next in [Pending, Syncing, Synced, Failed] {
            assert!(!Synced.can_transition_to(next));
        }
        assert!(Syncing.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Synced));
    }

    #[test]
    fn test_snapshot_staleness() {
        let snapshot = CacheSnapshot::empty(at(0));
        assert!(!snapshot.is_stale(Duration::hours(24), at(23)));
        assert!(snapshot.is_stale(Duration::hours(24), at(0) + Duration::hours(25)));
    }

    #[test]
    fn test_delta_high_water_falls_back_to_since() {
        let empty = Delta::new(Some(at(3)), vec![], vec![], vec![], vec![]);
        assert_eq!(empty.fetched_at, Some(at(3)));

        let product = Product {
            id: "p1".into(),
            name: "Kurta".into(),
            category: None,
            updated_at: at(7),
        };
        let delta = Delta::new(Some(at(3)), vec![product], vec![], vec![], vec![]);
        assert_eq!(delta.fetched_at, Some(at(7)));
        assert_eq!(delta.watermarks.products, Some(at(7)));
        assert_eq!(delta.watermarks.events, Some(at(3)));
    }

    #[test]
    fn test_event_changed_at_is_server_insertion_time() {
        let mut event = MovementEvent {
            id: "e1".into(),
            variant_id: "v1".into(),
            from_location_id: Some("store".into()),
            to_location_id: None,
            quantity: 5,
            timestamp: at(3),
            recorded_at: None,
            reference: None,
        };
        assert_eq!(event.changed_at(), at(3));
        // Local events carry no server stamp on the wire.
        assert!(serde_json::to_value(&event).unwrap().get("created_at").is_none());

        event.recorded_at = Some(at(9));
        assert_eq!(event.changed_at(), at(9));
        assert_eq!(serde_json::to_value(&event).unwrap()["created_at"], "2024-03-01T09:00:00Z");
    }

    #[test]
    fn test_watermarks_advance_per_collection() {
        let mut marks = Watermarks::default();
        marks.advance(EntityKind::Event, Some(at(20)));
        marks.advance(EntityKind::Product, Some(at(4)));
        marks.advance(EntityKind::Product, Some(at(2)));

        assert_eq!(marks.get(EntityKind::Product), Some(at(4)));
        assert_eq!(marks.get(EntityKind::Variant), None);
        assert_eq!(marks.latest(), Some(at(20)));
        assert_eq!(marks.earliest(), Some(at(4)));

        let filled = marks.or(Some(at(1)));
        assert_eq!(filled.variants, Some(at(1)));
        assert_eq!(filled.events, Some(at(20)));
    }

    #[test]
    fn test_snapshot_windows_fall_back_to_overall_watermark() {
        let mut snapshot = CacheSnapshot::empty(at(0));
        assert_eq!(snapshot.delta_windows(), None);

        snapshot.last_sync_watermark = Some(at(2));
        snapshot.watermarks.events = Some(at(5));
        let windows = snapshot.delta_windows().unwrap();
        assert_eq!(windows.products, Some(at(2)));
        assert_eq!(windows.events, Some(at(5)));
        assert_eq!(snapshot.watermark_for(EntityKind::Event), Some(at(5)));
    }

    #[test]
    fn test_new_mutation_generates_idempotency_key() {
        let m = NewMutation::upsert(
            EntityRef::new(EntityKind::Product, "p1"),
            serde_json::json!({"id": "p1"}),
        )
        .into_queued(None, at(1));
        assert_eq!(m.idempotency_key, m.id);
        assert_eq!(m.status, MutationStatus::Pending);
        assert_eq!(m.attempt_count, 0);
    }

    #[test]
    fn test_location_type_field() {
        let json = serde_json::json!({
            "id": "l1", "code": "GD-1", "name": "Main Godown",
            "type": "godown", "updated_at": "2024-03-01T00:00:00Z"
        });
        let loc: Location = serde_json::from_value(json).unwrap();
        assert_eq!(loc.kind, LocationKind::Godown);
    }
}
