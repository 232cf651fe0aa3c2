//! # inventra-sync: Offline-First Inventory Sync Engine
//!
//! Keeps a local, always-readable copy of the inventory dataset in step with
//! a remote system of record, and delivers local edits back to it.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       InventorySync (engine)                            │
//! │                                                                         │
//! │   get_stock_view ◄── snapshot (memory → cache) ── materialize ledger    │
//! │                                                                         │
//! │   sync / refresh / force_resync                                         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌────────────────┐   pages   ┌────────────────┐                        │
//! │  │  DeltaClient   │ ────────► │ Progressive    │ ──► RemoteBackend      │
//! │  │ delta / full   │           │ loader         │     (HTTP / memory)    │
//! │  └───────┬────────┘           └────────────────┘                        │
//! │          │ merge + watermark                                            │
//! │          ▼                                                              │
//! │  ┌────────────────┐  detect   ┌────────────────┐  upsert                │
//! │  │ ConflictResolver│ ◄──────► │ MutationQueue  │ ──────► RemoteBackend  │
//! │  │ policy, audit   │          │ retry, backoff │                        │
//! │  └───────┬────────┘           └────────────────┘                        │
//! │          ▼                                                              │
//! │  ┌────────────────┐                                                     │
//! │  │  CacheStore    │  SQLite snapshot, TTL, quota eviction               │
//! │  └────────────────┘                                                     │
//! │                                                                         │
//! │  RealtimeManager ── change notification ──► apply_change (scoped merge) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`engine`] - `InventorySync` service object and background loop
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error types
//! - [`remote`] - `RemoteBackend` trait, HTTP and in-memory backends
//! - [`loader`] - Progressive paginated loader
//! - [`delta`] - Delta and full-load fetch paths
//! - [`cache`] - Snapshot cache with quota handling
//! - [`queue`] - Durable mutation queue and drain loop
//! - [`resolver`] - Conflict detection, policy and audit
//! - [`realtime`] - Change-feed subscription with reconnect
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use inventra_db::{Database, DbConfig};
//! use inventra_sync::{HttpBackend, InventorySync, SyncConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new(config.database_path())).await?;
//! let remote = HttpBackend::new(url, api_key, config.request_timeout())?;
//!
//! let engine = InventorySync::new(&db, Arc::new(remote), &config).await?;
//! let view = engine.get_stock_view().await;
//! engine.sync().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod loader;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod resolver;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::CacheStore;
pub use config::SyncConfig;
pub use delta::{DeltaClient, FullLoad};
pub use engine::{EngineHandle, InventorySync, SyncOutcome, SyncPhase, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use loader::{LoadPhase, LoadProgress, LoaderOptions};
pub use queue::{DeferReason, DrainOutcome, DrainReport, MutationQueue, RetryPolicy};
pub use realtime::{
    ChangeFeed, ChangeHandler, ChangeNotification, ChangeStream, RealtimeManager,
    RealtimeOptions, RealtimeState, Subscription, WsChangeFeed,
};
pub use remote::{HttpBackend, MemoryBackend, RemoteBackend, UpsertAck};
pub use resolver::ConflictResolver;
