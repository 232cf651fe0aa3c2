//! # inventra-db: Local Store for the Inventra Sync Engine
//!
//! This crate provides durable local state for the sync engine. It uses
//! SQLite with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Inventra Data Flow                               │
//! │                                                                         │
//! │  inventra-sync (CacheStore, MutationQueue, ConflictResolver)           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   inventra-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories     │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │    │                    │  │ (embedded) │  │   │
//! │  │   │               │    │ CacheRepository    │  │            │  │   │
//! │  │   │ SqlitePool    │◄───│ MutationQueueRepo  │  │ 001_init   │  │   │
//! │  │   │ WAL, FKs      │    │ ConflictRepository │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/inventra/inventra.db                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`pool`] - Connection pool and repository accessors
//! - [`migrations`] - Embedded schema migrations
//! - [`error`] - Database error types
//! - [`repository`] - Cache, queue and conflict repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use inventra_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("inventra.db")).await?;
//! let usage = db.cache().usage().await?;
//! let stats = db.mutations().stats().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::cache::{CacheEntry, CacheRepository, CacheUsage};
pub use repository::conflict::ConflictRepository;
pub use repository::queue::MutationQueueRepository;
