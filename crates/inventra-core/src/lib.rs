//! # inventra-core: Pure Logic for the Inventra Sync Engine
//!
//! This crate is the **heart** of the inventory sync engine. It contains the
//! model and every algorithm as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Inventra Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    UI layer (out of tree)                       │   │
//! │  │   get_stock_view, force_resync, queue_local_change, status      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 inventra-sync (async engine)                    │   │
//! │  │   loader, delta client, mutation queue, resolver, realtime      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ inventra-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ ┌────────────┐  │   │
//! │  │   │ types  │ │  rows  │ │ ledger │ │ delta  │ │  conflict  │  │   │
//! │  │   │ model  │ │ decode │ │ fold   │ │ merge  │ │ detect/res │  │   │
//! │  │   └────────┘ └────────┘ └────────┘ └────────┘ └────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO CLOCK                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 inventra-db (SQLite layer)                      │   │
//! │  │      cache snapshots, mutation queue, conflict log              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain model (Product, Variant, Location, MovementEvent, ...)
//! - [`rows`] - Validating decode of raw remote rows
//! - [`ledger`] - Stock materialization from the movement ledger
//! - [`delta`] - Delta merge and watermark rules
//! - [`conflict`] - Conflict detection and resolution policies
//! - [`validation`] - Field and row rules
//! - [`error`] - Domain error types
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: same input, same output. Callers pass `now`.
//! 2. **No I/O**: database, network and file system access is FORBIDDEN here
//! 3. **Order Independence**: the ledger fold is commutative
//! 4. **Explicit Errors**: all errors are typed, never strings or panics
//!
//! ## Example Usage
//!
//! ```rust
//! use inventra_core::ledger::{materialize, StockPolicy};
//! use inventra_core::rows::decode_rows;
//! use inventra_core::types::{Location, MovementEvent, Variant};
//! use serde_json::json;
//!
//! let variants: Vec<Variant> = decode_rows(vec![json!({
//!     "id": "V1", "product_id": "P1", "code": "KRT-M",
//!     "updated_at": "2024-03-01T09:00:00Z"
//! })], 0).unwrap();
//! let locations: Vec<Location> = decode_rows(vec![json!({
//!     "id": "A", "code": "ST-1", "name": "Front Store", "type": "store",
//!     "updated_at": "2024-03-01T09:00:00Z"
//! })], 0).unwrap();
//! let events: Vec<MovementEvent> = decode_rows(vec![json!({
//!     "id": "e1", "variant_id": "V1", "to_location_id": "A", "quantity": 50,
//!     "timestamp": "2024-03-01T09:00:00Z"
//! })], 0).unwrap();
//!
//! let stock = materialize(&events, &variants, &locations, &StockPolicy::default());
//! assert_eq!(stock[0].quantity, 50);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod delta;
pub mod error;
pub mod ledger;
pub mod rows;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use inventra_core::StockPolicy` instead of
// `use inventra_core::ledger::StockPolicy`

pub use conflict::{MutationAction, Resolved};
pub use delta::{DeltaStats, MergeStats};
pub use error::{CoreError, CoreResult, ValidationError};
pub use ledger::{StockPolicy, StockSummary};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Hard row cap per remote request.
///
/// ## Why a constant?
/// The backend rejects larger windows, so every paginated read in the engine
/// is clamped to this regardless of configuration.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Default snapshot TTL in hours.
pub const DEFAULT_CACHE_TTL_HOURS: i64 = 24;

/// Name of the primary inventory dataset in the cache.
pub const INVENTORY_DATASET: &str = "inventory";
