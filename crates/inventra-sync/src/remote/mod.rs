//! # Remote Backend
//!
//! The seam between the engine and the system of record.
//!
//! ```text
//! ┌───────────────────┐     fetch_page / fetch_changed / count    ┌─────────────┐
//! │ ProgressiveLoader │ ────────────────────────────────────────► │             │
//! │ DeltaClient       │     fetch_one (change notifications)      │  Remote     │
//! ├───────────────────┤     upsert (Idempotency-Key)              │  Backend    │
//! │ MutationQueue     │ ────────────────────────────────────────► │             │
//! └───────────────────┘                                           └─────────────┘
//! ```
//!
//! Rows come back as raw JSON and are decoded at the engine boundary, so a
//! backend never needs to know the typed model.
//!
//! ## Implementations
//! - [`http::HttpBackend`] - PostgREST-style REST API over reqwest
//! - [`memory::MemoryBackend`] - in-process store with failure injection

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;
use inventra_core::{EntityKind, QueuedMutation};

pub use http::HttpBackend;
pub use memory::{InjectedFailure, MemoryBackend, RequestLog, RequestOp};

/// Remote acknowledgement of a delivered mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertAck {
    /// The idempotency key had already been applied; this delivery had no effect.
    pub duplicate: bool,
}

/// Read and write access to the remote inventory collections.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Reads rows `[offset, offset + limit)` of a collection in key order.
    async fn fetch_page(&self, kind: EntityKind, offset: usize, limit: usize)
        -> SyncResult<Vec<Value>>;

    /// Reads rows changed at or after `since`, oldest change first.
    async fn fetch_changed(
        &self,
        kind: EntityKind,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Value>>;

    /// Reads a single row by primary key; `None` if it does not exist.
    async fn fetch_one(&self, kind: EntityKind, id: &str) -> SyncResult<Option<Value>>;

    /// Row count of a collection, if the backend can report it.
    async fn count(&self, kind: EntityKind) -> SyncResult<Option<usize>>;

    /// Idempotently applies a queued mutation.
    async fn upsert(&self, mutation: &QueuedMutation) -> SyncResult<UpsertAck>;
}

/// Server-assigned column that delta windows filter and order on.
///
/// Events use their insertion time rather than the business `timestamp`,
/// which an offline terminal may set earlier than rows already uploaded.
pub fn change_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Event => "created_at",
        _ => "updated_at",
    }
}

/// Business key the remote upsert resolves duplicates on.
pub fn conflict_key(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Variant | EntityKind::Location => "code",
        EntityKind::Product | EntityKind::Event => "id",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_per_collection() {
        assert_eq!(change_column(EntityKind::Event), "created_at");
        assert_eq!(change_column(EntityKind::Variant), "updated_at");
        assert_eq!(conflict_key(EntityKind::Variant), "code");
        assert_eq!(conflict_key(EntityKind::Product), "id");
    }
}
