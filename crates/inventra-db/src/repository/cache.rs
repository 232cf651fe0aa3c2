//! # Cache Snapshot Repository
//!
//! Stores one [`CacheSnapshot`] per dataset name.
//!
//! ## Save Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  save("inventory", snapshot)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  serialize to JSON (outside the transaction)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. SELECT SUM(byte_size) WHERE name != ?                      │   │
//! │  │  2. others + new > quota?  → rollback, QuotaExceeded           │   │
//! │  │  3. INSERT ... ON CONFLICT(name) DO UPDATE                     │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← readers see the old snapshot or the new one, never a mix     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Staleness is not decided here; callers compare `captured_at` against
//! their TTL.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use inventra_core::CacheSnapshot;

/// Metadata for a stored snapshot (without the payload).
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CacheEntry {
    pub name: String,
    pub captured_at: DateTime<Utc>,
    pub watermark: Option<DateTime<Utc>>,
    pub complete: bool,
    pub row_count: i64,
    pub byte_size: i64,
    pub updated_at: DateTime<Utc>,
}

/// Storage usage across all datasets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheUsage {
    pub used: i64,
    pub quota: i64,
    pub datasets: i64,
}

impl CacheUsage {
    /// Bytes still available under the quota.
    pub fn remaining(&self) -> i64 {
        (self.quota - self.used).max(0)
    }
}

/// Repository for cache snapshots.
#[derive(Debug, Clone)]
pub struct CacheRepository {
    pool: SqlitePool,
    quota: i64,
}

impl CacheRepository {
    /// Creates a new CacheRepository with a byte quota.
    pub fn new(pool: SqlitePool, quota: i64) -> Self {
        CacheRepository { pool, quota }
    }

    /// Atomically replaces the snapshot stored under `name`.
    ///
    /// ## Errors
    /// * `DbError::QuotaExceeded` - the other datasets plus this one would
    ///   exceed the quota. Nothing is written.
    pub async fn save(&self, name: &str, snapshot: &CacheSnapshot) -> DbResult<CacheEntry> {
        let payload = serde_json::to_string(snapshot)?;
        let byte_size = payload.len() as i64;
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let others: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(byte_size), 0) FROM cache_snapshots WHERE name != ?1",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        if others + byte_size > self.quota {
            warn!(
                dataset = %name,
                needed = others + byte_size,
                quota = self.quota,
                "Cache save rejected by quota"
            );
            return Err(DbError::QuotaExceeded {
                needed: others + byte_size,
                quota: self.quota,
            });
        }

        let entry = CacheEntry {
            name: name.to_string(),
            captured_at: snapshot.captured_at,
            watermark: snapshot.last_sync_watermark,
            complete: snapshot.complete,
            row_count: snapshot.row_count() as i64,
            byte_size,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO cache_snapshots (
                name, payload, captured_at, watermark, complete,
                row_count, byte_size, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(name) DO UPDATE SET
                payload = excluded.payload,
                captured_at = excluded.captured_at,
                watermark = excluded.watermark,
                complete = excluded.complete,
                row_count = excluded.row_count,
                byte_size = excluded.byte_size,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.name)
        .bind(&payload)
        .bind(entry.captured_at)
        .bind(entry.watermark)
        .bind(entry.complete)
        .bind(entry.row_count)
        .bind(entry.byte_size)
        .bind(entry.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(
            dataset = %name,
            rows = entry.row_count,
            bytes = byte_size,
            "Snapshot saved"
        );

        Ok(entry)
    }

    /// Loads the snapshot stored under `name`, or `None` if never saved.
    pub async fn load(&self, name: &str) -> DbResult<Option<CacheSnapshot>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM cache_snapshots WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Reports bytes used against the quota.
    pub async fn usage(&self) -> DbResult<CacheUsage> {
        let (used, datasets): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(byte_size), 0), COUNT(*) FROM cache_snapshots",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheUsage {
            used,
            quota: self.quota,
            datasets,
        })
    }

    /// Lists stored datasets, oldest capture first.
    pub async fn list(&self) -> DbResult<Vec<CacheEntry>> {
        let mut entries = sqlx::query_as::<_, CacheEntry>(
            r#"
            SELECT name, captured_at, watermark, complete, row_count, byte_size, updated_at
            FROM cache_snapshots
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // RFC 3339 text with variable precision does not sort lexically.
        entries.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then(a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Deletes a dataset. Returns true if it existed.
    pub async fn delete(&self, name: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM cache_snapshots WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Evicts the oldest dataset other than `keep`.
    ///
    /// ## Returns
    /// The evicted dataset name, or `None` if there was nothing to evict.
    pub async fn evict_oldest_except(&self, keep: &str) -> DbResult<Option<String>> {
        let victim = self
            .list()
            .await?
            .into_iter()
            .find(|entry| entry.name != keep)
            .map(|entry| entry.name);

        if let Some(name) = &victim {
            self.delete(name).await?;
            warn!(dataset = %name, "Evicted cached dataset to free quota");
        }

        Ok(victim)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig, DbError};
    use chrono::{Duration, TimeZone, Utc};
    use inventra_core::{CacheSnapshot, Product};

    fn snapshot(products: usize, hour: u32) -> CacheSnapshot {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap();
        let mut s = CacheSnapshot::empty(at);
        s.products = (0..products)
            .map(|i| Product {
                id: format!("p{i}"),
                name: format!("Product {i}"),
                category: Some("Apparel".into()),
                updated_at: at,
            })
            .collect();
        s.last_sync_watermark = Some(at - Duration::minutes(1));
        s
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.cache();

        assert!(repo.load("inventory").await.unwrap().is_none());

        let s = snapshot(3, 8);
        let entry = repo.save("inventory", &s).await.unwrap();
        assert_eq!(entry.row_count, 3);

        let loaded = repo.load("inventory").await.unwrap().unwrap();
        assert_eq!(loaded, s);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.cache();

        repo.save("inventory", &snapshot(5, 8)).await.unwrap();
        repo.save("inventory", &snapshot(2, 9)).await.unwrap();

        let loaded = repo.load("inventory").await.unwrap().unwrap();
        assert_eq!(loaded.products.len(), 2);
        assert_eq!(repo.usage().await.unwrap().datasets, 1);
    }

    #[tokio::test]
    async fn test_quota_rejects_and_keeps_old_snapshot() {
        let db = Database::new(DbConfig::in_memory().cache_quota_bytes(4_000))
            .await
            .unwrap();
        let repo = db.cache();

        repo.save("inventory", &snapshot(1, 8)).await.unwrap();
        let err = repo.save("inventory", &snapshot(200, 9)).await.unwrap_err();
        assert!(matches!(err, DbError::QuotaExceeded { .. }));

        let loaded = repo.load("inventory").await.unwrap().unwrap();
        assert_eq!(loaded.products.len(), 1);
    }

    #[tokio::test]
    async fn test_evict_oldest_skips_kept_dataset() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.cache();

        repo.save("archive-2023", &snapshot(1, 1)).await.unwrap();
        repo.save("inventory", &snapshot(1, 2)).await.unwrap();
        repo.save("archive-2024", &snapshot(1, 3)).await.unwrap();

        let evicted = repo.evict_oldest_except("inventory").await.unwrap();
        assert_eq!(evicted.as_deref(), Some("archive-2023"));

        let names: Vec<String> = repo.list().await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["inventory", "archive-2024"]);

        let usage = repo.usage().await.unwrap();
        assert_eq!(usage.datasets, 2);
        assert!(usage.remaining() > 0);
    }
}
