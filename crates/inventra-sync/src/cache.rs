//! # Cache Store
//!
//! Engine-facing wrapper over [`CacheRepository`] that turns storage trouble
//! into degraded service instead of outages.
//!
//! ```text
//! load  ── ok ──────────────► Some(snapshot) / None
//!       └─ db error ─► warn ─► None            (render from memory or empty)
//!
//! save  ── ok ──────────────► CacheEntry
//!       └─ QuotaExceeded ─► evict oldest other dataset ─► retry once
//!                                 │                          └─ still over ─► StorageQuota
//!                                 └─ nothing to evict ─────────────────────► StorageQuota
//! ```

use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use inventra_core::CacheSnapshot;
use inventra_db::{CacheEntry, CacheRepository, CacheUsage, DbError};

/// Snapshot cache with quota handling.
#[derive(Debug, Clone)]
pub struct CacheStore {
    repo: CacheRepository,
}

impl CacheStore {
    pub fn new(repo: CacheRepository) -> Self {
        CacheStore { repo }
    }

    /// Loads a snapshot; storage failures read as "never saved".
    pub async fn load(&self, name: &str) -> Option<CacheSnapshot> {
        match self.repo.load(name).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(dataset = %name, error = %e, "Cache load failed, treating as empty");
                None
            }
        }
    }

    /// Saves a snapshot, evicting one other dataset if the quota is hit.
    ///
    /// ## Errors
    /// * `SyncError::StorageQuota` - still over quota after eviction
    /// * `SyncError::Database` - any other storage failure (logged)
    pub async fn save(&self, name: &str, snapshot: &CacheSnapshot) -> SyncResult<CacheEntry> {
        match self.repo.save(name, snapshot).await {
            Ok(entry) => Ok(entry),
            Err(DbError::QuotaExceeded { needed, quota }) => {
                let Some(evicted) = self.repo.evict_oldest_except(name).await? else {
                    warn!(dataset = %name, needed, quota, "Over quota with nothing to evict");
                    return Err(SyncError::StorageQuota { needed, quota });
                };
                info!(dataset = %name, evicted = %evicted, "Retrying save after eviction");
                self.repo.save(name, snapshot).await.map_err(SyncError::from)
            }
            Err(e) => {
                warn!(dataset = %name, error = %e, "Cache save failed");
                Err(e.into())
            }
        }
    }

    pub async fn usage(&self) -> SyncResult<CacheUsage> {
        Ok(self.repo.usage().await?)
    }

    /// Stored datasets, oldest capture first.
    pub async fn list(&self) -> SyncResult<Vec<CacheEntry>> {
        Ok(self.repo.list().await?)
    }

    pub async fn delete(&self, name: &str) -> SyncResult<bool> {
        Ok(self.repo.delete(name).await?)
    }
}
