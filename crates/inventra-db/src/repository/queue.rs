//! # Mutation Queue Repository
//!
//! Durable FIFO of local writes awaiting delivery.
//!
//! ## Status Guards
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Every transition is a single conditional UPDATE. A row only moves if  │
//! │  it is in the expected state, so two drains can never both claim it.   │
//! │                                                                         │
//! │  claim             pending → syncing   attempt_count += 1              │
//! │  mark_synced       syncing → synced                                    │
//! │  release_for_retry syncing → pending   next_attempt_at = ?             │
//! │  release_uncounted syncing → pending   attempt_count -= 1              │
//! │  mark_failed       pending | syncing → failed                          │
//! │  recover_in_flight syncing → pending   (startup after a crash)         │
//! │                                                                         │
//! │  rows_affected = 1  → transition happened                              │
//! │  rows_affected = 0  → someone else moved it first, caller skips        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! FIFO order is the AUTOINCREMENT `seq` column, never a timestamp.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use inventra_core::{
    EntityKind, EntityRef, MutationOp, MutationStatus, QueueStats, QueuedMutation,
};

/// Raw row from `mutation_queue`.
#[derive(Debug, sqlx::FromRow)]
struct MutationRow {
    id: String,
    idempotency_key: String,
    entity_kind: EntityKind,
    entity_id: String,
    op: MutationOp,
    payload: String,
    fields: Option<String>,
    status: MutationStatus,
    attempt_count: i64,
    last_error: Option<String>,
    base_watermark: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MutationRow> for QueuedMutation {
    type Error = DbError;

    fn try_from(row: MutationRow) -> Result<Self, Self::Error> {
        let payload: Value = serde_json::from_str(&row.payload)?;
        let fields: Option<Vec<String>> = row
            .fields
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(QueuedMutation {
            id: row.id,
            idempotency_key: row.idempotency_key,
            target: EntityRef::new(row.entity_kind, row.entity_id),
            op: row.op,
            payload,
            fields,
            status: row.status,
            attempt_count: row.attempt_count,
            last_error: row.last_error,
            base_watermark: row.base_watermark,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, idempotency_key, entity_kind, entity_id, op, payload, fields,
           status, attempt_count, last_error, base_watermark, next_attempt_at,
           created_at, updated_at
    FROM mutation_queue
"#;

/// Repository for the outbound mutation queue.
#[derive(Debug, Clone)]
pub struct MutationQueueRepository {
    pool: SqlitePool,
}

impl MutationQueueRepository {
    /// Creates a new MutationQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        MutationQueueRepository { pool }
    }

    /// Appends a mutation.
    ///
    /// ## Returns
    /// `(entry, true)` when inserted, or `(existing, false)` when a mutation
    /// with the same idempotency key is already queued.
    pub async fn enqueue(&self, mutation: &QueuedMutation) -> DbResult<(QueuedMutation, bool)> {
        let payload = serde_json::to_string(&mutation.payload)?;
        let fields = mutation
            .fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO mutation_queue (
                id, idempotency_key, entity_kind, entity_id, op, payload, fields,
                status, attempt_count, last_error, base_watermark, next_attempt_at,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(&mutation.id)
        .bind(&mutation.idempotency_key)
        .bind(mutation.target.kind)
        .bind(&mutation.target.id)
        .bind(mutation.op)
        .bind(&payload)
        .bind(&fields)
        .bind(mutation.status)
        .bind(mutation.attempt_count)
        .bind(&mutation.last_error)
        .bind(mutation.base_watermark)
        .bind(mutation.next_attempt_at)
        .bind(mutation.created_at)
        .bind(mutation.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(
                mutation_id = %mutation.id,
                entity = %mutation.target,
                "Mutation queued"
            );
            return Ok((mutation.clone(), true));
        }

        let existing = self
            .get_by_key(&mutation.idempotency_key)
            .await?
            .ok_or_else(|| DbError::not_found("mutation", &mutation.idempotency_key))?;

        debug!(
            idempotency_key = %mutation.idempotency_key,
            existing_id = %existing.id,
            "Duplicate idempotency key, returning existing entry"
        );
        Ok((existing, false))
    }

    /// Gets a mutation by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<QueuedMutation>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row = sqlx::query_as::<_, MutationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(QueuedMutation::try_from).transpose()
    }

    /// Gets a mutation by idempotency key.
    pub async fn get_by_key(&self, key: &str) -> DbResult<Option<QueuedMutation>> {
        let sql = format!("{SELECT_COLUMNS} WHERE idempotency_key = ?1");
        let row = sqlx::query_as::<_, MutationRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(QueuedMutation::try_from).transpose()
    }

    /// Lists mutations in the given status, FIFO order.
    pub async fn list_by_status(&self, status: MutationStatus) -> DbResult<Vec<QueuedMutation>> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY seq ASC");
        let rows = sqlx::query_as::<_, MutationRow>(&sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(QueuedMutation::try_from).collect()
    }

    /// Lists mutations not yet delivered (pending or syncing), FIFO order.
    pub async fn list_unsynced(&self) -> DbResult<Vec<QueuedMutation>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status IN ('pending', 'syncing') ORDER BY seq ASC"
        );
        let rows = sqlx::query_as::<_, MutationRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(QueuedMutation::try_from).collect()
    }

    /// Claims a pending mutation for delivery.
    ///
    /// ## Returns
    /// The claimed entry (status `syncing`, attempt counted), or `None` if it
    /// was not pending.
    pub async fn claim(&self, id: &str, now: DateTime<Utc>) -> DbResult<Option<QueuedMutation>> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'syncing',
                attempt_count = attempt_count + 1,
                next_attempt_at = NULL,
                updated_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Records a remote acknowledgement.
    pub async fn mark_synced(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'synced',
                last_error = NULL,
                updated_at = ?2
            WHERE id = ?1 AND status = 'syncing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns an in-flight mutation to `pending` after a retryable failure.
    pub async fn release_for_retry(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'pending',
                last_error = ?2,
                next_attempt_at = ?3,
                updated_at = ?4
            WHERE id = ?1 AND status = 'syncing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns an in-flight mutation to `pending` without spending one of
    /// its attempts.
    ///
    /// For failures that say nothing about the mutation itself: rejected
    /// credentials, or a conflict that the resolver now owns.
    pub async fn release_uncounted(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'pending',
                attempt_count = MAX(attempt_count - 1, 0),
                last_error = ?2,
                next_attempt_at = NULL,
                updated_at = ?3
            WHERE id = ?1 AND status = 'syncing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks a mutation permanently failed.
    pub async fn mark_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'failed',
                last_error = ?2,
                next_attempt_at = NULL,
                updated_at = ?3
            WHERE id = ?1 AND status IN ('pending', 'syncing')
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            warn!(mutation_id = %id, error = %error, "Mutation failed");
        }
        Ok(result.rows_affected() == 1)
    }

    /// Replaces the payload and base watermark of an undelivered mutation.
    ///
    /// Used when a conflict is resolved in favour of the local change.
    pub async fn rebase(
        &self,
        id: &str,
        payload: &Value,
        base_watermark: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let payload = serde_json::to_string(payload)?;
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                payload = ?2,
                base_watermark = ?3,
                updated_at = ?4
            WHERE id = ?1 AND status IN ('pending', 'syncing')
            "#,
        )
        .bind(id)
        .bind(&payload)
        .bind(base_watermark)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Counts mutations by status.
    pub async fn stats(&self) -> DbResult<QueueStats> {
        let rows: Vec<(MutationStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status {
                MutationStatus::Pending => stats.pending = count,
                MutationStatus::Syncing => stats.syncing = count,
                MutationStatus::Synced => stats.synced = count,
                MutationStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Deletes synced mutations. Returns the number removed.
    pub async fn prune(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM mutation_queue WHERE status = 'synced'")
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!(pruned = result.rows_affected(), "Pruned synced mutations");
        }
        Ok(result.rows_affected())
    }

    /// Resets mutations stranded in `syncing` by a crash. Returns the count.
    pub async fn recover_in_flight(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'pending',
                updated_at = ?1
            WHERE status = 'syncing'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            warn!(
                recovered = result.rows_affected(),
                "Recovered mutations left in flight"
            );
        }
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use inventra_core::NewMutation;
    use serde_json::json;

    async fn repo() -> MutationQueueRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().mutations()
    }

    fn mutation(id: &str, key: Option<&str>) -> QueuedMutation {
        let mut new = NewMutation::upsert(
            EntityRef::new(EntityKind::Variant, id),
            json!({"id": id, "code": "KRT-M"}),
        )
        .with_fields(["code"]);
        if let Some(key) = key {
            new = new.with_idempotency_key(key);
        }
        new.into_queued(None, Utc::now())
    }

    #[tokio::test]
    async fn test_enqueue_round_trips_and_dedupes_by_key() {
        let repo = repo().await;

        let first = mutation("v1", Some("edit-1"));
        let (stored, inserted) = repo.enqueue(&first).await.unwrap();
        assert!(inserted);
        assert_eq!(stored.id, first.id);

        let loaded = repo.get(&first.id).await.unwrap().unwrap();
        assert_eq!(loaded.fields, Some(vec!["code".to_string()]));
        assert_eq!(loaded.target, first.target);

        let (existing, inserted) = repo.enqueue(&mutation("v1", Some("edit-1"))).await.unwrap();
        assert!(!inserted);
        assert_eq!(existing.id, first.id);
        assert_eq!(repo.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let repo = repo().await;
        let m = mutation("v1", None);
        repo.enqueue(&m).await.unwrap();

        let claimed = repo.claim(&m.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, MutationStatus::Syncing);
        assert_eq!(claimed.attempt_count, 1);

        assert!(repo.claim(&m.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_then_synced_then_pruned() {
        let repo = repo().await;
        let m = mutation("v1", None);
        repo.enqueue(&m).await.unwrap();

        repo.claim(&m.id, Utc::now()).await.unwrap();
        assert!(repo
            .release_for_retry(&m.id, "timeout", None, Utc::now())
            .await
            .unwrap());

        let again = repo.claim(&m.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 2);
        assert_eq!(again.last_error.as_deref(), Some("timeout"));

        assert!(repo.mark_synced(&m.id, Utc::now()).await.unwrap());
        // Nothing leaves synced.
        assert!(!repo.mark_failed(&m.id, "late", Utc::now()).await.unwrap());
        assert!(repo.claim(&m.id, Utc::now()).await.unwrap().is_none());

        assert_eq!(repo.prune().await.unwrap(), 1);
        assert!(repo.get(&m.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncounted_release_refunds_the_attempt() {
        let repo = repo().await;
        let m = mutation("v1", None);
        repo.enqueue(&m).await.unwrap();

        for _ in 0..3 {
            repo.claim(&m.id, Utc::now()).await.unwrap().unwrap();
            assert!(repo
                .release_uncounted(&m.id, "credentials rejected", Utc::now())
                .await
                .unwrap());
        }

        let loaded = repo.get(&m.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MutationStatus::Pending);
        assert_eq!(loaded.attempt_count, 0);
        assert_eq!(loaded.next_attempt_at, None);
        assert_eq!(loaded.last_error.as_deref(), Some("credentials rejected"));

        // Only in-flight rows move.
        assert!(!repo.release_uncounted(&m.id, "again", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_keeps_unsynced() {
        let repo = repo().await;
        let pending = mutation("v1", None);
        let failed = mutation("v2", None);
        repo.enqueue(&pending).await.unwrap();
        repo.enqueue(&failed).await.unwrap();
        repo.mark_failed(&failed.id, "rejected", Utc::now()).await.unwrap();

        assert_eq!(repo.prune().await.unwrap(), 0);
        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_fifo_order_and_recovery() {
        let repo = repo().await;
        let mut queued = Vec::new();
        for i in 0..5 {
            let m = mutation(&format!("v{i}"), None);
            repo.enqueue(&m).await.unwrap();
            queued.push(m.id);
        }

        repo.claim(&queued[2], Utc::now()).await.unwrap();
        assert_eq!(repo.recover_in_flight(Utc::now()).await.unwrap(), 1);

        let pending: Vec<String> = repo
            .list_by_status(MutationStatus::Pending)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(pending, queued);
    }

    #[tokio::test]
    async fn test_rebase_updates_payload_and_watermark() {
        let repo = repo().await;
        let m = mutation("v1", None);
        repo.enqueue(&m).await.unwrap();

        let base = Utc::now();
        let payload = json!({"id": "v1", "code": "KRT-L"});
        assert!(repo.rebase(&m.id, &payload, Some(base), Utc::now()).await.unwrap());

        let loaded = repo.get(&m.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload, payload);
        assert_eq!(loaded.base_watermark, Some(base));
    }
}
