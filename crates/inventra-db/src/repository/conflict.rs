//! # Conflict Log Repository
//!
//! Audit trail of detected conflicts. A conflict row is written when it is
//! detected and updated exactly once when a decision is made; rows are never
//! deleted.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use inventra_core::{Conflict, ConflictResolution, EntityKind, EntityRef, ResolutionPolicy};

#[derive(Debug, sqlx::FromRow)]
struct ConflictRow {
    id: String,
    entity_kind: EntityKind,
    entity_id: String,
    mutation_id: String,
    local_value: String,
    remote_value: String,
    detected_at: DateTime<Utc>,
    resolution: ConflictResolution,
    resolved_at: Option<DateTime<Utc>>,
    note: Option<String>,
}

impl TryFrom<ConflictRow> for Conflict {
    type Error = DbError;

    fn try_from(row: ConflictRow) -> Result<Self, Self::Error> {
        let local_value: Value = serde_json::from_str(&row.local_value)?;
        let remote_value: Value = serde_json::from_str(&row.remote_value)?;
        Ok(Conflict {
            id: row.id,
            target: EntityRef::new(row.entity_kind, row.entity_id),
            mutation_id: row.mutation_id,
            local_value,
            remote_value,
            detected_at: row.detected_at,
            resolution: row.resolution,
            resolved_at: row.resolved_at,
            note: row.note,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, entity_kind, entity_id, mutation_id, local_value, remote_value,
           detected_at, resolution, resolved_at, note
    FROM conflict_log
"#;

/// Repository for the conflict audit log.
#[derive(Debug, Clone)]
pub struct ConflictRepository {
    pool: SqlitePool,
}

impl ConflictRepository {
    /// Creates a new ConflictRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ConflictRepository { pool }
    }

    /// Records a newly detected conflict.
    pub async fn record(&self, conflict: &Conflict) -> DbResult<()> {
        let local_value = serde_json::to_string(&conflict.local_value)?;
        let remote_value = serde_json::to_string(&conflict.remote_value)?;

        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                id, entity_kind, entity_id, mutation_id, local_value, remote_value,
                detected_at, resolution, resolved_at, note
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&conflict.id)
        .bind(conflict.target.kind)
        .bind(&conflict.target.id)
        .bind(&conflict.mutation_id)
        .bind(&local_value)
        .bind(&remote_value)
        .bind(conflict.detected_at)
        .bind(conflict.resolution)
        .bind(conflict.resolved_at)
        .bind(&conflict.note)
        .execute(&self.pool)
        .await?;

        debug!(
            conflict_id = %conflict.id,
            entity = %conflict.target,
            mutation_id = %conflict.mutation_id,
            "Conflict recorded"
        );
        Ok(())
    }

    /// Records a decision on an open conflict.
    ///
    /// `resolution = Unresolved` (manual policy) only stamps the policy and
    /// note; the conflict stays open.
    ///
    /// ## Returns
    /// `false` if the conflict was already closed.
    pub async fn resolve(
        &self,
        id: &str,
        resolution: ConflictResolution,
        policy: ResolutionPolicy,
        note: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let resolved_at = (resolution != ConflictResolution::Unresolved).then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE conflict_log SET
                resolution = ?2,
                policy = ?3,
                note = ?4,
                resolved_at = ?5
            WHERE id = ?1 AND resolution = 'unresolved'
            "#,
        )
        .bind(id)
        .bind(resolution)
        .bind(policy.to_string())
        .bind(note)
        .bind(resolved_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            info!(
                conflict_id = %id,
                resolution = resolution.as_str(),
                policy = %policy,
                "Conflict decision recorded"
            );
        }
        Ok(result.rows_affected() == 1)
    }

    /// Gets a conflict by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<Conflict>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row = sqlx::query_as::<_, ConflictRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Conflict::try_from).transpose()
    }

    /// Lists unresolved conflicts, oldest first.
    pub async fn list_open(&self) -> DbResult<Vec<Conflict>> {
        let sql = format!("{SELECT_COLUMNS} WHERE resolution = 'unresolved' ORDER BY rowid ASC");
        let rows = sqlx::query_as::<_, ConflictRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Conflict::try_from).collect()
    }

    /// Lists every conflict recorded for a mutation.
    pub async fn list_for_mutation(&self, mutation_id: &str) -> DbResult<Vec<Conflict>> {
        let sql = format!("{SELECT_COLUMNS} WHERE mutation_id = ?1 ORDER BY rowid ASC");
        let rows = sqlx::query_as::<_, ConflictRow>(&sql)
            .bind(mutation_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Conflict::try_from).collect()
    }

    /// Counts unresolved conflicts.
    pub async fn count_open(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conflict_log WHERE resolution = 'unresolved'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
