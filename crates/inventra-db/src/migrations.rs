//! # Database Migrations
//!
//! Embedded SQL migrations for the local store.
//!
//! ```text
//! migrations/sqlite/
//! └── 001_initial_schema.sql   cache_snapshots, mutation_queue, conflict_log
//! ```
//!
//! `sqlx::migrate!` embeds the directory at compile time and records applied
//! versions (with checksums) in `_sqlx_migrations`. Existing migration files
//! are never edited; schema changes get a new `NNN_description.sql`.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies all pending migrations in filename order.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!(
        embedded = MIGRATOR.migrations.len(),
        "Checking for pending migrations"
    );

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// Returns `(embedded, applied)` migration counts.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await?;

    Ok((total, applied as usize))
}
