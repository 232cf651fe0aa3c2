//! # Database Error Types
//!
//! Failures of the local store: the cache snapshots, the mutation queue and
//! the conflict log.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sqlx::Error / MigrateError / serde_json::Error                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError          Busy when another writer holds the database           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError        QuotaExceeded becomes StorageQuota                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncStatus.last_error, or degrade-to-absent on cache reads             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Local store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Unknown mutation, conflict or dataset.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A snapshot save would push the cache over its quota.
    ///
    /// ## When This Occurs
    /// - `CacheRepository::save` with `used - existing + new > quota`
    #[error("Cache quota exceeded: need {needed} bytes, quota is {quota}")]
    QuotaExceeded { needed: i64, quota: i64 },

    /// A stored payload or snapshot could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The database file could not be opened.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An embedded migration did not apply.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// A snapshot transaction could not begin or commit.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Another writer held the database past the busy timeout.
    #[error("Database busy: {0}")]
    Busy(String),

    /// Any other SQLite failure.
    #[error("SQLite error: {0}")]
    Sqlite(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// True when retrying the same operation later may succeed.
    pub fn is_busy(&self) -> bool {
        matches!(self, DbError::Busy(_))
    }
}

/// ```text
/// RowNotFound                    → NotFound
/// "database is locked" / timeout → Busy
/// PoolClosed                     → ConnectionFailed
/// anything else                  → Sqlite
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("row", "unknown"),
            sqlx::Error::Database(db_err) if db_err.message().contains("database is locked") => {
                DbError::Busy(db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut => DbError::Busy("no connection available".to_string()),
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".to_string()),
            other => DbError::Sqlite(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Migration(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
