//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transient     │  │     Structural          │ │
//! │  │                 │  │   (retry)       │  │     (surface)           │ │
//! │  │  InvalidConfig  │  │  Network        │  │  Validation             │ │
//! │  │  InvalidUrl     │  │  RateLimited    │  │  Schema                 │ │
//! │  │  ConfigLoad/Save│  │  Timeout        │  │  Auth                   │ │
//! │  └─────────────────┘  │  Disconnected   │  │  Rejected               │ │
//! │                       └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │    Conflict     │  │      Engine             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  StorageQuota   │  │  Conflict       │  │  DrainInProgress        │ │
//! │  │  Database       │  │  Resolution     │  │  NotFound, Internal     │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient errors are retried with backoff. Structural errors are never
//! retried; they land in `SyncStatus::last_error` while the last good
//! snapshot keeps being served.

use std::time::Duration;

use inventra_core::{CoreError, ValidationError};
use inventra_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid endpoint URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transient Remote Errors
    // =========================================================================
    /// Network failure or 5xx from the remote.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote asked us to slow down (HTTP 429).
    #[error("Rate limited by remote{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Change feed connection dropped.
    #[error("Disconnected from change feed")]
    Disconnected,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // =========================================================================
    // Structural Errors
    // =========================================================================
    /// A row or mutation failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The remote returned a shape we cannot decode.
    #[error("Unexpected response shape: {0}")]
    Schema(String),

    /// Credentials were rejected (HTTP 401/403).
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The remote refused a request for a non-retryable reason.
    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    /// The remote reported a write conflict on an entity.
    #[error("Remote conflict on {entity}: {message}")]
    Conflict { entity: String, message: String },

    /// A conflict decision could not be applied.
    #[error("Conflict resolution failed: {0}")]
    Resolution(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The cache is over quota even after eviction.
    #[error("Storage quota exceeded: need {needed} bytes, quota is {quota}")]
    StorageQuota { needed: i64, quota: i64 },

    /// Local database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Another drain of the same queue is running.
    #[error("A queue drain is already in progress")]
    DrainInProgress,

    /// Unknown mutation or conflict id.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal sync engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::QuotaExceeded { needed, quota } => SyncError::StorageQuota { needed, quota },
            DbError::NotFound { entity, id } => SyncError::NotFound { entity, id },
            DbError::Serialization(msg) => SyncError::Serialization(msg),
            busy if busy.is_busy() => SyncError::Timeout(busy.to_string()),
            other => SyncError::Database(other.to_string()),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => SyncError::Validation(v.to_string()),
            other => SyncError::Resolution(other.to_string()),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_decode() {
            SyncError::Schema(err.to_string())
        } else if err.is_builder() {
            SyncError::InvalidConfig(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocket(p.to_string()),
            WsError::Io(io) => SyncError::Network(io.to_string()),
            WsError::Url(u) => SyncError::InvalidUrl(u.to_string()),
            other => SyncError::WebSocket(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried after a backoff.
    ///
    /// ## Retryable Errors
    /// - Network failures and 5xx responses
    /// - Rate limiting (with a longer backoff)
    /// - Timeouts and dropped connections
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::RateLimited { .. }
                | SyncError::Timeout(_)
                | SyncError::Disconnected
                | SyncError::WebSocket(_)
        )
    }

    /// Returns true if retrying cannot help and the error must be surfaced.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_)
                | SyncError::Schema(_)
                | SyncError::Auth(_)
                | SyncError::Rejected { .. }
        ) || self.is_config_error()
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Short machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::InvalidConfig(_)
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_) => "config",
            SyncError::Network(_) | SyncError::Disconnected | SyncError::WebSocket(_) => "network",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Timeout(_) => "timeout",
            SyncError::Validation(_) => "validation",
            SyncError::Schema(_) => "schema",
            SyncError::Auth(_) => "auth",
            SyncError::Rejected { .. } => "rejected",
            SyncError::Conflict { .. } | SyncError::Resolution(_) => "conflict",
            SyncError::StorageQuota { .. } => "storage_quota",
            SyncError::Database(_) | SyncError::Serialization(_) => "storage",
            SyncError::DrainInProgress => "busy",
            SyncError::NotFound { .. } => "not_found",
            SyncError::ShuttingDown | SyncError::ChannelError(_) | SyncError::Internal(_) => {
                "internal"
            }
        }
    }
}
