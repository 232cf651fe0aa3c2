//! # Error Types
//!
//! Domain-specific error types for inventra-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  inventra-core errors (this file)                                      │
//! │  ├── CoreError        - Domain rule violations                         │
//! │  └── ValidationError  - Row / input validation failures                │
//! │                                                                         │
//! │  inventra-db errors (separate crate)                                   │
//! │  └── DbError          - SQLite operation failures                      │
//! │                                                                         │
//! │  inventra-sync errors (separate crate)                                 │
//! │  └── SyncError        - Network / queue / storage taxonomy             │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → SyncStatus.last_error │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A conflict resolution was requested for the wrong mutation.
    #[error("Mutation {mutation_id} does not belong to conflict {conflict_id}")]
    MutationMismatch {
        conflict_id: String,
        mutation_id: String,
    },

    /// A conflict was already resolved and cannot be resolved again.
    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(String),

    /// Local and remote values cannot be overlaid (not JSON objects).
    #[error("Cannot overlay {entity}: {reason}")]
    NotMergeable { entity: String, reason: String },

    /// Unknown enum value read from storage or the wire.
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised at the deserialization boundary when a remote row does not fit the
/// typed model, and when a local mutation is malformed.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., bad SKU code).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// A remote row could not be decoded into the typed model.
    #[error("{collection} row {index}: {reason}")]
    MalformedRow {
        collection: String,
        index: usize,
        reason: String,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
