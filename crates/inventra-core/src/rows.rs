//! # Row Decoding
//!
//! The validating deserialization boundary between loosely typed remote rows
//! and the typed model. Nothing from the backend reaches the materializer
//! without passing through here.
//!
//! ```text
//!   Vec<serde_json::Value>  ──► serde ──► validate_* ──► Vec<T>
//!                                  │            │
//!                                  └──── ValidationError::MalformedRow
//!                                        { collection, index, reason }
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{EntityKind, Location, MovementEvent, Product, Variant};
use crate::validation::{
    validate_event, validate_location, validate_product, validate_variant, ValidationResult,
};

/// A typed row that can be decoded from a remote collection.
pub trait RemoteRow: DeserializeOwned + Sized {
    /// Collection the row belongs to.
    const KIND: EntityKind;

    /// Per-type rules beyond what serde checks.
    fn validate(&self) -> ValidationResult<()>;
}

impl RemoteRow for Product {
    const KIND: EntityKind = EntityKind::Product;

    fn validate(&self) -> ValidationResult<()> {
        validate_product(self)
    }
}

impl RemoteRow for Variant {
    const KIND: EntityKind = EntityKind::Variant;

    fn validate(&self) -> ValidationResult<()> {
        validate_variant(self)
    }
}

impl RemoteRow for Location {
    const KIND: EntityKind = EntityKind::Location;

    fn validate(&self) -> ValidationResult<()> {
        validate_location(self)
    }
}

impl RemoteRow for MovementEvent {
    const KIND: EntityKind = EntityKind::Event;

    fn validate(&self) -> ValidationResult<()> {
        validate_event(self)
    }
}

/// Decodes a page of raw rows. The first bad row fails the whole batch.
///
/// `offset` is added to the row index in error messages so a failure deep in a
/// paginated load names the absolute row.
pub fn decode_rows<T: RemoteRow>(rows: Vec<Value>, offset: usize) -> ValidationResult<Vec<T>> {
    rows.into_iter()
        .enumerate()
        .map(|(i, raw)| decode_row(raw, offset + i))
        .collect()
}

/// Decodes a single row.
pub fn decode_row<T: RemoteRow>(raw: Value, index: usize) -> ValidationResult<T> {
    let malformed = |reason: String| ValidationError::MalformedRow {
        collection: T::KIND.collection().to_string(),
        index,
        reason,
    };

    let row: T = serde_json::from_value(raw).map_err(|e| malformed(e.to_string()))?;
    row.validate().map_err(|e| malformed(e.to_string()))?;
    Ok(row)
}
