//! # Validation Module
//!
//! Input validation for rows coming from the remote backend and for local
//! mutations entering the queue.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: serde (rows::decode_rows)                                    │
//! │  ├── Shape checks: field present, right JSON type                      │
//! │  └── Timestamps parse as RFC 3339                                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Non-empty ids, code format                                        │
//! │  └── Event shape: qty > 0, at least one location, from != to          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── NOT NULL / CHECK constraints on the queue                         │
//! │  └── UNIQUE idempotency key                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use inventra_core::validation::{validate_variant_code, validate_quantity};
//!
//! validate_variant_code("KRT-BLU-M").unwrap();
//! validate_quantity(5).unwrap();
//! ```

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{
    EntityKind, Location, MovementEvent, MutationOp, NewMutation, Product, Variant,
};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted variant code.
pub const MAX_CODE_LEN: usize = 64;

/// Longest accepted display name.
pub const MAX_NAME_LEN: usize = 200;

// =============================================================================
// String Validators
// =============================================================================

/// Validates an entity id.
pub fn validate_id(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a variant (SKU) code.
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_CODE_LEN`] characters
/// - Letters, digits, hyphens, underscores, dots and slashes only
///
/// ## Example
/// ```rust
/// use inventra_core::validation::validate_variant_code;
///
/// assert!(validate_variant_code("KRT-BLU-M").is_ok());
/// assert!(validate_variant_code("").is_err());
/// assert!(validate_variant_code("has space").is_err());
/// ```
pub fn validate_variant_code(code: &str) -> ValidationResult<()> {
    let code = code.trim();

    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "code".to_string(),
        });
    }

    if code.len() > MAX_CODE_LEN {
        return Err(ValidationError::TooLong {
            field: "code".to_string(),
            max: MAX_CODE_LEN,
        });
    }

    if !code
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(ValidationError::InvalidFormat {
            field: "code".to_string(),
            reason: "must contain only letters, numbers, '-', '_', '.' and '/'".to_string(),
        });
    }

    Ok(())
}

/// Validates a display name.
pub fn validate_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "name".to_string(),
        });
    }

    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "name".to_string(),
            max: MAX_NAME_LEN,
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a movement quantity. Must be positive; direction is carried by
/// the from/to locations, never by the sign.
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Row Validators
// =============================================================================

pub fn validate_product(product: &Product) -> ValidationResult<()> {
    validate_id("id", &product.id)?;
    validate_name(&product.name)
}

pub fn validate_variant(variant: &Variant) -> ValidationResult<()> {
    validate_id("id", &variant.id)?;
    validate_id("product_id", &variant.product_id)?;
    validate_variant_code(&variant.code)
}

pub fn validate_location(location: &Location) -> ValidationResult<()> {
    validate_id("id", &location.id)?;
    validate_id("code", &location.code)?;
    validate_name(&location.name)
}

/// Validates a movement event.
///
/// ## Rules
/// ```text
/// from  to   valid?
/// ────  ───  ──────────────────────────
///  -     -   no  (moves nothing anywhere)
///  A     A   no  (self-transfer)
///  A     -   yes (sale / write-off)
///  -     B   yes (receipt)
///  A     B   yes (transfer)
/// ```
pub fn validate_event(event: &MovementEvent) -> ValidationResult<()> {
    validate_id("id", &event.id)?;
    validate_id("variant_id", &event.variant_id)?;
    validate_quantity(event.quantity)?;

    match (&event.from_location_id, &event.to_location_id) {
        (None, None) => Err(ValidationError::Required {
            field: "from_location_id or to_location_id".to_string(),
        }),
        (Some(from), Some(to)) if from == to => Err(ValidationError::InvalidFormat {
            field: "to_location_id".to_string(),
            reason: "must differ from from_location_id".to_string(),
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// Mutation Validators
// =============================================================================

/// Validates a local mutation before it is queued.
///
/// The payload must be a JSON object whose `id` (when present) matches the
/// target, and append mutations may only target the event ledger.
pub fn validate_mutation(mutation: &NewMutation) -> ValidationResult<()> {
    validate_id("target.id", &mutation.target.id)?;

    let Value::Object(map) = &mutation.payload else {
        return Err(ValidationError::InvalidFormat {
            field: "payload".to_string(),
            reason: "must be a JSON object".to_string(),
        });
    };

    if let Some(id) = map.get("id").and_then(Value::as_str) {
        if id != mutation.target.id {
            return Err(ValidationError::InvalidFormat {
                field: "payload.id".to_string(),
                reason: format!("'{}' does not match target '{}'", id, mutation.target.id),
            });
        }
    }

    match (mutation.op, mutation.target.kind) {
        (MutationOp::AppendEvent, EntityKind::Event) => {}
        (MutationOp::AppendEvent, kind) => {
            return Err(ValidationError::InvalidFormat {
                field: "op".to_string(),
                reason: format!("append_event cannot target a {}", kind),
            });
        }
        (MutationOp::Upsert, EntityKind::Event) => {
            return Err(ValidationError::InvalidFormat {
                field: "op".to_string(),
                reason: "movement events are append-only".to_string(),
            });
        }
        (MutationOp::Upsert, _) => {}
    }

    if let Some(fields) = &mutation.fields {
        if fields.is_empty() {
            return Err(ValidationError::Required {
                field: "fields".to_string(),
            });
        }
        if let Some(missing) = fields.iter().find(|f| !map.contains_key(f.as_str())) {
            return Err(ValidationError::InvalidFormat {
                field: "fields".to_string(),
                reason: format!("'{}' is not in the payload", missing),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityRef;
    use chrono::Utc;
    use serde_json::json;

    fn event(from: Option<&str>, to: Option<&str>, qty: i64) -> MovementEvent {
        MovementEvent {
            id: "e1".into(),
            variant_id: "v1".into(),
            from_location_id: from.map(String::from),
            to_location_id: to.map(String::from),
            quantity: qty,
            timestamp: Utc::now(),
            recorded_at: None,
            reference: None,
        }
    }

    #[test]
    fn test_validate_variant_code() {
        assert!(validate_variant_code("KRT-BLU-M").is_ok());
        assert!(validate_variant_code("sku_1.2/b").is_ok());

        assert!(validate_variant_code("").is_err());
        assert!(validate_variant_code("   ").is_err());
        assert!(validate_variant_code("has space").is_err());
        assert!(validate_variant_code(&"A".repeat(100)).is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-5).is_err());
    }

    #[test]
    fn test_validate_event_shapes() {
        assert!(validate_event(&event(None, Some("A"), 5)).is_ok());
        assert!(validate_event(&event(Some("A"), Some("B"), 5)).is_ok());
        assert!(validate_event(&event(Some("A"), None, 5)).is_ok());

        assert!(validate_event(&event(None, None, 5)).is_err());
        assert!(validate_event(&event(Some("A"), Some("A"), 5)).is_err());
        assert!(validate_event(&event(None, Some("A"), 0)).is_err());
    }

    #[test]
    fn test_validate_mutation() {
        let target = EntityRef::new(EntityKind::Variant, "v1");

        let ok = NewMutation::upsert(target.clone(), json!({"id": "v1", "code": "X-1"}))
            .with_fields(["code"]);
        assert!(validate_mutation(&ok).is_ok());

        let wrong_id = NewMutation::upsert(target.clone(), json!({"id": "v2"}));
        assert!(validate_mutation(&wrong_id).is_err());

        let not_object = NewMutation::upsert(target.clone(), json!([1, 2]));
        assert!(validate_mutation(&not_object).is_err());

        let missing_field = NewMutation::upsert(target, json!({"id": "v1"})).with_fields(["size"]);
        assert!(validate_mutation(&missing_field).is_err());

        let upsert_event =
            NewMutation::upsert(EntityRef::new(EntityKind::Event, "e1"), json!({"id": "e1"}));
        assert!(validate_mutation(&upsert_event).is_err());
    }
}
