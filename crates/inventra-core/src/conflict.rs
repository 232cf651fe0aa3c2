//! # Conflict Detection & Resolution
//!
//! Decides when a queued local change and a remote change collide, and what
//! each resolution policy does to the entity and to the queued mutation.
//!
//! ## Detection
//! ```text
//! for each mutation m with status pending | syncing and op = upsert:
//!     remote row r = delta row for m.target      (none → no conflict)
//!     r.changed_at <= m.base_watermark           → no conflict (already seen)
//!     m.fields = None                            → conflict (identity)
//!     m.fields = [f..] and some r[f] != m[f]     → conflict (field-level)
//! ```
//! Movement events are append-only facts and never conflict.
//!
//! ## Resolution
//! ```text
//! ┌─────────────┬──────────────────────────────┬──────────────────────────────┐
//! │ Policy      │ Entity state                 │ Queued mutation              │
//! ├─────────────┼──────────────────────────────┼──────────────────────────────┤
//! │ KeepLocal   │ local overlaid on remote     │ requeued with merged payload │
//! │             │ (KeepLocal or Merged)        │ and a rebased watermark      │
//! │ KeepRemote  │ remote                       │ failed: "superseded"         │
//! │ Manual      │ remote for now (Unresolved)  │ held until an operator acts  │
//! └─────────────┴──────────────────────────────┴──────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::delta::upsert_rows;
use crate::delta::MergeStats;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{
    CacheSnapshot, Conflict, ConflictResolution, Delta, EntityKind, EntityRef, MutationOp,
    QueuedMutation, ResolutionPolicy,
};

/// Reason recorded on a mutation discarded by keep-remote.
pub const SUPERSEDED: &str = "superseded";

// =============================================================================
// Detection
// =============================================================================

/// Finds conflicts between queued mutations and a freshly fetched delta.
///
/// At most one conflict is produced per mutation.
///
/// `base_watermark` is the target collection's watermark when the change
/// was queued. Delta windows are inclusive, so rows stamped exactly at that
/// mark come back on every fetch; they were already in the snapshot the
/// change was made against and are not remote edits.
pub fn detect(pending: &[QueuedMutation], delta: &Delta, now: DateTime<Utc>) -> Vec<Conflict> {
    pending
        .iter()
        .filter(|m| m.status.is_unsynced() && m.op == MutationOp::Upsert)
        .filter_map(|m| {
            let (remote, changed_at) = delta.changed_entity(&m.target)?;

            if let Some(base) = m.base_watermark {
                if changed_at <= base {
                    return None;
                }
            }

            if let Some(fields) = &m.fields {
                let diverged = fields
                    .iter()
                    .any(|f| remote.get(f.as_str()) != m.payload.get(f.as_str()));
                if !diverged {
                    return None;
                }
            }

            Some(Conflict {
                id: Uuid::new_v4().to_string(),
                target: m.target.clone(),
                mutation_id: m.id.clone(),
                local_value: m.payload.clone(),
                remote_value: remote,
                detected_at: now,
                resolution: ConflictResolution::Unresolved,
                resolved_at: None,
                note: None,
            })
        })
        .collect()
}

// =============================================================================
// Resolution
// =============================================================================

/// What happens to the queued mutation after a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MutationAction {
    /// Keep delivering, now with this payload.
    Requeue { payload: Value },
    /// Mark failed with [`SUPERSEDED`].
    Supersede,
    /// Leave queued but do not deliver.
    Hold,
}

/// The outcome of applying a policy to a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolved {
    pub resolution: ConflictResolution,
    /// Entity state to show until the next sync.
    pub entity: Value,
    pub action: MutationAction,
    pub note: String,
}

/// Applies `policy` to an open conflict.
pub fn resolve(
    conflict: &Conflict,
    policy: ResolutionPolicy,
    mutation: &QueuedMutation,
) -> CoreResult<Resolved> {
    if conflict.mutation_id != mutation.id {
        return Err(CoreError::MutationMismatch {
            conflict_id: conflict.id.clone(),
            mutation_id: mutation.id.clone(),
        });
    }
    if !conflict.is_open() {
        return Err(CoreError::AlreadyResolved(conflict.id.clone()));
    }

    match policy {
        ResolutionPolicy::KeepLocal => {
            let merged = overlay(
                &conflict.target,
                &conflict.remote_value,
                &mutation.payload,
                mutation.fields.as_deref(),
            )?;
            let resolution = if merged == mutation.payload {
                ConflictResolution::KeepLocal
            } else {
                ConflictResolution::Merged
            };
            Ok(Resolved {
                resolution,
                entity: merged.clone(),
                action: MutationAction::Requeue { payload: merged },
                note: format!("local change re-applied over remote ({})", resolution.as_str()),
            })
        }
        ResolutionPolicy::KeepRemote => Ok(Resolved {
            resolution: ConflictResolution::KeepRemote,
            entity: conflict.remote_value.clone(),
            action: MutationAction::Supersede,
            note: SUPERSEDED.to_string(),
        }),
        ResolutionPolicy::Manual => Ok(Resolved {
            resolution: ConflictResolution::Unresolved,
            entity: conflict.remote_value.clone(),
            action: MutationAction::Hold,
            note: "awaiting operator decision".to_string(),
        }),
    }
}

/// Overlays local fields onto the remote row.
///
/// With `fields` only those keys are taken from `local`; otherwise every key
/// in `local` wins.
pub fn overlay(
    target: &EntityRef,
    remote: &Value,
    local: &Value,
    fields: Option<&[String]>,
) -> CoreResult<Value> {
    let not_mergeable = |reason: &str| CoreError::NotMergeable {
        entity: target.to_string(),
        reason: reason.to_string(),
    };

    let mut merged: Map<String, Value> = match remote {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(not_mergeable("remote value is not an object")),
    };
    let Value::Object(local) = local else {
        return Err(not_mergeable("local value is not an object"));
    };

    for (key, value) in local {
        let take = fields.map_or(true, |fs| fs.iter().any(|f| f == key) || key == "id");
        if take {
            merged.insert(key.clone(), value.clone());
        }
    }

    Ok(Value::Object(merged))
}

/// Writes a resolved entity into a snapshot (row-level replace by id).
pub fn apply_entity(
    snapshot: &mut CacheSnapshot,
    target: &EntityRef,
    entity: &Value,
) -> CoreResult<()> {
    fn decode<T: serde::de::DeserializeOwned>(target: &EntityRef, entity: &Value) -> CoreResult<T> {
        serde_json::from_value(entity.clone()).map_err(|e| {
            CoreError::Validation(ValidationError::InvalidFormat {
                field: target.to_string(),
                reason: e.to_string(),
            })
        })
    }

    let mut stats = MergeStats::default();
    match target.kind {
        EntityKind::Product => {
            upsert_rows(&mut snapshot.products, &[decode(target, entity)?], &mut stats)
        }
        EntityKind::Variant => {
            upsert_rows(&mut snapshot.variants, &[decode(target, entity)?], &mut stats)
        }
        EntityKind::Location => {
            upsert_rows(&mut snapshot.locations, &[decode(target, entity)?], &mut stats)
        }
        EntityKind::Event => {
            return Err(CoreError::NotMergeable {
                entity: target.to_string(),
                reason: "movement events are append-only".to_string(),
            })
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
    use crate::types::{MutationStatus, NewMutation, Product};
    use chrono::TimeZone;
    use serde_json::json;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn product(name: &str, category: Option<&str>, at: DateTime<Utc>) -> Product {
        Product {
            id: "p1".into(),
            name: name.into(),
            category: category.map(String::from),
            updated_at: at,
        }
    }

    fn queued(payload: Value, fields: Option<&[&str]>, base: Option<DateTime<Utc>>) -> QueuedMutation {
        let mut new = NewMutation::upsert(EntityRef::new(EntityKind::Product, "p1"), payload);
        if let Some(fields) = fields {
            new = new.with_fields(fields.iter().copied());
        }
        new.into_queued(base, t(1))
    }

    fn delta_with(p: Product) -> Delta {
        Delta::new(Some(t(1)), vec![p], vec![], vec![], vec![])
    }

    #[test]
    fn test_one_conflict_per_mutation_on_changed_entity() {
        let m = queued(json!({"id": "p1", "name": "Local"}), None, Some(t(1)));
        let delta = delta_with(product("Remote", None, t(2)));

        let conflicts = detect(&[m.clone()], &delta, t(3));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].target, m.target);
        assert_eq!(conflicts[0].mutation_id, m.id);
        assert_eq!(conflicts[0].resolution, ConflictResolution::Unresolved);
    }

    #[test]
    fn test_remote_change_before_base_is_ignored() {
        let m = queued(json!({"id": "p1", "name": "Local"}), None, Some(t(5)));
        let delta = delta_with(product("Remote", None, t(2)));
        assert!(detect(&[m], &delta, t(6)).is_empty());
    }

    #[test]
    fn test_row_at_base_watermark_is_not_a_remote_change() {
        let m = queued(json!({"id": "p1", "name": "Local"}), None, Some(t(2)));
        let unchanged = delta_with(product("Remote", None, t(2)));
        assert!(detect(&[m.clone()], &unchanged, t(3)).is_empty());

        let edited = delta_with(product("Remote", None, t(2) + chrono::Duration::seconds(1)));
        assert_eq!(detect(&[m], &edited, t(3)).len(), 1);
    }

    #[test]
    fn test_synced_and_event_mutations_never_conflict() {
        let mut m = queued(json!({"id": "p1", "name": "Local"}), None, None);
        m.status = MutationStatus::Synced;
        let delta = delta_with(product("Remote", None, t(2)));
        assert!(detect(&[m], &delta, t(3)).is_empty());
    }

    #[test]
    fn test_field_level_only_conflicts_on_listed_fields() {
        let m = queued(json!({"id": "p1", "category": "Winter"}), Some(&["category"]), Some(t(1)));

        let same_field = delta_with(product("Renamed", Some("Winter"), t(2)));
        assert!(detect(&[m.clone()], &same_field, t(3)).is_empty());

        let diverged = delta_with(product("Renamed", Some("Summer"), t(2)));
        assert_eq!(detect(&[m], &diverged, t(3)).len(), 1);
    }

    #[test]
    fn test_keep_local_overlays_onto_remote() {
        let m = queued(json!({"id": "p1", "category": "Winter"}), Some(&["category"]), Some(t(1)));
        let delta = delta_with(product("Renamed", Some("Summer"), t(2)));
        let conflict = detect(&[m.clone()], &delta, t(3)).remove(0);

        let resolved = resolve(&conflict, ResolutionPolicy::KeepLocal, &m).unwrap();
        assert_eq!(resolved.resolution, ConflictResolution::Merged);
        assert_eq!(resolved.entity["name"], "Renamed");
        assert_eq!(resolved.entity["category"], "Winter");
        assert!(matches!(resolved.action, MutationAction::Requeue { .. }));
    }

    #[test]
    fn test_keep_remote_supersedes() {
        let m = queued(json!({"id": "p1", "name": "Local"}), None, None);
        let conflict = detect(&[m.clone()], &delta_with(product("Remote", None, t(2))), t(3)).remove(0);

        let resolved = resolve(&conflict, ResolutionPolicy::KeepRemote, &m).unwrap();
        assert_eq!(resolved.resolution, ConflictResolution::KeepRemote);
        assert_eq!(resolved.action, MutationAction::Supersede);
        assert_eq!(resolved.note, SUPERSEDED);
        assert_eq!(resolved.entity["name"], "Remote");
    }

    #[test]
    fn test_manual_holds_and_shows_remote() {
        let m = queued(json!({"id": "p1", "name": "Local"}), None, None);
        let conflict = detect(&[m.clone()], &delta_with(product("Remote", None, t(2))), t(3)).remove(0);

        let resolved = resolve(&conflict, ResolutionPolicy::Manual, &m).unwrap();
        assert_eq!(resolved.resolution, ConflictResolution::Unresolved);
        assert_eq!(resolved.action, MutationAction::Hold);
        assert_eq!(resolved.entity["name"], "Remote");
    }

    #[test]
    fn test_resolve_rejects_wrong_mutation_and_closed_conflict() {
        let m = queued(json!({"id": "p1", "name": "Local"}), None, None);
        let other = queued(json!({"id": "p1", "name": "Other"}), None, None);
        let mut conflict = detect(&[m.clone()], &delta_with(product("Remote", None, t(2))), t(3)).remove(0);

        assert!(matches!(
            resolve(&conflict, ResolutionPolicy::KeepRemote, &other),
            Err(CoreError::MutationMismatch { .. })
        ));

        conflict.resolution = ConflictResolution::KeepRemote;
        assert!(matches!(
            resolve(&conflict, ResolutionPolicy::KeepRemote, &m),
            Err(CoreError::AlreadyResolved(_))
        ));
    }

    #[test]
    fn test_apply_entity_replaces_row() {
        let mut snapshot = CacheSnapshot::empty(t(1));
        snapshot.products.push(product("Old", None, t(1)));
        let entity = serde_json::to_value(product("New", Some("Winter"), t(2))).unwrap();

        apply_entity(&mut snapshot, &EntityRef::new(EntityKind::Product, "p1"), &entity).unwrap();
        assert_eq!(snapshot.products.len(), 1);
        assert_eq!(snapshot.products[0].name, "New");
    }
}
