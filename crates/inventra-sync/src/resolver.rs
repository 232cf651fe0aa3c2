//! # Conflict Resolver
//!
//! Persists conflicts found during a sync and carries out the configured
//! policy against the queue and the in-flight snapshot.
//!
//! ```text
//!   delta ──► detect(unsynced mutations) ──► record ──► policy
//!                                                         │
//!            ┌────────────────────────────────────────────┼──────────────────┐
//!            ▼                                            ▼                  ▼
//!      KeepLocal / Merged                            KeepRemote            Manual
//!      rebase payload + watermark                    mark failed           hold entity
//!      show merged entity                            show remote           show remote
//! ```
//!
//! A mutation is reconciled at most once against a given remote row, so a
//! rebased mutation does not re-conflict with the change it was merged onto.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use inventra_core::conflict::{self, apply_entity, MutationAction, SUPERSEDED};
use inventra_core::{
    CacheSnapshot, Conflict, ConflictResolution, Delta, EntityRef, QueuedMutation,
    ResolutionPolicy,
};
use inventra_db::{ConflictRepository, MutationQueueRepository};

/// Applies conflict policy on behalf of the engine.
pub struct ConflictResolver {
    conflicts: ConflictRepository,
    mutations: MutationQueueRepository,
    policy: ResolutionPolicy,
}

impl ConflictResolver {
    pub fn new(
        conflicts: ConflictRepository,
        mutations: MutationQueueRepository,
        policy: ResolutionPolicy,
    ) -> Self {
        ConflictResolver {
            conflicts,
            mutations,
            policy,
        }
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Detects and settles conflicts between unsynced mutations and `delta`.
    ///
    /// `snapshot` is the merged snapshot about to be committed; resolved
    /// entities are written into it. Returns the conflicts raised by this
    /// call, in their post-policy state.
    pub async fn reconcile(
        &self,
        delta: &Delta,
        snapshot: &mut CacheSnapshot,
        now: DateTime<Utc>,
    ) -> SyncResult<Vec<Conflict>> {
        let unsynced = self.mutations.list_unsynced().await?;
        if unsynced.is_empty() {
            return Ok(Vec::new());
        }

        let mut raised = Vec::new();
        for detected in conflict::detect(&unsynced, delta, now) {
            if self.already_reconciled(&detected).await? {
                continue;
            }
            let Some(mutation) = unsynced.iter().find(|m| m.id == detected.mutation_id) else {
                continue;
            };

            self.conflicts.record(&detected).await?;
            let kind = mutation.target.kind;
            let rebase_to = delta
                .watermarks
                .get(kind)
                .or_else(|| delta.changed_entity(&mutation.target).map(|(_, at)| at))
                .or(mutation.base_watermark);
            let settled = self
                .settle(detected, mutation, self.policy, snapshot, rebase_to, now)
                .await?;
            raised.push(settled);
        }

        if !raised.is_empty() {
            info!(count = raised.len(), policy = %self.policy, "Conflicts detected during sync");
        }
        Ok(raised)
    }

    /// Records a conflict reported by the remote while delivering `mutation`.
    ///
    /// The remote side of the conflict is whatever the snapshot currently
    /// holds for the entity.
    pub async fn route_remote_conflict(
        &self,
        mutation: &QueuedMutation,
        message: &str,
        snapshot: &mut CacheSnapshot,
        now: DateTime<Utc>,
    ) -> SyncResult<Conflict> {
        let open = self.conflicts.list_for_mutation(&mutation.id).await?;
        if let Some(existing) = open.into_iter().find(Conflict::is_open) {
            return Ok(existing);
        }

        let detected = Conflict {
            id: Uuid::new_v4().to_string(),
            target: mutation.target.clone(),
            mutation_id: mutation.id.clone(),
            local_value: mutation.payload.clone(),
            remote_value: snapshot.entity_json(&mutation.target).unwrap_or(Value::Null),
            detected_at: now,
            resolution: ConflictResolution::Unresolved,
            resolved_at: None,
            note: Some(message.to_string()),
        };
        self.conflicts.record(&detected).await?;

        let rebase_to = snapshot
            .watermark_for(mutation.target.kind)
            .or(mutation.base_watermark);
        self.settle(detected, mutation, self.policy, snapshot, rebase_to, now)
            .await
    }

    /// Closes an open conflict with an operator-chosen policy.
    ///
    /// ## Errors
    /// * `SyncError::NotFound` - unknown conflict or its mutation is gone
    /// * `SyncError::Resolution` - manual policy, or already closed
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        policy: ResolutionPolicy,
        snapshot: &mut CacheSnapshot,
        now: DateTime<Utc>,
    ) -> SyncResult<Conflict> {
        if policy == ResolutionPolicy::Manual {
            return Err(SyncError::Resolution(
                "manual policy does not close a conflict".to_string(),
            ));
        }

        let open = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                entity: "conflict".to_string(),
                id: conflict_id.to_string(),
            })?;
        let mutation = self
            .mutations
            .get(&open.mutation_id)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                entity: "mutation".to_string(),
                id: open.mutation_id.clone(),
            })?;

        let rebase_to = snapshot
            .watermark_for(mutation.target.kind)
            .or(mutation.base_watermark);
        self.settle(open, &mutation, policy, snapshot, rebase_to, now)
            .await
    }

    /// Entities whose mutations must not be delivered yet.
    pub async fn held_entities(&self) -> SyncResult<HashSet<EntityRef>> {
        Ok(self
            .conflicts
            .list_open()
            .await?
            .into_iter()
            .map(|c| c.target)
            .collect())
    }

    pub async fn open_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        Ok(self.conflicts.list_open().await?)
    }

    pub async fn open_count(&self) -> SyncResult<i64> {
        Ok(self.conflicts.count_open().await?)
    }

    async fn already_reconciled(&self, detected: &Conflict) -> SyncResult<bool> {
        let previous = self.conflicts.list_for_mutation(&detected.mutation_id).await?;
        Ok(previous
            .iter()
            .any(|c| c.is_open() || c.remote_value == detected.remote_value))
    }

    async fn settle(
        &self,
        mut open: Conflict,
        mutation: &QueuedMutation,
        policy: ResolutionPolicy,
        snapshot: &mut CacheSnapshot,
        rebase_to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SyncResult<Conflict> {
        let resolved = conflict::resolve(&open, policy, mutation)?;

        let recorded = self
            .conflicts
            .resolve(&open.id, resolved.resolution, policy, &resolved.note, now)
            .await?;
        if !recorded {
            return Err(SyncError::Resolution(format!(
                "conflict {} is already closed",
                open.id
            )));
        }

        match &resolved.action {
            MutationAction::Requeue { payload } => {
                self.mutations
                    .rebase(&mutation.id, payload, rebase_to, now)
                    .await?;
            }
            MutationAction::Supersede => {
                self.mutations.mark_failed(&mutation.id, SUPERSEDED, now).await?;
            }
            MutationAction::Hold => {}
        }

        if !resolved.entity.is_null() {
            if let Err(e) = apply_entity(snapshot, &open.target, &resolved.entity) {
                warn!(entity = %open.target, error = %e, "Resolved entity not shown in snapshot");
            }
        }

        info!(
            conflict_id = %open.id,
            entity = %open.target,
            resolution = resolved.resolution.as_str(),
            "Conflict settled"
        );

        open.resolution = resolved.resolution;
        open.resolved_at = (resolved.resolution != ConflictResolution::Unresolved).then_some(now);
        open.note = Some(resolved.note);
        Ok(open)
    }
}
