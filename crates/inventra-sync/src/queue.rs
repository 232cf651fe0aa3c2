//! # Mutation Queue
//!
//! Delivers queued local writes to the remote, in order, at most once with
//! effect.
//!
//! ## Drain Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  for m in unsynced mutations (FIFO by seq):                            │
//! │                                                                         │
//! │    entity blocked earlier in this drain?  → Deferred(EntityBlocked)    │
//! │    entity held by an open conflict?       → Deferred(Held)             │
//! │    next_attempt_at in the future?         → Deferred(Backoff)          │
//! │                                                                         │
//! │    claim (pending → syncing, attempt + 1)                               │
//! │    upsert with deadline                                                 │
//! │      ├─ ack            → synced                 Delivered               │
//! │      ├─ conflict (409) → pending, uncounted     Conflict  ─► resolver  │
//! │      ├─ validation     → failed                 Failed                  │
//! │      ├─ auth           → pending, uncounted     Halted, stop drain      │
//! │      └─ transient      → pending + backoff      Retrying                │
//! │                          (attempts == max → failed)                     │
//! │                                                                         │
//! │    uncounted: the claim's attempt is refunded, only transient failures │
//! │    spend the retry budget                                               │
//! │                                                                         │
//! │    anything but Delivered blocks later entries for the same entity     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One drain at a time per queue; a second concurrent drain gets
//! `SyncError::DrainInProgress` instead of racing the first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteBackend;
use inventra_core::validation::validate_mutation;
use inventra_core::{EntityRef, MutationStatus, NewMutation, QueueStats, QueuedMutation};
use inventra_db::MutationQueueRepository;

// =============================================================================
// Retry Policy
// =============================================================================

/// Delivery retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub rate_limit_multiplier: u32,
    pub delivery_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 8,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            rate_limit_multiplier: 4,
            delivery_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        RetryPolicy {
            max_attempts: config.queue.max_attempts,
            initial_backoff: Duration::from_millis(config.queue.initial_backoff_ms),
            max_backoff: Duration::from_secs(config.queue.max_backoff_secs),
            rate_limit_multiplier: config.queue.rate_limit_multiplier,
            delivery_timeout: config.delivery_timeout(),
        }
    }

    /// Wait before the next attempt after `attempt` failures.
    ///
    /// No jitter, so a given attempt always maps to the same delay.
    pub fn delay_for(&self, attempt: i64, error: &SyncError) -> Duration {
        let mut schedule = ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut delay = self.initial_backoff;
        for _ in 0..attempt.max(1) {
            delay = schedule.next_backoff().unwrap_or(self.max_backoff);
        }

        match error {
            SyncError::RateLimited { retry_after } => {
                let stretched = delay.saturating_mul(self.rate_limit_multiplier);
                retry_after.map_or(stretched, |hint| hint.max(stretched))
            }
            _ => delay,
        }
    }
}

// =============================================================================
// Drain Outcomes
// =============================================================================

/// Why a mutation was skipped in a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// Still inside its retry backoff.
    Backoff,
    /// An earlier mutation for the same entity did not go through.
    EntityBlocked,
    /// The entity has an open conflict awaiting an operator.
    Held,
}

/// What happened to one mutation during a drain.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Delivered {
        mutation_id: String,
        duplicate: bool,
    },
    Retrying {
        mutation_id: String,
        attempt: i64,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        mutation_id: String,
        error: String,
    },
    /// The remote reported a conflict; the mutation is pending again.
    Conflict {
        mutation: QueuedMutation,
        message: String,
    },
    /// Credentials were rejected; the mutation is pending again and the
    /// drain stopped.
    Halted {
        mutation_id: String,
        error: String,
    },
    Deferred {
        mutation_id: String,
        reason: DeferReason,
    },
}

impl DrainOutcome {
    pub fn mutation_id(&self) -> &str {
        match self {
            DrainOutcome::Delivered { mutation_id, .. }
            | DrainOutcome::Retrying { mutation_id, .. }
            | DrainOutcome::Failed { mutation_id, .. }
            | DrainOutcome::Halted { mutation_id, .. }
            | DrainOutcome::Deferred { mutation_id, .. } => mutation_id,
            DrainOutcome::Conflict { mutation, .. } => &mutation.id,
        }
    }
}

/// Result of one drain.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub outcomes: Vec<DrainOutcome>,
    /// Set when the drain stopped early (e.g. credentials rejected).
    pub halted: Option<String>,
}

impl DrainReport {
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DrainOutcome::Delivered { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DrainOutcome::Failed { .. }))
            .count()
    }

    /// Mutations the remote reported as conflicting.
    pub fn conflicts(&self) -> impl Iterator<Item = (&QueuedMutation, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            DrainOutcome::Conflict { mutation, message } => Some((mutation, message.as_str())),
            _ => None,
        })
    }
}

// =============================================================================
// Mutation Queue
// =============================================================================

/// Durable queue of local writes.
pub struct MutationQueue {
    repo: MutationQueueRepository,
    backend: Arc<dyn RemoteBackend>,
    policy: RetryPolicy,
    drain_lock: Mutex<()>,
}

impl MutationQueue {
    /// Opens the queue, returning entries stranded in `syncing` to `pending`.
    pub async fn open(
        repo: MutationQueueRepository,
        backend: Arc<dyn RemoteBackend>,
        policy: RetryPolicy,
    ) -> SyncResult<Self> {
        let recovered = repo.recover_in_flight(Utc::now()).await?;
        if recovered > 0 {
            info!(recovered, "Requeued mutations interrupted mid-delivery");
        }

        Ok(MutationQueue {
            repo,
            backend,
            policy,
            drain_lock: Mutex::new(()),
        })
    }

    /// Validates and appends a mutation.
    ///
    /// A mutation whose idempotency key is already queued returns the
    /// existing entry unchanged.
    pub async fn enqueue(
        &self,
        mutation: NewMutation,
        base_watermark: Option<DateTime<Utc>>,
    ) -> SyncResult<QueuedMutation> {
        validate_mutation(&mutation)?;

        let queued = mutation.into_queued(base_watermark, Utc::now());
        let (stored, inserted) = self.repo.enqueue(&queued).await?;

        if inserted {
            debug!(
                mutation_id = %stored.id,
                entity = %stored.target,
                key = %stored.idempotency_key,
                "Mutation queued"
            );
        } else {
            debug!(
                mutation_id = %stored.id,
                key = %stored.idempotency_key,
                "Duplicate idempotency key, returning existing entry"
            );
        }
        Ok(stored)
    }

    /// Delivers eligible mutations now.
    pub async fn drain(&self, held: &HashSet<EntityRef>) -> SyncResult<DrainReport> {
        self.drain_at(held, Utc::now()).await
    }

    /// Delivers mutations eligible at `now`.
    pub async fn drain_at(
        &self,
        held: &HashSet<EntityRef>,
        now: DateTime<Utc>,
    ) -> SyncResult<DrainReport> {
        let _guard = self.drain_lock.try_lock().map_err(|_| SyncError::DrainInProgress)?;

        let mut report = DrainReport::default();
        let mut blocked: HashSet<EntityRef> = HashSet::new();

        for mutation in self.repo.list_unsynced().await? {
            if mutation.status != MutationStatus::Pending {
                continue;
            }

            let reason = if blocked.contains(&mutation.target) {
                Some(DeferReason::EntityBlocked)
            } else if held.contains(&mutation.target) {
                Some(DeferReason::Held)
            } else if mutation.next_attempt_at.is_some_and(|at| at > now) {
                Some(DeferReason::Backoff)
            } else {
                None
            };
            if let Some(reason) = reason {
                blocked.insert(mutation.target.clone());
                report.outcomes.push(DrainOutcome::Deferred {
                    mutation_id: mutation.id,
                    reason,
                });
                continue;
            }

            let Some(claimed) = self.repo.claim(&mutation.id, now).await? else {
                continue;
            };

            let (outcome, halt) = self.deliver(claimed, now).await?;
            if !matches!(outcome, DrainOutcome::Delivered { .. }) {
                blocked.insert(mutation.target.clone());
            }
            report.outcomes.push(outcome);

            if let Some(reason) = halt {
                warn!(reason = %reason, "Credentials rejected, stopping drain");
                report.halted = Some(reason);
                break;
            }
        }

        if !report.outcomes.is_empty() {
            info!(
                delivered = report.delivered(),
                failed = report.failed(),
                total = report.outcomes.len(),
                "Queue drained"
            );
        }
        Ok(report)
    }

    /// Sends one claimed mutation and records the result.
    ///
    /// The second value is set when the whole drain must stop.
    async fn deliver(
        &self,
        claimed: QueuedMutation,
        now: DateTime<Utc>,
    ) -> SyncResult<(DrainOutcome, Option<String>)> {
        let result = match tokio::time::timeout(
            self.policy.delivery_timeout,
            self.backend.upsert(&claimed),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "delivery of {} after {}s",
                claimed.id,
                self.policy.delivery_timeout.as_secs()
            ))),
        };

        let id = claimed.id.clone();
        match result {
            Ok(ack) => {
                self.repo.mark_synced(&id, now).await?;
                let outcome = DrainOutcome::Delivered {
                    mutation_id: id,
                    duplicate: ack.duplicate,
                };
                Ok((outcome, None))
            }
            Err(SyncError::Conflict { message, .. }) => {
                self.repo.release_uncounted(&id, &message, now).await?;
                warn!(mutation_id = %id, entity = %claimed.target, "Remote reported a conflict");
                Ok((DrainOutcome::Conflict { mutation: claimed, message }, None))
            }
            Err(err @ SyncError::Auth(_)) => {
                let error = err.to_string();
                self.repo.release_uncounted(&id, &error, now).await?;
                let outcome = DrainOutcome::Halted {
                    mutation_id: id,
                    error: error.clone(),
                };
                Ok((outcome, Some(error)))
            }
            Err(err) if err.is_retryable() => {
                if claimed.attempt_count >= self.policy.max_attempts {
                    let error = format!("gave up after {} attempts: {err}", claimed.attempt_count);
                    self.repo.mark_failed(&id, &error, now).await?;
                    return Ok((DrainOutcome::Failed { mutation_id: id, error }, None));
                }

                let delay = self.policy.delay_for(claimed.attempt_count, &err);
                let next_attempt_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
                let error = err.to_string();
                self.repo
                    .release_for_retry(&id, &error, Some(next_attempt_at), now)
                    .await?;

                debug!(
                    mutation_id = %id,
                    attempt = claimed.attempt_count,
                    ?delay,
                    error = %error,
                    "Delivery failed, will retry"
                );
                let outcome = DrainOutcome::Retrying {
                    mutation_id: id,
                    attempt: claimed.attempt_count,
                    next_attempt_at,
                    error,
                };
                Ok((outcome, None))
            }
            Err(err) => {
                let error = err.to_string();
                self.repo.mark_failed(&id, &error, now).await?;
                Ok((DrainOutcome::Failed { mutation_id: id, error }, None))
            }
        }
    }

    pub async fn stats(&self) -> SyncResult<QueueStats> {
        Ok(self.repo.stats().await?)
    }

    /// Removes synced entries.
    pub async fn prune(&self) -> SyncResult<u64> {
        Ok(self.repo.prune().await?)
    }

    pub async fn get(&self, id: &str) -> SyncResult<Option<QueuedMutation>> {
        Ok(self.repo.get(id).await?)
    }

    /// Mutations that exhausted their retries or were rejected.
    pub async fn failed(&self) -> SyncResult<Vec<QueuedMutation>> {
        Ok(self.repo.list_by_status(MutationStatus::Failed).await?)
    }

    pub fn repository(&self) -> &MutationQueueRepository {
        &self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InjectedFailure, MemoryBackend, RequestOp};
    use inventra_core::{EntityKind, MovementEvent};
    use inventra_db::{Database, DbConfig};
    use serde_json::json;

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn queue(policy: RetryPolicy) -> (MutationQueue, Arc<MemoryBackend>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(MemoryBackend::new());
        let queue = MutationQueue::open(db.mutations(), remote.clone(), policy)
            .await
            .unwrap();
        (queue, remote)
    }

    fn rename(id: &str, name: &str) -> NewMutation {
        NewMutation::upsert(
            EntityRef::new(EntityKind::Product, id),
            json!({"id": id, "name": name, "updated_at": "2024-03-01T08:00:00Z"}),
        )
    }

    fn none_held() -> HashSet<EntityRef> {
        HashSet::new()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        let net = SyncError::Network("down".into());

        assert_eq!(policy.delay_for(1, &net), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, &net), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, &net), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10, &net), Duration::from_secs(10));
    }

    #[test]
    fn test_rate_limit_waits_longer() {
        let policy = RetryPolicy::default();
        let net = SyncError::Network("down".into());
        let limited = SyncError::RateLimited { retry_after: None };
        assert!(policy.delay_for(1, &limited) > policy.delay_for(1, &net));

        let hinted = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        };
        assert_eq!(policy.delay_for(1, &hinted), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_two_transient_failures_then_synced() {
        let (queue, remote) = queue(no_wait()).await;
        remote.fail_next(RequestOp::Upsert, 2, InjectedFailure::Network);

        let m = queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        for _ in 0..3 {
            queue.drain(&none_held()).await.unwrap();
        }

        let stored = queue.get(&m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MutationStatus::Synced);
        assert_eq!(stored.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_backoff_defers_until_due() {
        let (queue, remote) = queue(RetryPolicy::default()).await;
        remote.fail_next(RequestOp::Upsert, 1, InjectedFailure::Network);
        let m = queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        let now = Utc::now();
        let first = queue.drain_at(&none_held(), now).await.unwrap();
        assert!(matches!(first.outcomes[0], DrainOutcome::Retrying { attempt: 1, .. }));

        let early = queue.drain_at(&none_held(), now).await.unwrap();
        assert!(matches!(
            early.outcomes[0],
            DrainOutcome::Deferred { reason: DeferReason::Backoff, .. }
        ));

        let later = queue
            .drain_at(&none_held(), now + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(later.delivered(), 1);
        assert_eq!(queue.get(&m.id).await.unwrap().unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_same_key_delivers_once() {
        let (queue, remote) = queue(no_wait()).await;

        let a = queue.enqueue(rename("p1", "Tee").with_idempotency_key("k1"), None).await.unwrap();
        let b = queue.enqueue(rename("p1", "Tee").with_idempotency_key("k1"), None).await.unwrap();
        assert_eq!(a.id, b.id);

        queue.drain(&none_held()).await.unwrap();
        queue.drain(&none_held()).await.unwrap();

        assert_eq!(remote.request_count(RequestOp::Upsert, EntityKind::Product), 1);
        assert_eq!(queue.stats().await.unwrap().synced, 1);
    }

    #[tokio::test]
    async fn test_ceiling_marks_failed() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..no_wait()
        };
        let (queue, remote) = queue(policy).await;
        remote.fail_next(RequestOp::Upsert, 5, InjectedFailure::Timeout);
        let m = queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        queue.drain(&none_held()).await.unwrap();
        let last = queue.drain(&none_held()).await.unwrap();

        assert!(matches!(last.outcomes[0], DrainOutcome::Failed { .. }));
        let stored = queue.get(&m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MutationStatus::Failed);
        assert!(stored.last_error.unwrap().contains("gave up after 2 attempts"));

        // Failed entries are never redelivered.
        queue.drain(&none_held()).await.unwrap();
        assert_eq!(remote.request_count(RequestOp::Upsert, EntityKind::Product), 2);
    }

    #[tokio::test]
    async fn test_validation_failure_is_immediate() {
        let (queue, remote) = queue(no_wait()).await;
        remote.fail_next(RequestOp::Upsert, 1, InjectedFailure::Validation("bad name".into()));
        let m = queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        let report = queue.drain(&none_held()).await.unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(queue.get(&m.id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_malformed_mutation_is_rejected_at_enqueue() {
        let (queue, _) = queue(no_wait()).await;
        let bad = NewMutation::upsert(
            EntityRef::new(EntityKind::Product, "p1"),
            json!({"id": "p2", "name": "Wrong id"}),
        );
        let err = queue.enqueue(bad, None).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(queue.stats().await.unwrap().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_failed_entity_blocks_later_entries() {
        let (queue, remote) = queue(RetryPolicy::default()).await;
        remote.fail_next(RequestOp::Upsert, 1, InjectedFailure::Network);

        queue.enqueue(rename("p1", "First"), None).await.unwrap();
        queue.enqueue(rename("p1", "Second"), None).await.unwrap();
        queue.enqueue(rename("p2", "Other"), None).await.unwrap();

        let report = queue.drain(&none_held()).await.unwrap();
        assert!(matches!(report.outcomes[0], DrainOutcome::Retrying { .. }));
        assert!(matches!(
            report.outcomes[1],
            DrainOutcome::Deferred { reason: DeferReason::EntityBlocked, .. }
        ));
        assert!(matches!(report.outcomes[2], DrainOutcome::Delivered { .. }));

        // The remote never saw "Second" overtake "First".
        assert!(remote.rows(EntityKind::Product).iter().all(|r| r["id"] != "p1"));
    }

    #[tokio::test]
    async fn test_held_entity_is_not_delivered() {
        let (queue, remote) = queue(no_wait()).await;
        queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        let held: HashSet<EntityRef> = [EntityRef::new(EntityKind::Product, "p1")].into_iter().collect();
        let report = queue.drain(&held).await.unwrap();

        assert!(matches!(
            report.outcomes[0],
            DrainOutcome::Deferred { reason: DeferReason::Held, .. }
        ));
        assert!(remote.requests().is_empty());
    }

    #[tokio::test]
    async fn test_remote_conflict_returns_to_pending() {
        let (queue, remote) = queue(no_wait()).await;
        remote.fail_next(RequestOp::Upsert, 1, InjectedFailure::Conflict("stale".into()));
        let m = queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        let report = queue.drain(&none_held()).await.unwrap();
        let conflicts: Vec<_> = report.conflicts().collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].0.id, m.id);
        assert_eq!(queue.get(&m.id).await.unwrap().unwrap().status, MutationStatus::Pending);
    }

    #[tokio::test]
    async fn test_auth_failure_halts_drain() {
        let (queue, remote) = queue(no_wait()).await;
        remote.fail_next(RequestOp::Upsert, 1, InjectedFailure::Auth);
        queue.enqueue(rename("p1", "Tee"), None).await.unwrap();
        queue.enqueue(rename("p2", "Cap"), None).await.unwrap();

        let report = queue.drain(&none_held()).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(report.outcomes[0], DrainOutcome::Halted { .. }));
        assert!(report.halted.is_some());
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_auth_failures_do_not_spend_retry_budget() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..no_wait()
        };
        let (queue, remote) = queue(policy).await;
        remote.fail_next(RequestOp::Upsert, 5, InjectedFailure::Auth);
        let m = queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        for _ in 0..5 {
            let report = queue.drain(&none_held()).await.unwrap();
            assert!(report.halted.is_some());
        }

        let stored = queue.get(&m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MutationStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(stored.next_attempt_at, None);

        // Credentials fixed: the full budget is still there.
        assert_eq!(queue.drain(&none_held()).await.unwrap().delivered(), 1);
    }

    #[tokio::test]
    async fn test_conflict_at_ceiling_still_goes_to_resolver() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..no_wait()
        };
        let (queue, remote) = queue(policy).await;
        remote.fail_next(RequestOp::Upsert, 3, InjectedFailure::Conflict("stale".into()));
        let m = queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        for _ in 0..3 {
            let report = queue.drain(&none_held()).await.unwrap();
            assert_eq!(report.conflicts().count(), 1);
            assert_eq!(report.failed(), 0);
        }

        let stored = queue.get(&m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MutationStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_rejected() {
        let (queue, remote) = queue(no_wait()).await;
        remote.set_latency(Some(Duration::from_millis(50)));
        queue.enqueue(rename("p1", "Tee"), None).await.unwrap();

        let held = none_held();
        let (first, second) = tokio::join!(queue.drain(&held), async {
            tokio::task::yield_now().await;
            queue.drain(&held).await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::DrainInProgress)));
    }

    #[tokio::test]
    async fn test_events_append_once() {
        let (queue, remote) = queue(no_wait()).await;
        let event = MovementEvent {
            id: "e1".into(),
            variant_id: "v1".into(),
            from_location_id: None,
            to_location_id: Some("a".into()),
            quantity: 5,
            timestamp: Utc::now(),
            recorded_at: None,
            reference: None,
        };

        queue.enqueue(NewMutation::append_event(&event), None).await.unwrap();
        queue.enqueue(NewMutation::append_event(&event), None).await.unwrap();
        queue.drain(&none_held()).await.unwrap();

        assert_eq!(remote.rows(EntityKind::Event).len(), 1);
        assert_eq!(queue.prune().await.unwrap(), 1);
    }
}
