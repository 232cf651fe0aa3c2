//! # In-Memory Backend
//!
//! An in-process [`RemoteBackend`] used by tests and local demos.
//!
//! It behaves like the REST backend where it matters to the engine:
//! key-ordered pages, `>=` change filters, idempotent upserts. Events get a
//! server `created_at` on insert from a logical clock that never runs
//! backwards, so a late upload of an old sale still lands after everything
//! already stored. It also records every request and can be told to fail
//! specific requests.
//!
//! ```rust,ignore
//! let remote = MemoryBackend::new();
//! remote.put(&variant);
//! remote.fail_next(RequestOp::Upsert, 2, InjectedFailure::Network);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{change_column, RemoteBackend, UpsertAck};
use crate::error::{SyncError, SyncResult};
use inventra_core::rows::RemoteRow;
use inventra_core::{EntityKind, MutationOp, QueuedMutation};

/// Which backend call a log entry or failure rule refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOp {
    FetchPage,
    FetchChanged,
    FetchOne,
    Count,
    Upsert,
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLog {
    pub op: RequestOp,
    pub kind: EntityKind,
    pub offset: usize,
    pub limit: usize,
    pub since: Option<DateTime<Utc>>,
    pub entity_id: Option<String>,
    pub idempotency_key: Option<String>,
}

/// A failure the backend can be told to produce.
#[derive(Debug, Clone, PartialEq)]
pub enum InjectedFailure {
    Network,
    RateLimited(Option<Duration>),
    Timeout,
    Validation(String),
    Conflict(String),
    Auth,
}

impl InjectedFailure {
    fn to_error(&self, entity: &str) -> SyncError {
        match self {
            InjectedFailure::Network => SyncError::Network("injected network failure".into()),
            InjectedFailure::RateLimited(retry_after) => SyncError::RateLimited {
                retry_after: *retry_after,
            },
            InjectedFailure::Timeout => SyncError::Timeout("injected timeout".into()),
            InjectedFailure::Validation(msg) => SyncError::Validation(format!("{entity}: {msg}")),
            InjectedFailure::Conflict(msg) => SyncError::Conflict {
                entity: entity.to_string(),
                message: msg.clone(),
            },
            InjectedFailure::Auth => SyncError::Auth("injected auth failure".into()),
        }
    }
}

#[derive(Debug)]
struct FailureRule {
    op: RequestOp,
    kind: Option<EntityKind>,
    offset: Option<usize>,
    remaining: usize,
    failure: InjectedFailure,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<EntityKind, Vec<Value>>,
    applied_keys: HashSet<String>,
    requests: Vec<RequestLog>,
    failures: Vec<FailureRule>,
    latency: Option<Duration>,
    report_count: bool,
    event_clock: Option<DateTime<Utc>>,
}

/// In-process remote store.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            state: Mutex::new(MemoryState {
                report_count: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Inserts or replaces a typed row by id.
    pub fn put<T: RemoteRow + Serialize>(&self, row: &T) {
        match serde_json::to_value(row) {
            Ok(value) => self.put_raw(T::KIND, value),
            Err(e) => tracing::warn!(error = %e, "Could not serialize seeded row"),
        }
    }

    /// Inserts or replaces a raw row by its `id` field (malformed rows allowed).
    ///
    /// Event rows without a `created_at` are stamped with the next tick of the
    /// insertion clock: their own `timestamp`, or one microsecond after the
    /// previous insert, whichever is later.
    pub fn put_raw(&self, kind: EntityKind, mut row: Value) {
        let mut state = self.lock();
        if kind == EntityKind::Event {
            stamp_insertion(&mut state.event_clock, &mut row);
        }
        let rows = state.collections.entry(kind).or_default();
        let id = row.get("id").cloned();
        match rows.iter_mut().find(|r| id.is_some() && r.get("id") == id.as_ref()) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    /// Current rows of a collection, in key order.
    pub fn rows(&self, kind: EntityKind) -> Vec<Value> {
        let state = self.lock();
        sorted_by_id(state.collections.get(&kind).cloned().unwrap_or_default())
    }

    // =========================================================================
    // Behaviour Controls
    // =========================================================================

    /// Fails the next `times` calls of `op`.
    pub fn fail_next(&self, op: RequestOp, times: usize, failure: InjectedFailure) {
        self.lock().failures.push(FailureRule {
            op,
            kind: None,
            offset: None,
            remaining: times,
            failure,
        });
    }

    /// Fails the next read of `kind` at exactly `offset`.
    pub fn fail_page(&self, op: RequestOp, kind: EntityKind, offset: usize, failure: InjectedFailure) {
        self.lock().failures.push(FailureRule {
            op,
            kind: Some(kind),
            offset: Some(offset),
            remaining: 1,
            failure,
        });
    }

    /// Delays every response (drives timeout and supersede scenarios).
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Whether `count` reports totals (a backend without exact counts).
    pub fn set_report_count(&self, report: bool) {
        self.lock().report_count = report;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn requests(&self) -> Vec<RequestLog> {
        self.lock().requests.clone()
    }

    /// Number of recorded calls of `op` against `kind`.
    pub fn request_count(&self, op: RequestOp, kind: EntityKind) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.op == op && r.kind == kind)
            .count()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Idempotency keys that have taken effect.
    pub fn applied_keys(&self) -> HashSet<String> {
        self.lock().applied_keys.clone()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Logs the request, then applies latency and any matching failure rule.
    async fn enter(&self, entry: RequestLog, entity: &str) -> SyncResult<()> {
        let (latency, failure) = {
            let mut state = self.lock();
            let failure = state
                .failures
                .iter_mut()
                .find(|rule| {
                    rule.remaining > 0
                        && rule.op == entry.op
                        && rule.kind.map_or(true, |k| k == entry.kind)
                        && rule.offset.map_or(true, |o| o == entry.offset)
                })
                .map(|rule| {
                    rule.remaining -= 1;
                    rule.failure.clone()
                });
            state.failures.retain(|rule| rule.remaining > 0);
            state.requests.push(entry);
            (state.latency, failure)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(failure) => Err(failure.to_error(entity)),
            None => Ok(()),
        }
    }
}

fn sorted_by_id(mut rows: Vec<Value>) -> Vec<Value> {
    rows.sort_by(|a, b| id_of(a).cmp(id_of(b)));
    rows
}

fn id_of(row: &Value) -> &str {
    row.get("id").and_then(Value::as_str).unwrap_or_default()
}

fn changed_at(kind: EntityKind, row: &Value) -> Option<DateTime<Utc>> {
    parse_time(row.get(change_column(kind)))
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn stamp_insertion(clock: &mut Option<DateTime<Utc>>, row: &mut Value) {
    let Some(fields) = row.as_object_mut() else {
        return;
    };
    let stamp = match parse_time(fields.get("created_at")) {
        Some(given) => given,
        None => {
            let next = clock.map(|last| last + chrono::Duration::microseconds(1));
            let stamp = match (parse_time(fields.get("timestamp")), next) {
                (Some(business), Some(next)) => business.max(next),
                (Some(business), None) => business,
                (None, Some(next)) => next,
                (None, None) => Utc::now(),
            };
            fields.insert(
                "created_at".to_string(),
                Value::String(stamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
            stamp
        }
    };
    *clock = Some(clock.map_or(stamp, |last| last.max(stamp)));
}

fn window(rows: Vec<Value>, offset: usize, limit: usize) -> Vec<Value> {
    rows.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn fetch_page(
        &self,
        kind: EntityKind,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Value>> {
        let entry = RequestLog {
            op: RequestOp::FetchPage,
            kind,
            offset,
            limit,
            since: None,
            entity_id: None,
            idempotency_key: None,
        };
        self.enter(entry, kind.collection()).await?;
        Ok(window(self.rows(kind), offset, limit))
    }

    async fn fetch_changed(
        &self,
        kind: EntityKind,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Value>> {
        let entry = RequestLog {
            op: RequestOp::FetchChanged,
            kind,
            offset,
            limit,
            since: Some(since),
            entity_id: None,
            idempotency_key: None,
        };
        self.enter(entry, kind.collection()).await?;

        let mut changed: Vec<(DateTime<Utc>, Value)> = self
            .rows(kind)
            .into_iter()
            .filter_map(|row| changed_at(kind, &row).map(|at| (at, row)))
            .filter(|(at, _)| *at >= since)
            .collect();
        changed.sort_by(|(a, ra), (b, rb)| a.cmp(b).then_with(|| id_of(ra).cmp(id_of(rb))));

        Ok(window(changed.into_iter().map(|(_, row)| row).collect(), offset, limit))
    }

    async fn fetch_one(&self, kind: EntityKind, id: &str) -> SyncResult<Option<Value>> {
        let entry = RequestLog {
            op: RequestOp::FetchOne,
            kind,
            offset: 0,
            limit: 1,
            since: None,
            entity_id: Some(id.to_string()),
            idempotency_key: None,
        };
        self.enter(entry, kind.collection()).await?;
        Ok(self.rows(kind).into_iter().find(|row| id_of(row) == id))
    }

    async fn count(&self, kind: EntityKind) -> SyncResult<Option<usize>> {
        let entry = RequestLog {
            op: RequestOp::Count,
            kind,
            offset: 0,
            limit: 0,
            since: None,
            entity_id: None,
            idempotency_key: None,
        };
        self.enter(entry, kind.collection()).await?;

        let state = self.lock();
        if !state.report_count {
            return Ok(None);
        }
        Ok(Some(state.collections.get(&kind).map_or(0, Vec::len)))
    }

    async fn upsert(&self, mutation: &QueuedMutation) -> SyncResult<UpsertAck> {
        let entry = RequestLog {
            op: RequestOp::Upsert,
            kind: mutation.target.kind,
            offset: 0,
            limit: 1,
            since: None,
            entity_id: None,
            idempotency_key: Some(mutation.idempotency_key.clone()),
        };
        self.enter(entry, &mutation.target.to_string()).await?;

        if self.lock().applied_keys.contains(&mutation.idempotency_key) {
            return Ok(UpsertAck { duplicate: true });
        }

        match mutation.op {
            MutationOp::Upsert => self.put_raw(mutation.target.kind, mutation.payload.clone()),
            MutationOp::AppendEvent => {
                let exists = self
                    .rows(EntityKind::Event)
                    .iter()
                    .any(|r| id_of(r) == mutation.target.id);
                if !exists {
                    self.put_raw(EntityKind::Event, mutation.payload.clone());
                }
            }
        }

        self.lock().applied_keys.insert(mutation.idempotency_key.clone());
        Ok(UpsertAck { duplicate: false })
    }
}
