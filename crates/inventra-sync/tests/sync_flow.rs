//! End-to-end sync scenarios against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use inventra_core::{
    CacheSnapshot, EntityKind, EntityRef, Location, LocationKind, MovementEvent, MutationStatus,
    NewMutation, Product, StockStatus, Variant,
};
use inventra_db::{Database, DbConfig};
use inventra_sync::remote::{InjectedFailure, RequestOp};
use inventra_sync::{InventorySync, MemoryBackend, SyncConfig, SyncOutcome};

// =============================================================================
// Fixtures
// =============================================================================

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
}

fn product(id: &str, name: &str, updated_at: DateTime<Utc>) -> Product {
    Product {
        id: id.into(),
        name: name.into(),
        category: None,
        updated_at,
    }
}

fn variant(id: &str) -> Variant {
    Variant {
        id: id.into(),
        product_id: "p1".into(),
        size: None,
        color: None,
        code: format!("SKU-{id}"),
        updated_at: at(1),
    }
}

fn location(id: &str, kind: LocationKind) -> Location {
    Location {
        id: id.into(),
        code: id.to_uppercase(),
        name: format!("Location {id}"),
        kind,
        updated_at: at(1),
    }
}

fn movement(
    id: &str,
    from: Option<&str>,
    to: Option<&str>,
    quantity: i64,
    timestamp: DateTime<Utc>,
) -> MovementEvent {
    MovementEvent {
        id: id.into(),
        variant_id: "v1".into(),
        from_location_id: from.map(String::from),
        to_location_id: to.map(String::from),
        quantity,
        timestamp,
        recorded_at: None,
        reference: None,
    }
}

fn seeded_remote() -> Arc<MemoryBackend> {
    let remote = Arc::new(MemoryBackend::new());
    remote.put(&product("p1", "Kurta", at(1)));
    remote.put(&variant("v1"));
    remote.put(&location("store", LocationKind::Store));
    remote.put(&location("godown", LocationKind::Godown));
    remote.put(&movement("e1", None, Some("godown"), 50, at(2)));
    remote.put(&movement("e2", Some("godown"), Some("store"), 20, at(2)));
    remote.put(&movement("e3", None, Some("store"), 10, at(2)));
    remote
}

fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.remote.page_size = 1000;
    config.queue.initial_backoff_ms = 0;
    config.queue.max_backoff_secs = 0;
    config
}

async fn engine(remote: Arc<MemoryBackend>) -> (InventorySync, Database) {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let engine = InventorySync::new(&db, remote, &test_config()).await.unwrap();
    (engine, db)
}

fn quantity_at(view: &inventra_core::StockView, location_id: &str) -> i64 {
    view.records
        .iter()
        .find(|r| r.location_id == location_id)
        .map(|r| r.quantity)
        .unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_ledger_view_after_first_sync() {
    let (engine, _) = engine(seeded_remote()).await;
    engine.sync().await.unwrap();

    let view = engine.get_stock_view().await;
    assert_eq!(view.records.len(), 2);
    assert_eq!(quantity_at(&view, "godown"), 30);
    assert_eq!(quantity_at(&view, "store"), 30);
    assert!(view.records.iter().all(|r| r.status == StockStatus::Healthy));
    assert!(view.complete);
}

#[tokio::test]
async fn test_stale_cache_triggers_delta_not_full_load() {
    let remote = seeded_remote();
    let db = Database::new(DbConfig::in_memory()).await.unwrap();

    let mut cached = CacheSnapshot::empty(Utc::now() - chrono::Duration::hours(25));
    cached.products.push(product("p1", "Kurta", at(1)));
    cached.last_sync_watermark = Some(at(2));
    db.cache().save("inventory", &cached).await.unwrap();

    let engine = InventorySync::new(&db, remote.clone(), &test_config()).await.unwrap();
    assert!(engine.get_stock_view().await.stale);

    let outcome = engine.sync().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Synced { .. }));

    let reads: Vec<_> = remote.requests();
    assert!(reads.iter().any(|r| r.op == RequestOp::FetchChanged));
    assert!(reads.iter().all(|r| r.op != RequestOp::FetchPage));
    assert!(reads.iter().filter(|r| r.op == RequestOp::FetchChanged).all(|r| r.since == Some(at(2))));
    assert!(!engine.get_stock_view().await.stale);
}

#[tokio::test]
async fn test_large_collection_loads_in_capped_pages() {
    let remote = seeded_remote();
    for i in 0..2497 {
        remote.put(&movement(&format!("bulk-{i:04}"), None, Some("store"), 1, at(3)));
    }
    let (engine, _) = engine(remote.clone()).await;

    let outcome = engine.sync().await.unwrap();
    assert_eq!(outcome, SyncOutcome::FullLoad { rows: 2504, complete: true });
    assert_eq!(remote.request_count(RequestOp::FetchPage, EntityKind::Event), 3);
    assert!(remote.requests().iter().all(|r| r.limit <= 1000));

    let view = engine.get_stock_view().await;
    assert_eq!(quantity_at(&view, "store"), 30 + 2497);
}

#[tokio::test]
async fn test_mutation_survives_two_transient_failures() {
    let remote = seeded_remote();
    let (engine, _) = engine(remote.clone()).await;
    remote.fail_next(RequestOp::Upsert, 2, InjectedFailure::Network);

    let queued = engine
        .queue_local_change(NewMutation::append_event(&movement(
            "sale-1",
            Some("store"),
            None,
            2,
            at(4),
        )))
        .await
        .unwrap();

    for _ in 0..3 {
        engine.drain_mutations().await.unwrap();
    }

    let stored = engine
        .failed_mutations()
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.id == queued.id);
    assert!(stored.is_none());
    assert!(remote.applied_keys().contains(&queued.idempotency_key));

    let status = engine.sync_status().await.unwrap();
    assert_eq!(status.pending_mutations, 0);
    assert_eq!(remote.request_count(RequestOp::Upsert, EntityKind::Event), 3);
}

#[tokio::test]
async fn test_duplicate_delivery_has_one_effect() {
    let remote = seeded_remote();
    let (engine, _) = engine(remote.clone()).await;

    let change = || {
        NewMutation::upsert(
            EntityRef::new(EntityKind::Product, "p1"),
            json!({"id": "p1", "name": "Kurta Classic", "updated_at": "2024-03-01T05:00:00Z"}),
        )
        .with_idempotency_key("rename-p1")
    };
    let first = engine.queue_local_change(change()).await.unwrap();
    let second = engine.queue_local_change(change()).await.unwrap();
    assert_eq!(first.id, second.id);

    engine.drain_mutations().await.unwrap();
    engine.drain_mutations().await.unwrap();

    assert_eq!(remote.request_count(RequestOp::Upsert, EntityKind::Product), 1);
    assert_eq!(remote.applied_keys().len(), 1);
}

#[tokio::test]
async fn test_concurrent_edit_raises_exactly_one_conflict() {
    let remote = seeded_remote();
    let (engine, _) = engine(remote.clone()).await;
    engine.sync().await.unwrap();

    let queued = engine
        .queue_local_change(NewMutation::upsert(
            EntityRef::new(EntityKind::Product, "p1"),
            json!({"id": "p1", "name": "Local name"}),
        ))
        .await
        .unwrap();
    remote.put(&product("p1", "Remote name", at(6)));

    let outcome = engine.refresh().await.unwrap();
    let SyncOutcome::Synced { conflicts, .. } = outcome else {
        panic!("expected delta sync, got {outcome:?}");
    };
    assert_eq!(conflicts, 1);

    engine.refresh().await.unwrap();
    let open = engine.open_conflicts().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].target, queued.target);
    assert_eq!(open[0].mutation_id, queued.id);
    assert_eq!(open[0].remote_value["name"], "Remote name");

    // Manual policy: the remote value is shown and the change is held.
    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.products[0].name, "Remote name");
    engine.drain_mutations().await.unwrap();
    assert_eq!(remote.request_count(RequestOp::Upsert, EntityKind::Product), 0);
}

#[tokio::test]
async fn test_repeated_delta_is_a_no_op() {
    let remote = seeded_remote();
    let (engine, _) = engine(remote.clone()).await;
    engine.sync().await.unwrap();
    remote.put(&movement("e4", Some("store"), None, 3, at(7)));

    engine.refresh().await.unwrap();
    let first = engine.snapshot().await.unwrap();

    let outcome = engine.refresh().await.unwrap();
    let SyncOutcome::Synced { merge, .. } = outcome else {
        panic!("expected delta sync, got {outcome:?}");
    };
    assert!(!merge.changed());
    assert!(!merge.watermark_advanced);

    let second = engine.snapshot().await.unwrap();
    assert_eq!(second.last_sync_watermark, first.last_sync_watermark);
    assert_eq!(second.products, first.products);
    assert_eq!(second.events, first.events);
}

#[tokio::test]
async fn test_newer_sync_supersedes_in_flight_one() {
    let remote = seeded_remote();
    remote.set_latency(Some(Duration::from_millis(50)));
    let (engine, _) = engine(remote.clone()).await;

    let slow = tokio::spawn({
        let engine = engine.clone();
        async move { engine.refresh().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let forced = engine.force_resync().await.unwrap();
    let stale = slow.await.unwrap().unwrap();

    assert_eq!(stale, SyncOutcome::Superseded);
    assert!(matches!(forced, SyncOutcome::FullLoad { complete: true, .. }));
    assert_eq!(engine.generation(), 2);
}

#[tokio::test]
async fn test_keep_remote_policy_supersedes_local_change() {
    let remote = seeded_remote();
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let mut config = test_config();
    config.queue.conflict_policy = "keep_remote".parse().unwrap();
    let engine = InventorySync::new(&db, remote.clone(), &config).await.unwrap();
    engine.sync().await.unwrap();

    let queued = engine
        .queue_local_change(NewMutation::upsert(
            EntityRef::new(EntityKind::Product, "p1"),
            json!({"id": "p1", "name": "Local name"}),
        ))
        .await
        .unwrap();
    remote.put(&product("p1", "Remote name", at(6)));
    engine.refresh().await.unwrap();

    let stored = db.mutations().get(&queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MutationStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("superseded"));
    assert!(engine.open_conflicts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_late_event_is_merged() {
    let remote = seeded_remote();
    let (engine, _) = engine(remote.clone()).await;
    engine.sync().await.unwrap();

    remote.put(&movement("e4", None, Some("store"), 10, at(5)));
    engine.refresh().await.unwrap();
    assert_eq!(quantity_at(&engine.get_stock_view().await, "store"), 40);

    // A terminal that was offline uploads a sale rung up before e4.
    remote.put(&movement("e5", Some("store"), None, 5, at(3)));
    let outcome = engine.refresh().await.unwrap();
    let SyncOutcome::Synced { merge, .. } = outcome else {
        panic!("expected delta sync, got {outcome:?}");
    };
    assert_eq!(merge.events_appended, 1);
    assert_eq!(quantity_at(&engine.get_stock_view().await, "store"), 35);

    let snapshot = engine.snapshot().await.unwrap();
    let late = snapshot.events.iter().find(|e| e.id == "e5").unwrap();
    assert_eq!(late.timestamp, at(3));
    assert!(late.recorded_at.unwrap() > at(5));
}

#[tokio::test]
async fn test_unchanged_row_at_watermark_is_not_a_conflict() {
    let remote = seeded_remote();
    remote.put(&product("p2", "Dupatta", at(2)));
    let (engine, _) = engine(remote.clone()).await;
    engine.sync().await.unwrap();
    assert_eq!(engine.snapshot().await.unwrap().watermarks.products, Some(at(2)));

    let queued = engine
        .queue_local_change(NewMutation::upsert(
            EntityRef::new(EntityKind::Product, "p2"),
            json!({"id": "p2", "name": "Dupatta Silk", "updated_at": "2024-03-01T07:00:00Z"}),
        ))
        .await
        .unwrap();
    assert_eq!(queued.base_watermark, Some(at(2)));

    // The inclusive window hands p2 back unchanged.
    let outcome = engine.refresh().await.unwrap();
    let SyncOutcome::Synced { conflicts, .. } = outcome else {
        panic!("expected delta sync, got {outcome:?}");
    };
    assert_eq!(conflicts, 0);
    assert!(engine.open_conflicts().await.unwrap().is_empty());

    let report = engine.drain_mutations().await.unwrap();
    assert_eq!(report.delivered(), 1);
    assert_eq!(remote.request_count(RequestOp::Upsert, EntityKind::Product), 1);
}

#[tokio::test]
async fn test_future_dated_event_does_not_hide_reference_updates() {
    let remote = seeded_remote();
    let (engine, _) = engine(remote.clone()).await;
    engine.sync().await.unwrap();

    // A terminal with a fast clock.
    remote.put(&movement("e4", None, Some("store"), 5, at(20)));
    engine.refresh().await.unwrap();

    remote.put(&product("p1", "Kurta Classic", at(6)));
    engine.refresh().await.unwrap();

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.products[0].name, "Kurta Classic");
    assert_eq!(snapshot.watermarks.products, Some(at(6)));
    assert_eq!(snapshot.watermarks.events, Some(at(20)));
    assert_eq!(snapshot.last_sync_watermark, Some(at(20)));
}
