#![allow(clippy::float_cmp)]

use super::*;
use crate::memory::{MemoryBackend, MemoryHub};
use std::time::Duration;

fn bridge(hub: &MemoryHub, user: &str) -> SyncBridge {
    SyncBridge::new(Arc::new(hub.connect(user)), SyncConfig::default())
}

fn remote_rect(id: &str, x: f64, stamp: i64) -> Shape {
    let mut shape = Shape::rectangle(x, 0.0, 10.0, 10.0);
    shape.id = id.to_string();
    shape.client_updated_at = stamp;
    shape
}

async fn write_remote(backend: &MemoryBackend, shapes: &[Shape]) {
    backend.put_shapes(shapes).await.unwrap();
}

// =============================================================================
// OUTBOUND
// =============================================================================

#[tokio::test(start_paused = true)]
async fn drag_frames_are_coalesced_to_the_window_rate() {
    let hub = MemoryHub::default();
    let bridge = bridge(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let id = store.upsert(Shape::rectangle(0.0, 0.0, 10.0, 10.0)).id;

    // 250 Hz input for 240ms.
    for _ in 0..60 {
        let moved = store.move_by(std::slice::from_ref(&id), 1.0, 0.0);
        bridge.publish(ShapeDelta::Geometry(moved[0].clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(4)).await;
    }
    bridge.flush_shapes(vec![id.clone()]).unwrap();
    bridge.flush().await.unwrap();

    let writes = hub.shape_writes();
    assert!((10..=20).contains(&writes), "expected ~16 writes, got {writes}");
    assert_eq!(hub.shape(&id).unwrap().x, 60.0);
    assert!(bridge.unpublished().shapes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn content_edits_publish_without_waiting_for_a_window() {
    let hub = MemoryHub::default();
    let bridge = bridge(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let id = store.upsert(Shape::rectangle(0.0, 0.0, 10.0, 10.0)).id;

    let moved = store.move_by(std::slice::from_ref(&id), 5.0, 0.0);
    bridge.publish(ShapeDelta::Geometry(moved[0].clone())).unwrap();
    let moved = store.move_by(std::slice::from_ref(&id), 5.0, 0.0);
    bridge.publish(ShapeDelta::Geometry(moved[0].clone())).unwrap();
    let recolored = store.recolor(std::slice::from_ref(&id), "#FF0000");
    bridge.publish(ShapeDelta::Content(recolored[0].clone())).unwrap();
    bridge.flush().await.unwrap();

    let durable = hub.shape(&id).unwrap();
    assert_eq!(durable.color, "#FF0000");
    assert_eq!(durable.x, 10.0);
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_are_retried_until_written() {
    let hub = MemoryHub::default();
    let bridge = bridge(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let shape = store.upsert(Shape::circle(5.0, 5.0, 3.0));

    hub.fail_next_writes(4);
    bridge.publish(ShapeDelta::Content(shape.clone())).unwrap();
    assert!(bridge.unpublished().shapes.contains(&shape.id));

    bridge.flush().await.unwrap();
    assert_eq!(hub.shape(&shape.id).map(|s| s.id), Some(shape.id));
    assert_eq!(hub.shape_writes(), 1);
    assert!(bridge.unpublished().shapes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn discarded_frame_is_never_written() {
    let hub = MemoryHub::default();
    let bridge = bridge(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let id = store.upsert(Shape::rectangle(0.0, 0.0, 10.0, 10.0)).id;

    let first = store.move_by(std::slice::from_ref(&id), 1.0, 0.0);
    bridge.publish(ShapeDelta::Geometry(first[0].clone())).unwrap();
    let second = store.move_by(std::slice::from_ref(&id), 1.0, 0.0);
    bridge.publish(ShapeDelta::Geometry(second[0].clone())).unwrap();
    bridge.discard(id.clone()).unwrap();
    bridge.flush().await.unwrap();

    assert_eq!(hub.shape(&id).unwrap().x, 1.0);
    assert!(bridge.unpublished().shapes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn yielded_shape_takes_the_echo_of_its_last_written_frame() {
    let hub = MemoryHub::default();
    let mut bridge = bridge(&hub, "alice");
    bridge.subscribe();
    let mut store = ShapeStore::new("alice");
    let id = store.upsert(Shape::rectangle(0.0, 0.0, 10.0, 10.0)).id;

    let first = store.move_by(std::slice::from_ref(&id), 1.0, 0.0);
    bridge.publish(ShapeDelta::Geometry(first[0].clone())).unwrap();
    let second = store.move_by(std::slice::from_ref(&id), 1.0, 0.0);
    bridge.publish(ShapeDelta::Geometry(second[0].clone())).unwrap();
    bridge.discard(id.clone()).unwrap();
    store.yield_to_remote(&id);
    bridge.flush().await.unwrap();

    let Some(Inbound::Change(echo)) = bridge.next_inbound().await else {
        panic!("expected the echo of the first frame");
    };
    assert!(bridge.apply_inbound(&mut store, &echo));
    assert_eq!(store.get(&id).unwrap().x, 1.0);
    assert_eq!(store.get(&id).unwrap().client_updated_at, hub.shape(&id).unwrap().client_updated_at);
    assert!(!store.is_yielded(&id));
}

#[tokio::test(start_paused = true)]
async fn discarding_a_frame_keeps_an_older_queued_write_unpublished() {
    let hub = MemoryHub::default();
    let bridge = bridge(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let id = store.upsert(Shape::rectangle(0.0, 0.0, 10.0, 10.0)).id;

    hub.fail_next_writes(1_000);
    let first = store.move_by(std::slice::from_ref(&id), 1.0, 0.0);
    bridge.publish(ShapeDelta::Geometry(first[0].clone())).unwrap();
    let second = store.move_by(std::slice::from_ref(&id), 1.0, 0.0);
    bridge.publish(ShapeDelta::Geometry(second[0].clone())).unwrap();
    bridge.discard(id.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.unpublished().shapes.contains(&id));

    hub.fail_next_writes(0);
    bridge.flush().await.unwrap();
    assert_eq!(hub.shape(&id).unwrap().x, 1.0);
    assert!(bridge.unpublished().shapes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn bulk_delete_is_one_write_and_one_event() {
    let hub = MemoryHub::default();
    let bridge = bridge(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let shapes: Vec<Shape> = (0..5_i32)
        .map(|i| store.upsert(Shape::rectangle(f64::from(i), 0.0, 10.0, 10.0)))
        .collect();
    bridge.publish_shapes(shapes.clone()).unwrap();
    bridge.flush().await.unwrap();
    let seq_before = hub.seq();

    let ids: Vec<ShapeId> = shapes.iter().map(|s| s.id.clone()).collect();
    let removal = store.remove(&ids);
    bridge.publish(ShapeDelta::Removed { ids: removal.ids, deleted_at: removal.deleted_at }).unwrap();
    bridge.flush().await.unwrap();

    assert_eq!(hub.seq(), seq_before + 1);
    assert!(ids.iter().all(|id| hub.shape(id).is_none()));
    assert!(bridge.unpublished().shapes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn layer_scale_and_removal_writes_are_tracked_until_acknowledged() {
    let hub = MemoryHub::default();
    let bridge = bridge(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let shape = store.upsert(Shape::rectangle(0.0, 0.0, 10.0, 10.0));
    bridge.publish(ShapeDelta::Content(shape.clone())).unwrap();
    bridge.flush().await.unwrap();

    let layer = store.upsert_layer(Layer::new("Walls"));
    let line = store.set_scale_line(Some(ScaleLine::new(
        crate::scale::Point::new(0.0, 0.0),
        crate::scale::Point::new(100.0, 0.0),
        10.0,
        crate::scale::Unit::Feet,
    )));
    let removal = store.remove(std::slice::from_ref(&shape.id));

    bridge.publish(ShapeDelta::Layer(layer.clone())).unwrap();
    bridge.publish(ShapeDelta::Scale(line.clone())).unwrap();
    bridge.publish(ShapeDelta::Removed { ids: removal.ids, deleted_at: removal.deleted_at }).unwrap();

    let pending = bridge.unpublished();
    assert!(pending.layers.contains(&layer.id));
    assert!(pending.scale);
    assert!(pending.shapes.contains(&shape.id));

    bridge.flush().await.unwrap();
    assert_eq!(hub.layer(&layer.id), Some(layer));
    assert_eq!(hub.scale(), line);
    assert!(hub.shape(&shape.id).is_none());

    let pending = bridge.unpublished();
    assert!(pending.shapes.is_empty() && pending.layers.is_empty() && !pending.scale);
}

#[tokio::test(start_paused = true)]
async fn shutdown_writes_coalesced_frames() {
    let hub = MemoryHub::default();
    let bridge = bridge(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let id = store.upsert(Shape::rectangle(0.0, 0.0, 10.0, 10.0)).id;
    for _ in 0..3 {
        let moved = store.move_by(std::slice::from_ref(&id), 2.0, 0.0);
        bridge.publish(ShapeDelta::Geometry(moved[0].clone())).unwrap();
    }

    bridge.shutdown().await;
    assert_eq!(hub.shape(&id).unwrap().x, 6.0);
}

// =============================================================================
// INBOUND
// =============================================================================

#[tokio::test(start_paused = true)]
async fn echoes_are_skipped_and_remote_changes_applied() {
    let hub = MemoryHub::default();
    let mut alice = bridge(&hub, "alice");
    alice.subscribe();
    let bob = hub.connect("bob");
    let mut store = ShapeStore::new("alice");

    let own = store.upsert(Shape::rectangle(0.0, 0.0, 10.0, 10.0));
    alice.publish(ShapeDelta::Content(own)).unwrap();
    alice.flush().await.unwrap();
    let Some(Inbound::Change(echo)) = alice.next_inbound().await else {
        panic!("expected the echo of our own write");
    };
    assert!(!alice.apply_inbound(&mut store, &echo));

    write_remote(&bob, &[remote_rect("bob-1", 40.0, 1)]).await;
    let Some(Inbound::Change(remote)) = alice.next_inbound().await else {
        panic!("expected bob's write");
    };
    assert!(alice.apply_inbound(&mut store, &remote));
    assert_eq!(store.get("bob-1").unwrap().x, 40.0);
    assert!(alice.try_next_inbound().is_none());
}

#[tokio::test]
async fn lagging_feed_reports_resync() {
    let hub = MemoryHub::new(2);
    let mut alice = bridge(&hub, "alice");
    alice.subscribe();
    let bob = hub.connect("bob");
    for i in 0..5 {
        write_remote(&bob, &[remote_rect(&format!("s{i}"), 0.0, 1)]).await;
    }

    assert_eq!(alice.next_inbound().await, Some(Inbound::Resync { missed: 3 }));

    let mut store = ShapeStore::new("alice");
    let report = alice.reconcile_full(&mut store).await.unwrap();
    assert_eq!(report.applied, 5);
    assert_eq!(store.len(), 5);
}

#[tokio::test]
async fn unsubscribed_bridge_yields_nothing() {
    let hub = MemoryHub::default();
    let mut alice = bridge(&hub, "alice");
    assert!(!alice.is_subscribed());
    assert_eq!(alice.next_inbound().await, None);
    alice.subscribe();
    assert!(alice.is_subscribed());
    alice.unsubscribe();
    assert!(alice.try_next_inbound().is_none());
}

// =============================================================================
// RECONCILIATION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reconcile_keeps_unpublished_local_writes() {
    let hub = MemoryHub::default();
    let alice = bridge(&hub, "alice");
    let bob = hub.connect("bob");
    write_remote(&bob, &[remote_rect("bob-1", 0.0, 1)]).await;

    let mut store = ShapeStore::new("alice");
    store.apply_remote_snapshot(vec![remote_rect("gone", 0.0, 1)]);
    let local = store.upsert(Shape::rectangle(1.0, 1.0, 2.0, 2.0));
    hub.fail_next_writes(1_000);
    alice.publish(ShapeDelta::Content(local.clone())).unwrap();

    let report = alice.reconcile_full(&mut store).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(report.kept_local, 1);
    assert!(store.contains(&local.id));
    assert!(store.contains("bob-1"));
    assert!(!store.contains("gone"));
    assert!(alice.unpublished().shapes.contains(&local.id));
}

#[tokio::test(start_paused = true)]
async fn reconnect_retries_until_backend_returns() {
    let hub = MemoryHub::default();
    let backend: Arc<dyn Backend> = Arc::new(hub.connect("alice"));
    let mut alice = SyncBridge::new(Arc::clone(&backend), SyncConfig::default());
    let locks = LockManager::new(backend, "alice", 10_000);
    let mut store = ShapeStore::new("alice");

    hub.set_online("alice", false);
    write_remote(&hub.connect("bob"), &[remote_rect("bob-1", 0.0, 1)]).await;
    hub.insert_lease(crate::lock::Lease::new("bob-1", "bob", 0, 1));

    let restore = hub.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        restore.set_online("alice", true);
    });

    let report = alice.reconnect(&mut store, &locks).await.unwrap();
    assert_eq!(report.applied, 1);
    assert!(store.contains("bob-1"));
    assert!(alice.is_subscribed());
    assert!(hub.lease("bob-1").is_none());
}

#[test]
fn sync_error_codes() {
    assert_eq!(SyncError::WorkerStopped.error_code(), "E_SYNC_WORKER_STOPPED");
    assert!(!SyncError::WorkerStopped.retryable());
    let wrapped = SyncError::from(BackendError::Timeout);
    assert_eq!(wrapped.error_code(), "E_BACKEND_TIMEOUT");
    assert!(wrapped.retryable());
}
