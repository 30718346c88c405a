use super::*;
use crate::memory::MemoryHub;

const TTL: i64 = 10_000;
const T0: i64 = 1_000_000;

fn manager(hub: &MemoryHub, holder: &str) -> LockManager {
    LockManager::new(Arc::new(hub.connect(holder)), holder, TTL)
}

fn sid(id: &str) -> ShapeId {
    id.to_string()
}

// =============================================================
// Acquire
// =============================================================

#[tokio::test]
async fn free_shape_is_always_granted() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");

    let LockOutcome::Granted(lease) = alice.try_acquire_at(&sid("s1"), T0).await.unwrap() else {
        panic!("free shape should be granted");
    };
    assert_eq!(lease.holder_id, "alice");
    assert_eq!(lease.expires_at, T0 + TTL);
    assert!(alice.holds("s1"));
    assert_eq!(hub.lease("s1"), Some(lease));
}

#[tokio::test]
async fn huge_ttl_saturates_expiry() {
    let hub = MemoryHub::default();
    let alice = LockManager::new(Arc::new(hub.connect("alice")), "alice", i64::MAX);

    let LockOutcome::Granted(lease) = alice.try_acquire_at(&sid("s1"), T0).await.unwrap() else {
        panic!("free shape should be granted");
    };
    assert_eq!(lease.expires_at, i64::MAX);
    assert!(!lease.is_expired_at(i64::MAX));

    let LockOutcome::Granted(extended) = alice.try_acquire_at(&sid("s1"), T0 + 1).await.unwrap() else {
        panic!("holder should be able to extend");
    };
    assert_eq!(extended.expires_at, i64::MAX);
}

#[tokio::test]
async fn second_holder_denied_until_ttl_then_sweep_grants() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    let bob = manager(&hub, "bob");

    alice.try_acquire_at(&sid("s1"), T0).await.unwrap();
    let denied = bob.try_acquire_at(&sid("s1"), T0 + TTL / 2).await.unwrap();
    assert_eq!(denied, LockOutcome::Denied { held_by: "alice".into() });

    // Exactly at expiry the lease is still live.
    let denied = bob.try_acquire_at(&sid("s1"), T0 + TTL).await.unwrap();
    assert_eq!(denied, LockOutcome::Denied { held_by: "alice".into() });

    let after = T0 + TTL + 1;
    assert_eq!(bob.sweep_expired_at(after).await.unwrap(), 1);
    assert_eq!(hub.lease("s1"), None);
    let granted = bob.try_acquire_at(&sid("s1"), after).await.unwrap();
    assert!(matches!(granted, LockOutcome::Granted(ref l) if l.holder_id == "bob"));
}

#[tokio::test]
async fn expired_lease_can_be_taken_without_sweep() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    let bob = manager(&hub, "bob");

    alice.try_acquire_at(&sid("s1"), T0).await.unwrap();
    let outcome = bob.try_acquire_at(&sid("s1"), T0 + TTL + 1).await.unwrap();
    assert!(matches!(outcome, LockOutcome::Granted(_)));
    assert_eq!(hub.lease("s1").unwrap().holder_id, "bob");
}

#[tokio::test]
async fn reacquire_by_holder_extends_lease() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");

    alice.try_acquire_at(&sid("s1"), T0).await.unwrap();
    let LockOutcome::Granted(lease) = alice.try_acquire_at(&sid("s1"), T0 + 500).await.unwrap() else {
        panic!("holder should be re-granted");
    };
    assert_eq!(lease.acquired_at, T0);
    assert_eq!(lease.expires_at, T0 + 500 + TTL);
}

#[tokio::test]
async fn acquire_fails_when_backend_offline() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    hub.set_online("alice", false);

    let err = alice.try_acquire_at(&sid("s1"), T0).await.unwrap_err();
    assert!(matches!(err, BackendError::Unavailable(_)));
    assert!(!alice.holds("s1"));
}

// =============================================================
// Renew
// =============================================================

#[tokio::test]
async fn renew_pushes_expiry_forward() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    alice.try_acquire_at(&sid("s1"), T0).await.unwrap();

    let RenewOutcome::Renewed(lease) = alice.renew_at(&sid("s1"), T0 + 3_000).await.unwrap() else {
        panic!("holder should renew");
    };
    assert_eq!(lease.expires_at, T0 + 3_000 + TTL);
    assert_eq!(hub.lease("s1"), Some(lease));
}

#[tokio::test]
async fn renew_after_takeover_is_lost() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    let bob = manager(&hub, "bob");

    alice.try_acquire_at(&sid("s1"), T0).await.unwrap();
    // Alice stalls past the TTL; Bob takes the shape.
    bob.try_acquire_at(&sid("s1"), T0 + TTL + 1).await.unwrap();

    let outcome = alice.renew_at(&sid("s1"), T0 + TTL + 2).await.unwrap();
    assert_eq!(outcome, RenewOutcome::Lost { held_by: Some("bob".into()) });
    assert!(!alice.holds("s1"));
    assert_eq!(hub.lease("s1").unwrap().holder_id, "bob");
}

#[tokio::test]
async fn renew_reclaims_swept_lease() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    let bob = manager(&hub, "bob");

    alice.try_acquire_at(&sid("s1"), T0).await.unwrap();
    bob.sweep_expired_at(T0 + TTL + 1).await.unwrap();
    assert_eq!(hub.lease("s1"), None);

    let outcome = alice.renew_at(&sid("s1"), T0 + TTL + 2).await.unwrap();
    assert!(matches!(outcome, RenewOutcome::Renewed(ref l) if l.acquired_at == T0 + TTL + 2));
    assert!(alice.holds("s1"));
}

#[tokio::test]
async fn renew_held_reports_only_lost_leases() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");

    alice.try_acquire_at(&sid("kept"), T0).await.unwrap();
    alice.try_acquire_at(&sid("taken"), T0).await.unwrap();
    hub.insert_lease(Lease::new("taken", "bob", T0 + 1, TTL));

    let lost = alice.renew_held_at(T0 + 2).await;
    assert_eq!(lost, vec![LockEvent::Lost { shape_id: sid("taken"), held_by: Some("bob".into()) }]);
    assert_eq!(alice.held_ids(), vec![sid("kept")]);
}

// =============================================================
// Release / sweep
// =============================================================

#[tokio::test]
async fn release_is_idempotent_and_respects_other_holders() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    let bob = manager(&hub, "bob");

    alice.try_acquire_at(&sid("s1"), T0).await.unwrap();
    alice.release(&sid("s1")).await.unwrap();
    alice.release(&sid("s1")).await.unwrap();
    assert_eq!(hub.lease("s1"), None);

    bob.try_acquire_at(&sid("s1"), T0).await.unwrap();
    alice.release(&sid("s1")).await.unwrap();
    assert_eq!(hub.lease("s1").unwrap().holder_id, "bob");
}

#[tokio::test]
async fn sweep_is_safe_from_many_sessions() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    let bob = manager(&hub, "bob");
    let carol = manager(&hub, "carol");

    alice.try_acquire_at(&sid("old"), T0).await.unwrap();
    alice.try_acquire_at(&sid("fresh"), T0 + TTL).await.unwrap();

    let now = T0 + TTL + 1;
    assert_eq!(bob.sweep_expired_at(now).await.unwrap(), 1);
    assert_eq!(carol.sweep_expired_at(now).await.unwrap(), 0);
    assert_eq!(bob.sweep_expired_at(now).await.unwrap(), 0);
    assert!(hub.lease("fresh").is_some());
}

#[tokio::test]
async fn release_all_clears_registry() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    alice.try_acquire_at(&sid("a"), T0).await.unwrap();
    alice.try_acquire_at(&sid("b"), T0).await.unwrap();

    alice.release_all().await;
    assert!(alice.held_ids().is_empty());
    assert_eq!(hub.lease("a"), None);
    assert_eq!(hub.lease("b"), None);
}

#[tokio::test]
async fn stale_holds_lists_deleted_shapes() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    let mut store = ShapeStore::new("alice");
    let kept = store.upsert(crate::shape::Shape::rectangle(0.0, 0.0, 1.0, 1.0));

    alice.try_acquire_at(&kept.id, T0).await.unwrap();
    alice.try_acquire_at(&sid("gone"), T0).await.unwrap();
    assert_eq!(alice.stale_holds(&store), vec![sid("gone")]);
}

// =============================================================
// Background renewal
// =============================================================

#[tokio::test(start_paused = true)]
async fn renewal_task_reports_lost_lease() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    alice.try_acquire(&sid("s1")).await.unwrap();
    hub.insert_lease(Lease::new("s1", "bob", now_ms(), TTL));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = alice.spawn_renewal_task(Duration::from_millis(100), tx);

    let event = rx.recv().await.unwrap();
    assert_eq!(event, LockEvent::Lost { shape_id: sid("s1"), held_by: Some("bob".into()) });
    assert_eq!(event.shape_id(), "s1");
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn renewal_task_keeps_lease_alive() {
    let hub = MemoryHub::default();
    let alice = manager(&hub, "alice");
    let LockOutcome::Granted(first) = alice.try_acquire(&sid("s1")).await.unwrap() else {
        panic!("free shape should be granted");
    };

    let (tx, _rx) = mpsc::unbounded_channel();
    let task = alice.spawn_renewal_task(Duration::from_millis(100), tx);
    tokio::time::sleep(Duration::from_millis(350)).await;
    task.abort();

    let renewed = hub.lease("s1").unwrap();
    assert_eq!(renewed.holder_id, "alice");
    assert_eq!(renewed.acquired_at, first.acquired_at);
    assert!(renewed.expires_at >= first.expires_at);
    assert!(alice.holds("s1"));
}
