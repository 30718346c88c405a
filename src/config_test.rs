use super::*;

/// # Safety
/// Tests that touch the environment use distinct keys or clear them first.
unsafe fn clear_canvas_env() {
    unsafe {
        std::env::remove_var("CANVAS_LOCK_TTL_MS");
        std::env::remove_var("CANVAS_LOCK_RENEW_MS");
        std::env::remove_var("CANVAS_LOCK_SWEEP_MS");
        std::env::remove_var("CANVAS_DRAG_THROTTLE_MS");
        std::env::remove_var("CANVAS_PUBLISH_BACKOFF_BASE_MS");
        std::env::remove_var("CANVAS_PUBLISH_BACKOFF_MAX_MS");
        std::env::remove_var("CANVAS_PRESENCE_TTL_MS");
        std::env::remove_var("CANVAS_PRESENCE_HEARTBEAT_MS");
        std::env::remove_var("CANVAS_DUPLICATE_OFFSET");
        std::env::remove_var("CANVAS_FEED_CAPACITY");
    }
}

#[test]
fn env_parse_missing_returns_default() {
    let val: usize = env_parse("__CANVAS_TEST_NONEXISTENT__", 42);
    assert_eq!(val, 42);
}

#[test]
fn env_parse_present_valid() {
    unsafe { std::env::set_var("__CANVAS_TEST_VALID__", " 99 ") };
    let val: u64 = env_parse("__CANVAS_TEST_VALID__", 0);
    assert_eq!(val, 99);
    unsafe { std::env::remove_var("__CANVAS_TEST_VALID__") };
}

#[test]
fn env_parse_present_invalid_returns_default() {
    unsafe { std::env::set_var("__CANVAS_TEST_INVALID__", "soon") };
    let val: u64 = env_parse("__CANVAS_TEST_INVALID__", 7);
    assert_eq!(val, 7);
    unsafe { std::env::remove_var("__CANVAS_TEST_INVALID__") };
}

#[test]
fn default_renews_at_a_third_of_ttl() {
    let cfg = SyncConfig::default();
    assert_eq!(cfg.lock_ttl_ms, 10_000);
    assert_eq!(cfg.lock_renew_ms, 3_333);
    assert!(cfg.lock_renew_ms < cfg.lock_ttl_ms);
    assert_eq!(cfg.drag_throttle(), Duration::from_millis(16));
}

#[test]
fn from_env_reads_overrides_and_derives_renewal() {
    unsafe {
        clear_canvas_env();
        std::env::set_var("CANVAS_LOCK_TTL_MS", "3000");
        std::env::set_var("CANVAS_DRAG_THROTTLE_MS", "8");
        std::env::set_var("CANVAS_DUPLICATE_OFFSET", "12.5");
    }

    let cfg = SyncConfig::from_env();
    assert_eq!(cfg.lock_ttl_ms, 3_000);
    assert_eq!(cfg.lock_renew_ms, 1_000);
    assert_eq!(cfg.drag_throttle_ms, 8);
    assert!((cfg.duplicate_offset - 12.5).abs() < f64::EPSILON);
    assert_eq!(cfg.feed_capacity, DEFAULT_FEED_CAPACITY);

    unsafe { clear_canvas_env() };
}

#[test]
fn normalized_rejects_renewal_not_shorter_than_ttl() {
    let cfg = SyncConfig { lock_ttl_ms: 900, lock_renew_ms: 900, ..SyncConfig::default() }.normalized();
    assert_eq!(cfg.lock_renew_ms, 300);
}

#[test]
fn normalized_keeps_backoff_ceiling_above_base() {
    let cfg = SyncConfig { publish_backoff_base_ms: 100, publish_backoff_max_ms: 10, ..SyncConfig::default() }.normalized();
    assert_eq!(cfg.publish_backoff_max_ms, 100);
}
