//! Sync tunables parsed from environment variables.
//!
//! Every knob has a `DEFAULT_*` constant. Missing or unparsable values fall
//! back to the default rather than failing session startup.

use std::time::Duration;

use tracing::warn;

pub const DEFAULT_LOCK_TTL_MS: u64 = 10_000;
pub const DEFAULT_LOCK_SWEEP_MS: u64 = 10_000;
pub const DEFAULT_DRAG_THROTTLE_MS: u64 = 16;
pub const DEFAULT_PUBLISH_BACKOFF_BASE_MS: u64 = 16;
pub const DEFAULT_PUBLISH_BACKOFF_MAX_MS: u64 = 5_000;
pub const DEFAULT_PRESENCE_TTL_MS: u64 = 15_000;
pub const DEFAULT_PRESENCE_HEARTBEAT_MS: u64 = 5_000;
pub const DEFAULT_DUPLICATE_OFFSET: f64 = 20.0;
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Renewal cadence as a fraction of the lease TTL.
const RENEW_DIVISOR: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    /// Lease lifetime after acquisition or renewal.
    pub lock_ttl_ms: u64,
    /// How often held leases are renewed. Always shorter than the TTL.
    pub lock_renew_ms: u64,
    /// How often expired leases are reaped.
    pub lock_sweep_ms: u64,
    /// Coalescing window for drag, rotate and resize frames.
    pub drag_throttle_ms: u64,
    /// Adaptive publish spacing when the backend is healthy.
    pub publish_backoff_base_ms: u64,
    /// Ceiling for adaptive publish spacing under repeated failures.
    pub publish_backoff_max_ms: u64,
    /// Presence entries older than this are considered gone.
    pub presence_ttl_ms: u64,
    /// How often the local presence entry is refreshed.
    pub presence_heartbeat_ms: u64,
    /// Offset applied to both axes of duplicated shapes, in pixels.
    pub duplicate_offset: f64,
    /// Inbound change-feed buffer per client, as sized by
    /// `MemoryHub::from_config`. Overflow forces a full reconcile.
    pub feed_capacity: usize,
}

impl SyncConfig {
    /// Build config from environment variables.
    ///
    /// - `CANVAS_LOCK_TTL_MS` (10000)
    /// - `CANVAS_LOCK_RENEW_MS` (TTL / 3)
    /// - `CANVAS_LOCK_SWEEP_MS` (10000)
    /// - `CANVAS_DRAG_THROTTLE_MS` (16)
    /// - `CANVAS_PUBLISH_BACKOFF_BASE_MS` (16)
    /// - `CANVAS_PUBLISH_BACKOFF_MAX_MS` (5000)
    /// - `CANVAS_PRESENCE_TTL_MS` (15000)
    /// - `CANVAS_PRESENCE_HEARTBEAT_MS` (5000)
    /// - `CANVAS_DUPLICATE_OFFSET` (20.0)
    /// - `CANVAS_FEED_CAPACITY` (1024)
    #[must_use]
    pub fn from_env() -> Self {
        let lock_ttl_ms = env_parse("CANVAS_LOCK_TTL_MS", DEFAULT_LOCK_TTL_MS).max(1);
        let config = Self {
            lock_ttl_ms,
            lock_renew_ms: env_parse("CANVAS_LOCK_RENEW_MS", lock_ttl_ms / RENEW_DIVISOR),
            lock_sweep_ms: env_parse("CANVAS_LOCK_SWEEP_MS", DEFAULT_LOCK_SWEEP_MS),
            drag_throttle_ms: env_parse("CANVAS_DRAG_THROTTLE_MS", DEFAULT_DRAG_THROTTLE_MS),
            publish_backoff_base_ms: env_parse("CANVAS_PUBLISH_BACKOFF_BASE_MS", DEFAULT_PUBLISH_BACKOFF_BASE_MS),
            publish_backoff_max_ms: env_parse("CANVAS_PUBLISH_BACKOFF_MAX_MS", DEFAULT_PUBLISH_BACKOFF_MAX_MS),
            presence_ttl_ms: env_parse("CANVAS_PRESENCE_TTL_MS", DEFAULT_PRESENCE_TTL_MS),
            presence_heartbeat_ms: env_parse("CANVAS_PRESENCE_HEARTBEAT_MS", DEFAULT_PRESENCE_HEARTBEAT_MS),
            duplicate_offset: env_parse("CANVAS_DUPLICATE_OFFSET", DEFAULT_DUPLICATE_OFFSET),
            feed_capacity: env_parse("CANVAS_FEED_CAPACITY", DEFAULT_FEED_CAPACITY),
        };
        config.normalized()
    }

    /// Clamp values that would break the lease or backoff invariants.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.lock_ttl_ms = self.lock_ttl_ms.max(1);
        if self.lock_renew_ms == 0 || self.lock_renew_ms >= self.lock_ttl_ms {
            let fallback = (self.lock_ttl_ms / RENEW_DIVISOR).max(1);
            warn!(renew_ms = self.lock_renew_ms, ttl_ms = self.lock_ttl_ms, fallback, "lock renewal must be shorter than TTL");
            self.lock_renew_ms = fallback;
        }
        self.drag_throttle_ms = self.drag_throttle_ms.max(1);
        self.lock_sweep_ms = self.lock_sweep_ms.max(1);
        self.presence_heartbeat_ms = self.presence_heartbeat_ms.max(1);
        self.publish_backoff_base_ms = self.publish_backoff_base_ms.max(1);
        self.publish_backoff_max_ms = self.publish_backoff_max_ms.max(self.publish_backoff_base_ms);
        self.feed_capacity = self.feed_capacity.max(1);
        self
    }

    #[must_use]
    pub fn lock_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lock_renew_ms)
    }

    #[must_use]
    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lock_sweep_ms)
    }

    #[must_use]
    pub fn drag_throttle(&self) -> Duration {
        Duration::from_millis(self.drag_throttle_ms)
    }

    #[must_use]
    pub fn publish_backoff_base(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_base_ms)
    }

    #[must_use]
    pub fn publish_backoff_max(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_max_ms)
    }

    #[must_use]
    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_millis(self.presence_heartbeat_ms)
    }

    /// Lease TTL in the millisecond units stored on lease records.
    #[must_use]
    pub fn lock_ttl_i64(&self) -> i64 {
        i64::try_from(self.lock_ttl_ms).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn presence_ttl_i64(&self) -> i64 {
        i64::try_from(self.presence_ttl_ms).unwrap_or(i64::MAX)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            lock_renew_ms: DEFAULT_LOCK_TTL_MS / RENEW_DIVISOR,
            lock_sweep_ms: DEFAULT_LOCK_SWEEP_MS,
            drag_throttle_ms: DEFAULT_DRAG_THROTTLE_MS,
            publish_backoff_base_ms: DEFAULT_PUBLISH_BACKOFF_BASE_MS,
            publish_backoff_max_ms: DEFAULT_PUBLISH_BACKOFF_MAX_MS,
            presence_ttl_ms: DEFAULT_PRESENCE_TTL_MS,
            presence_heartbeat_ms: DEFAULT_PRESENCE_HEARTBEAT_MS,
            duplicate_offset: DEFAULT_DUPLICATE_OFFSET,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
