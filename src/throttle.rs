//! Rate limiters used to pace outbound mutations.
//!
//! DESIGN
//! ======
//! Three strategies, each a small state machine over `Instant`s:
//! - `LeadingThrottle` fires on the first call in a window and drops the
//!   rest without keeping their arguments.
//! - `CoalescingThrottle` fires immediately, then exactly once per window
//!   boundary with the most recent value seen. Final state is never lost.
//! - `AdaptiveThrottle` spaces attempts of a fallible async operation,
//!   backing off on failure up to a ceiling and decaying back toward the
//!   base interval on success.
//!
//! Every time-dependent method has an `_at` variant taking `now`, so tests
//! drive the clock by hand. Async drivers poll them from a tokio interval.
//! `tokio::time::Instant` is used so paused-clock tests see the same time
//! as the driver.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

// =============================================================================
// LEADING THROTTLE
// =============================================================================

/// Fires on the leading edge of each window; calls inside the window are dropped.
#[derive(Debug, Clone)]
pub struct LeadingThrottle {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl LeadingThrottle {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_fired: None }
    }

    /// Run `f` if the window is open. Returns whether it ran.
    pub fn call(&mut self, f: impl FnOnce()) -> bool {
        self.call_at(Instant::now(), f)
    }

    pub fn call_at(&mut self, now: Instant, f: impl FnOnce()) -> bool {
        if !window_open(self.last_fired, now, self.interval) {
            return false;
        }
        self.last_fired = Some(now);
        f();
        true
    }

    /// Forget the current window so the next call fires.
    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}

// =============================================================================
// COALESCING THROTTLE
// =============================================================================

/// Leading + trailing throttle that always delivers the latest value.
///
/// `push_at` returns the value to emit right now, if any. Values arriving
/// inside the window overwrite a single pending slot; `poll_at` releases it
/// once the window has elapsed. `flush` releases it unconditionally (end of
/// gesture).
#[derive(Debug, Clone)]
pub struct CoalescingThrottle<T> {
    interval: Duration,
    last_fired: Option<Instant>,
    pending: Option<T>,
}

impl<T> CoalescingThrottle<T> {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_fired: None, pending: None }
    }

    pub fn push(&mut self, value: T) -> Option<T> {
        self.push_at(Instant::now(), value)
    }

    pub fn push_at(&mut self, now: Instant, value: T) -> Option<T> {
        if window_open(self.last_fired, now, self.interval) {
            // A stale pending value is superseded by this newer one.
            self.pending = None;
            self.last_fired = Some(now);
            return Some(value);
        }
        self.pending = Some(value);
        None
    }

    pub fn poll(&mut self) -> Option<T> {
        self.poll_at(Instant::now())
    }

    /// Release the pending value if the window has elapsed.
    pub fn poll_at(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_none() || !window_open(self.last_fired, now, self.interval) {
            return None;
        }
        self.last_fired = Some(now);
        self.pending.take()
    }

    /// Release the pending value regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take()
    }

    /// Drop the pending value without emitting it.
    pub fn discard(&mut self) {
        self.pending = None;
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending value becomes releasable, if there is one.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(self.last_fired.map_or_else(Instant::now, |t| t + self.interval))
    }

    /// True when nothing is pending and the last emission is older than one window.
    fn is_idle_at(&self, now: Instant) -> bool {
        self.pending.is_none() && window_open(self.last_fired, now, self.interval)
    }
}

/// One `CoalescingThrottle` per key, e.g. per shape being dragged.
#[derive(Debug)]
pub struct KeyedCoalescer<K, T> {
    interval: Duration,
    slots: HashMap<K, CoalescingThrottle<T>>,
}

impl<K, T> KeyedCoalescer<K, T>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, slots: HashMap::new() }
    }

    pub fn push_at(&mut self, now: Instant, key: K, value: T) -> Option<T> {
        let interval = self.interval;
        self.slots
            .entry(key)
            .or_insert_with(|| CoalescingThrottle::new(interval))
            .push_at(now, value)
    }

    /// Release every pending value whose window has elapsed, and forget idle keys.
    pub fn poll_at(&mut self, now: Instant) -> Vec<T> {
        let mut released = Vec::new();
        for slot in self.slots.values_mut() {
            if let Some(value) = slot.poll_at(now) {
                released.push(value);
            }
        }
        self.slots.retain(|_, slot| !slot.is_idle_at(now));
        released
    }

    pub fn flush_key(&mut self, key: &K) -> Option<T> {
        self.slots.get_mut(key).and_then(CoalescingThrottle::flush)
    }

    pub fn flush_all(&mut self) -> Vec<T> {
        self.slots.values_mut().filter_map(CoalescingThrottle::flush).collect()
    }

    /// Drop any pending value for `key` (the entity was deleted).
    pub fn discard(&mut self, key: &K) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.discard();
        }
    }

    /// Keys that currently hold an unreleased value.
    pub fn pending_keys(&self) -> impl Iterator<Item = &K> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.has_pending())
            .map(|(key, _)| key)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.slots.values().any(CoalescingThrottle::has_pending)
    }
}

// =============================================================================
// ADAPTIVE THROTTLE
// =============================================================================

/// Growth factor applied to the interval on failure, and divisor on success.
const BACKOFF_FACTOR: u32 = 2;

/// Failure-adaptive spacing for a fallible async operation.
#[derive(Debug, Clone)]
pub struct AdaptiveThrottle {
    base: Duration,
    max: Duration,
    current: Duration,
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
}

impl AdaptiveThrottle {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self { base, max, current: base, last_attempt: None, consecutive_failures: 0 }
    }

    /// Current spacing between attempts.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.current
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Earliest instant the next attempt may start. `None` before the first attempt.
    #[must_use]
    pub fn ready_at(&self) -> Option<Instant> {
        self.last_attempt.map(|t| t + self.current)
    }

    #[must_use]
    pub fn is_ready_at(&self, now: Instant) -> bool {
        window_open(self.last_attempt, now, self.current)
    }

    pub fn record_attempt_at(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Grow the interval, bounded by the configured maximum.
    pub fn on_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current = self.current.saturating_mul(BACKOFF_FACTOR).min(self.max);
    }

    /// Shrink the interval back toward the base.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.current = (self.current / BACKOFF_FACTOR).max(self.base);
    }

    /// Back to the base interval with no pending wait.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.last_attempt = None;
        self.consecutive_failures = 0;
    }

    /// Wait until the next attempt is allowed, run `op`, and adapt to its outcome.
    pub async fn run<F, Fut, T, E>(&mut self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(at) = self.ready_at() {
            tokio::time::sleep_until(at).await;
        }
        self.record_attempt_at(Instant::now());
        let result = op().await;
        match result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn window_open(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    match last {
        None => true,
        Some(at) => now.saturating_duration_since(at) >= interval,
    }
}

#[cfg(test)]
#[path = "throttle_test.rs"]
mod tests;
