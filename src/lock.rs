//! Lock manager — per-shape leases for transform rights.
//!
//! DESIGN
//! ======
//! A lease gives one holder the right to actively transform one shape until
//! `expires_at`. Leases live in the backend's `locks` collection and every
//! change goes through compare-and-swap, so two sessions racing for the same
//! shape cannot both win. Reads never need a lease.
//!
//! Acquisition is optimistic from the caller's point of view: the gesture
//! starts locally and `try_acquire` resolves concurrently. A denied or lost
//! lease stops further publishing for that shape but never rolls back local
//! state.
//!
//! EXPIRY
//! ======
//! A lease is expired once `now > expires_at`. A missed renewal is only a
//! soft signal: another holder can take the shape only after the TTL has
//! fully elapsed. Any session may sweep expired leases, and sweeping a lease
//! someone else already swept is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};
use crate::change::now_ms;
use crate::shape::{ShapeId, UserId};
use crate::store::ShapeStore;

/// Compare-and-swap retries before an acquisition or renewal gives up.
const MAX_CAS_ATTEMPTS: usize = 3;

// =============================================================================
// TYPES
// =============================================================================

/// Time-bounded exclusive claim on one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub shape_id: ShapeId,
    pub holder_id: UserId,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl Lease {
    #[must_use]
    pub fn new(shape_id: impl Into<ShapeId>, holder_id: impl Into<UserId>, now: i64, ttl_ms: i64) -> Self {
        Self {
            shape_id: shape_id.into(),
            holder_id: holder_id.into(),
            acquired_at: now,
            expires_at: now.saturating_add(ttl_ms),
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    #[must_use]
    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }

    fn extended(&self, now: i64, ttl_ms: i64) -> Self {
        Self { expires_at: now.saturating_add(ttl_ms), ..self.clone() }
    }
}

/// Result of [`LockManager::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted(Lease),
    /// Someone else holds a live lease. `held_by` is empty only when the
    /// lease kept changing hands for every attempt.
    Denied { held_by: UserId },
}

/// Result of [`LockManager::renew`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed(Lease),
    /// Another holder has taken the shape. Stop publishing for it.
    Lost { held_by: Option<UserId> },
}

/// Lease changes reported to the session by background lock work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Granted(Lease),
    Denied { shape_id: ShapeId, held_by: UserId },
    Lost { shape_id: ShapeId, held_by: Option<UserId> },
}

impl LockEvent {
    #[must_use]
    pub fn shape_id(&self) -> &ShapeId {
        match self {
            Self::Granted(lease) => &lease.shape_id,
            Self::Denied { shape_id, .. } | Self::Lost { shape_id, .. } => shape_id,
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Lease protocol for one holder. Cheap to clone; clones share the registry
/// of held leases.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn Backend>,
    holder_id: UserId,
    ttl_ms: i64,
    held: Arc<Mutex<HashMap<ShapeId, Lease>>>,
}

impl LockManager {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, holder_id: impl Into<UserId>, ttl_ms: i64) -> Self {
        Self { backend, holder_id: holder_id.into(), ttl_ms: ttl_ms.max(1), held: Arc::new(Mutex::new(HashMap::new())) }
    }

    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<ShapeId, Lease>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether this holder currently believes it owns `shape_id`.
    #[must_use]
    pub fn holds(&self, shape_id: &str) -> bool {
        self.held().contains_key(shape_id)
    }

    /// Ids of every lease this holder believes it owns, sorted.
    #[must_use]
    pub fn held_ids(&self) -> Vec<ShapeId> {
        let mut ids: Vec<ShapeId> = self.held().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Held leases whose shapes no longer exist in `store`.
    #[must_use]
    pub fn stale_holds(&self, store: &ShapeStore) -> Vec<ShapeId> {
        self.held_ids().into_iter().filter(|id| !store.contains(id)).collect()
    }

    fn remember(&self, lease: &Lease) {
        self.held().insert(lease.shape_id.clone(), lease.clone());
    }

    fn forget(&self, shape_id: &str) {
        self.held().remove(shape_id);
    }

    // -------------------------------------------------------------------------
    // ACQUIRE
    // -------------------------------------------------------------------------

    /// Try to lease `shape_id`. Re-acquiring a lease already held extends it.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the `locks` collection is unreachable.
    pub async fn try_acquire(&self, shape_id: &ShapeId) -> Result<LockOutcome, BackendError> {
        self.try_acquire_at(shape_id, now_ms()).await
    }

    /// [`Self::try_acquire`] at an explicit time.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the `locks` collection is unreachable.
    pub async fn try_acquire_at(&self, shape_id: &ShapeId, now: i64) -> Result<LockOutcome, BackendError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.backend.get_lock(shape_id).await?;
            let candidate = match &current {
                Some(lease) if !lease.is_expired_at(now) && !lease.is_held_by(&self.holder_id) => {
                    debug!(%shape_id, held_by = %lease.holder_id, "lease denied");
                    return Ok(LockOutcome::Denied { held_by: lease.holder_id.clone() });
                }
                Some(lease) if lease.is_held_by(&self.holder_id) && !lease.is_expired_at(now) => {
                    lease.extended(now, self.ttl_ms)
                }
                _ => Lease::new(shape_id.clone(), self.holder_id.clone(), now, self.ttl_ms),
            };

            if self.backend.swap_lock(shape_id, current.as_ref(), Some(&candidate)).await? {
                self.remember(&candidate);
                return Ok(LockOutcome::Granted(candidate));
            }
            debug!(%shape_id, attempt, "lease compare-and-swap lost a race");
        }

        let held_by = self
            .backend
            .get_lock(shape_id)
            .await?
            .map(|lease| lease.holder_id)
            .unwrap_or_default();
        warn!(%shape_id, %held_by, "lease acquisition contended");
        Ok(LockOutcome::Denied { held_by })
    }

    // -------------------------------------------------------------------------
    // RENEW
    // -------------------------------------------------------------------------

    /// Push the lease's expiry out by one TTL. A lease that vanished (swept
    /// after a stall) is re-claimed; one that another holder took is lost.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the `locks` collection is unreachable.
    pub async fn renew(&self, shape_id: &ShapeId) -> Result<RenewOutcome, BackendError> {
        self.renew_at(shape_id, now_ms()).await
    }

    /// [`Self::renew`] at an explicit time.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the `locks` collection is unreachable.
    pub async fn renew_at(&self, shape_id: &ShapeId, now: i64) -> Result<RenewOutcome, BackendError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.backend.get_lock(shape_id).await?;
            let candidate = match &current {
                Some(lease) if lease.is_held_by(&self.holder_id) => lease.extended(now, self.ttl_ms),
                Some(lease) if !lease.is_expired_at(now) => {
                    self.forget(shape_id);
                    warn!(%shape_id, held_by = %lease.holder_id, "lease lost to another holder");
                    return Ok(RenewOutcome::Lost { held_by: Some(lease.holder_id.clone()) });
                }
                _ => Lease::new(shape_id.clone(), self.holder_id.clone(), now, self.ttl_ms),
            };

            if self.backend.swap_lock(shape_id, current.as_ref(), Some(&candidate)).await? {
                self.remember(&candidate);
                return Ok(RenewOutcome::Renewed(candidate));
            }
        }

        self.forget(shape_id);
        warn!(%shape_id, "lease renewal contended");
        Ok(RenewOutcome::Lost { held_by: None })
    }

    /// Renew every held lease. Leases that could not be renewed are reported
    /// as lost; backend errors are logged and retried on the next pass.
    pub async fn renew_held_at(&self, now: i64) -> Vec<LockEvent> {
        let mut lost = Vec::new();
        for shape_id in self.held_ids() {
            match self.renew_at(&shape_id, now).await {
                Ok(RenewOutcome::Renewed(_)) => {}
                Ok(RenewOutcome::Lost { held_by }) => lost.push(LockEvent::Lost { shape_id, held_by }),
                Err(e) => warn!(%shape_id, error = %e, "lease renewal failed; will retry"),
            }
        }
        lost
    }

    // -------------------------------------------------------------------------
    // RELEASE / SWEEP
    // -------------------------------------------------------------------------

    /// Drop this holder's lease on `shape_id`. Releasing a lease that is not
    /// held, or that someone else now holds, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the `locks` collection is unreachable.
    pub async fn release(&self, shape_id: &ShapeId) -> Result<(), BackendError> {
        self.forget(shape_id);
        let Some(current) = self.backend.get_lock(shape_id).await? else {
            return Ok(());
        };
        if !current.is_held_by(&self.holder_id) {
            debug!(%shape_id, held_by = %current.holder_id, "release: lease held by someone else");
            return Ok(());
        }
        if !self.backend.swap_lock(shape_id, Some(&current), None).await? {
            debug!(%shape_id, "release: lease changed underneath us");
        }
        Ok(())
    }

    /// Release every held lease, logging failures. Used on session teardown.
    pub async fn release_all(&self) {
        for shape_id in self.held_ids() {
            if let Err(e) = self.release(&shape_id).await {
                warn!(%shape_id, error = %e, "lease release failed; it will expire");
            }
        }
    }

    /// Delete every expired lease. Returns how many this call removed.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the `locks` collection is unreachable.
    pub async fn sweep_expired(&self) -> Result<usize, BackendError> {
        self.sweep_expired_at(now_ms()).await
    }

    /// [`Self::sweep_expired`] at an explicit time.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the `locks` collection is unreachable.
    pub async fn sweep_expired_at(&self, now: i64) -> Result<usize, BackendError> {
        let mut swept = 0;
        for lease in self.backend.list_locks().await? {
            if !lease.is_expired_at(now) {
                continue;
            }
            if self.backend.swap_lock(&lease.shape_id, Some(&lease), None).await? {
                debug!(shape_id = %lease.shape_id, holder = %lease.holder_id, "swept expired lease");
                swept += 1;
            }
        }
        if swept > 0 {
            info!(count = swept, "swept expired leases");
        }
        Ok(swept)
    }

    // -------------------------------------------------------------------------
    // BACKGROUND TASKS
    // -------------------------------------------------------------------------

    /// Renew held leases every `every`, reporting lost ones on `events`.
    /// Stops when the receiver is dropped.
    pub fn spawn_renewal_task(&self, every: Duration, events: mpsc::UnboundedSender<LockEvent>) -> JoinHandle<()> {
        let locks = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                for event in locks.renew_held_at(now_ms()).await {
                    if events.send(event).is_err() {
                        return;
                    }
                }
                if events.is_closed() {
                    return;
                }
            }
        })
    }

    /// Sweep expired leases every `every` until aborted.
    pub fn spawn_sweep_task(&self, every: Duration) -> JoinHandle<()> {
        let locks = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = locks.sweep_expired().await {
                    warn!(error = %e, "lease sweep failed; will retry");
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod tests;
