//! Canvas session — one open canvas for one user.
//!
//! DESIGN
//! ======
//! A `CanvasSession` is constructed per open canvas and owns everything that
//! canvas needs: the local `ShapeStore`, a `SyncBridge`, a `LockManager`
//! whose holder id is the user id, and a `PresenceTracker`. Nothing is
//! global, so any number of sessions (for the same or different users) can
//! run side by side against one backend.
//!
//! Every local operation mutates the store first and then hands the result
//! to the bridge, so callers never wait on I/O to see their own edits.
//! Geometry edits (drag, rotate, resize) publish through the coalescing
//! path; everything else publishes immediately.
//!
//! GESTURES
//! ========
//! `begin_transform` starts a gesture without waiting for leases: each
//! acquisition runs as its own task and reports back as a `LockEvent`. A
//! shape whose lease is denied or later lost is frozen for the rest of the
//! gesture: its pending frame is discarded and further transforms of it
//! are ignored. Edits already applied stay until remote state overwrites
//! them: the shape yields to the next remote record for it, whatever its
//! stamp. `end_transform` publishes the final frames and releases leases.
//!
//! EVENTS
//! ======
//! `next_event` multiplexes the inbound feed and lock outcomes. Feed lag is
//! handled inside by a full reconcile; a reconcile that fails reports
//! `SessionEvent::Disconnected` and the caller should `reconnect`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::change::{Change, ChangeEvent, Collection, ErrorCode, now_ms};
use crate::config::SyncConfig;
use crate::lock::{Lease, LockEvent, LockManager, LockOutcome};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::scale::ScaleLine;
use crate::shape::{Layer, LayerId, Shape, ShapeId, UserId};
use crate::store::{ReconcileReport, ShapeStore};
use crate::sync::{Inbound, ShapeDelta, SyncBridge, SyncError};

/// Upper bound on how long `close` waits for queued writes.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Something the caller may want to redraw for.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A remote shape, layer or scale change was merged. `changed` is false
    /// when the store kept its own newer state or the event was an echo.
    Remote { seq: u64, collection: Collection, changed: bool },
    /// A lease was taken or dropped by anyone, this session included.
    LockChanged { shape_id: ShapeId, lease: Option<Lease> },
    PresenceChanged,
    /// Outcome of this session's own lease work.
    Lock(LockEvent),
    /// The feed lagged and the store was reloaded.
    Resynced(ReconcileReport),
    /// The feed is gone. Call [`CanvasSession::reconnect`].
    Disconnected,
}

pub struct CanvasSession {
    user_id: UserId,
    config: SyncConfig,
    backend: Arc<dyn Backend>,
    store: ShapeStore,
    bridge: SyncBridge,
    locks: LockManager,
    presence: PresenceTracker,
    /// Shapes in the current transform gesture.
    gesture: HashSet<ShapeId>,
    /// Gesture shapes whose lease was denied or lost, with the holder if known.
    frozen: HashMap<ShapeId, Option<UserId>>,
    /// Live leases held by other users, as last seen.
    foreign: HashMap<ShapeId, Lease>,
    lock_tx: mpsc::UnboundedSender<LockEvent>,
    lock_rx: mpsc::UnboundedReceiver<LockEvent>,
    notices: VecDeque<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl CanvasSession {
    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Open a canvas: subscribe, load the durable state, and start lease
    /// renewal, lease sweeping and presence heartbeats.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the initial load fails.
    pub async fn open(backend: Arc<dyn Backend>, user_id: impl Into<UserId>, config: SyncConfig) -> Result<Self, SyncError> {
        let user_id = user_id.into();
        let config = config.normalized();
        let mut store = ShapeStore::new(user_id.clone()).with_duplicate_offset(config.duplicate_offset);
        let locks = LockManager::new(Arc::clone(&backend), user_id.clone(), config.lock_ttl_i64());
        let presence = PresenceTracker::new(Arc::clone(&backend), user_id.clone(), config.presence_ttl_i64());
        let mut bridge = SyncBridge::new(Arc::clone(&backend), config);

        bridge.subscribe();
        let report = bridge.reconcile_full(&mut store).await?;
        presence.refresh().await?;
        let foreign = load_foreign_leases(backend.as_ref(), &user_id).await?;

        let (lock_tx, lock_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            locks.spawn_renewal_task(config.lock_renew_interval(), lock_tx.clone()),
            locks.spawn_sweep_task(config.lock_sweep_interval()),
            presence.spawn_heartbeat_task(config.presence_heartbeat()),
        ];

        let session = Self {
            user_id,
            config,
            backend,
            store,
            bridge,
            locks,
            presence,
            gesture: HashSet::new(),
            frozen: HashMap::new(),
            foreign,
            lock_tx,
            lock_rx,
            notices: VecDeque::new(),
            tasks,
        };
        info!(
            user_id = %session.user_id,
            client_id = %session.bridge.client_id(),
            shapes = session.store.len(),
            applied = report.applied,
            "canvas session opened"
        );
        Ok(session)
    }

    /// Stop receiving remote changes. Local edits keep queueing.
    pub fn disconnect(&mut self) {
        self.bridge.unsubscribe();
        info!(user_id = %self.user_id, "canvas session disconnected");
    }

    /// Resubscribe and reconcile after a connectivity gap. Retries transient
    /// failures until the backend answers.
    ///
    /// # Errors
    ///
    /// Returns non-retryable backend errors.
    pub async fn reconnect(&mut self) -> Result<ReconcileReport, SyncError> {
        let report = self.bridge.reconnect(&mut self.store, &self.locks).await?;
        if let Err(e) = self.refresh_locks().await {
            warn!(error = %e, "lease refresh after reconnect failed");
        }
        if let Err(e) = self.presence.refresh().await {
            warn!(error = %e, "presence refresh after reconnect failed");
        }
        Ok(report)
    }

    /// Wait until every local edit has been written or dropped.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.bridge.flush().await
    }

    /// Tear down: write what is queued, release leases, leave presence, and
    /// stop background tasks.
    pub async fn close(self) {
        let Self { user_id, bridge, locks, presence, tasks, .. } = self;

        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, bridge.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "flush on close failed"),
            Err(_) => {
                let pending = bridge.unpublished();
                warn!(
                    shapes = pending.shapes.len(),
                    layers = pending.layers.len(),
                    "timed out flushing on close"
                );
            }
        }
        locks.release_all().await;
        if let Err(e) = presence.leave().await {
            warn!(error = %e, code = e.error_code(), "presence leave failed; entry will expire");
        }
        for task in tasks {
            task.abort();
        }
        bridge.shutdown().await;
        info!(%user_id, "canvas session closed");
    }

    // =========================================================================
    // READS
    // =========================================================================

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &ShapeStore {
        &self.store
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Who blocks transforms of `shape_id`, if anyone.
    #[must_use]
    pub fn locked_by(&self, shape_id: &str) -> Option<&str> {
        if let Some(Some(holder)) = self.frozen.get(shape_id) {
            return Some(holder.as_str());
        }
        self.foreign
            .get(shape_id)
            .filter(|lease| !lease.is_expired_at(now_ms()))
            .map(|lease| lease.holder_id.as_str())
    }

    /// Live leases held by other users, ordered by shape id.
    #[must_use]
    pub fn foreign_locks(&self) -> Vec<Lease> {
        let now = now_ms();
        let mut leases: Vec<Lease> = self.foreign.values().filter(|l| !l.is_expired_at(now)).cloned().collect();
        leases.sort_by(|a, b| a.shape_id.cmp(&b.shape_id));
        leases
    }

    /// Whether transforms of `shape_id` are disabled for this gesture.
    #[must_use]
    pub fn is_frozen(&self, shape_id: &str) -> bool {
        self.frozen.contains_key(shape_id)
    }

    /// Shapes in the current gesture.
    #[must_use]
    pub fn transforming(&self) -> Vec<ShapeId> {
        let mut ids: Vec<ShapeId> = self.gesture.iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    // =========================================================================
    // SHAPE EDITS
    // =========================================================================

    /// Add a new shape.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn create(&mut self, shape: Shape) -> Result<Shape, SyncError> {
        let shape = self.store.upsert(shape);
        self.bridge.publish(ShapeDelta::Content(shape.clone()))?;
        Ok(shape)
    }

    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn recolor(&mut self, ids: &[ShapeId], color: &str) -> Result<Vec<Shape>, SyncError> {
        let changed = self.store.recolor(ids, color);
        self.bridge.publish_shapes(changed.clone())?;
        Ok(changed)
    }

    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn set_text(&mut self, id: &ShapeId, text: &str) -> Result<Option<Shape>, SyncError> {
        let changed = self.store.set_text(id, text);
        if let Some(shape) = &changed {
            self.bridge.publish(ShapeDelta::Content(shape.clone()))?;
        }
        Ok(changed)
    }

    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn set_stroke_width(&mut self, ids: &[ShapeId], width: f64) -> Result<Vec<Shape>, SyncError> {
        let changed = self.store.set_stroke_width(ids, width);
        self.bridge.publish_shapes(changed.clone())?;
        Ok(changed)
    }

    /// Move shapes onto `layer_id`, or off any layer with `None`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn assign_layer(&mut self, ids: &[ShapeId], layer_id: Option<&LayerId>) -> Result<Vec<Shape>, SyncError> {
        let changed = self.store.assign_layer(ids, layer_id);
        self.bridge.publish_shapes(changed.clone())?;
        Ok(changed)
    }

    /// Clone shapes with fresh ids at the configured offset.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn duplicate(&mut self, ids: &[ShapeId]) -> Result<Vec<Shape>, SyncError> {
        let copies = self.store.duplicate(ids);
        self.bridge.publish_shapes(copies.clone())?;
        Ok(copies)
    }

    /// Delete shapes and give up any leases on them.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub async fn remove(&mut self, ids: &[ShapeId]) -> Result<Vec<ShapeId>, SyncError> {
        let removal = self.store.remove(ids);
        if removal.is_empty() {
            return Ok(Vec::new());
        }
        for id in &removal.ids {
            self.gesture.remove(id);
            self.frozen.remove(id);
            if self.locks.holds(id) {
                if let Err(e) = self.locks.release(id).await {
                    warn!(shape_id = %id, error = %e, "lease release failed; it will expire");
                }
            }
        }
        let removed = removal.ids.clone();
        self.bridge.publish(ShapeDelta::Removed { ids: removal.ids, deleted_at: removal.deleted_at })?;
        Ok(removed)
    }

    pub fn select(&mut self, ids: &[ShapeId]) {
        self.store.select(ids);
    }

    pub fn clear_selection(&mut self) {
        self.store.clear_selection();
    }

    // =========================================================================
    // TRANSFORM GESTURES
    // =========================================================================

    /// Start transforming `ids`. Leases are requested in the background and
    /// the gesture may proceed at once.
    pub fn begin_transform(&mut self, ids: &[ShapeId]) {
        self.drain_lock_events();
        for id in ids {
            if !self.store.contains(id) || !self.gesture.insert(id.clone()) {
                continue;
            }
            self.frozen.remove(id);
            if self.locks.holds(id) {
                continue;
            }
            let locks = self.locks.clone();
            let events = self.lock_tx.clone();
            let shape_id = id.clone();
            tokio::spawn(async move {
                let event = match locks.try_acquire(&shape_id).await {
                    Ok(LockOutcome::Granted(lease)) => LockEvent::Granted(lease),
                    Ok(LockOutcome::Denied { held_by }) => LockEvent::Denied { shape_id, held_by },
                    Err(e) => {
                        warn!(%shape_id, error = %e, code = e.error_code(), "lease request failed; continuing unlocked");
                        return;
                    }
                };
                if events.send(event).is_err() {
                    debug!("session closed before lease outcome arrived");
                }
            });
        }
    }

    /// Gesture shapes that may still be transformed, plus any non-gesture
    /// ids the caller moves programmatically.
    fn movable(&self, ids: &[ShapeId]) -> Vec<ShapeId> {
        ids.iter().filter(|id| !self.frozen.contains_key(*id)).cloned().collect()
    }

    fn publish_geometry(&self, shapes: &[Shape]) -> Result<(), SyncError> {
        for shape in shapes {
            self.bridge.publish(ShapeDelta::Geometry(shape.clone()))?;
        }
        Ok(())
    }

    /// One drag frame.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn drag_by(&mut self, ids: &[ShapeId], dx: f64, dy: f64) -> Result<Vec<Shape>, SyncError> {
        self.drain_lock_events();
        let ids = self.movable(ids);
        let moved = self.store.move_by(&ids, dx, dy);
        self.publish_geometry(&moved)?;
        Ok(moved)
    }

    /// One rotate frame.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn rotate_by(&mut self, ids: &[ShapeId], degrees: f64) -> Result<Vec<Shape>, SyncError> {
        self.drain_lock_events();
        let ids = self.movable(ids);
        let rotated = self.store.rotate_by(&ids, degrees);
        self.publish_geometry(&rotated)?;
        Ok(rotated)
    }

    /// One resize frame.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn resize(&mut self, id: &ShapeId, w: f64, h: f64) -> Result<Option<Shape>, SyncError> {
        self.drain_lock_events();
        if self.frozen.contains_key(id) {
            debug!(shape_id = %id, "resize ignored; shape is locked elsewhere");
            return Ok(None);
        }
        let resized = self.store.resize(id, w, h);
        if let Some(shape) = &resized {
            self.bridge.publish(ShapeDelta::Geometry(shape.clone()))?;
        }
        Ok(resized)
    }

    /// Finish the gesture: publish final frames and release leases.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub async fn end_transform(&mut self) -> Result<(), SyncError> {
        self.drain_lock_events();
        let ids: Vec<ShapeId> = self.gesture.drain().collect();
        let finished: Vec<ShapeId> = ids.iter().filter(|id| !self.frozen.contains_key(*id)).cloned().collect();
        self.bridge.flush_shapes(finished)?;
        for id in &ids {
            self.frozen.remove(id);
            if self.locks.holds(id) {
                if let Err(e) = self.locks.release(id).await {
                    warn!(shape_id = %id, error = %e, "lease release failed; it will expire");
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // LAYERS & CALIBRATION
    // =========================================================================

    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn upsert_layer(&mut self, layer: Layer) -> Result<Layer, SyncError> {
        let layer = self.store.upsert_layer(layer);
        self.bridge.publish(ShapeDelta::Layer(layer.clone()))?;
        Ok(layer)
    }

    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn rename_layer(&mut self, id: &LayerId, name: &str) -> Result<Option<Layer>, SyncError> {
        let layer = self.store.rename_layer(id, name);
        if let Some(layer) = &layer {
            self.bridge.publish(ShapeDelta::Layer(layer.clone()))?;
        }
        Ok(layer)
    }

    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn set_layer_visible(&mut self, id: &LayerId, visible: bool) -> Result<Option<Layer>, SyncError> {
        let layer = self.store.set_layer_visible(id, visible);
        if let Some(layer) = &layer {
            self.bridge.publish(ShapeDelta::Layer(layer.clone()))?;
        }
        Ok(layer)
    }

    /// Delete a layer. Its shapes stay, now on no layer.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn remove_layer(&mut self, id: &LayerId) -> Result<Vec<Shape>, SyncError> {
        let known = self.store.layer(id).is_some();
        let orphaned = self.store.remove_layer(id);
        if known {
            self.bridge.publish(ShapeDelta::LayerRemoved(id.clone()))?;
        }
        self.bridge.publish_shapes(orphaned.clone())?;
        Ok(orphaned)
    }

    /// Set or clear the calibration line.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge is gone.
    pub fn set_scale_line(&mut self, line: Option<ScaleLine>) -> Result<Option<ScaleLine>, SyncError> {
        let line = self.store.set_scale_line(line);
        self.bridge.publish(ShapeDelta::Scale(line.clone()))?;
        Ok(line)
    }

    // =========================================================================
    // PRESENCE
    // =========================================================================

    /// # Errors
    ///
    /// Returns the backend error if the entry could not be written.
    pub async fn join_view(&self, view: &str) -> Result<PresenceEntry, SyncError> {
        Ok(self.presence.join(view).await?)
    }

    /// # Errors
    ///
    /// Returns the backend error if the entry could not be written.
    pub async fn switch_view(&self, view: &str) -> Result<PresenceEntry, SyncError> {
        Ok(self.presence.switch_view(view).await?)
    }

    /// # Errors
    ///
    /// Returns the backend error if the entry could not be removed.
    pub async fn leave_view(&self) -> Result<(), SyncError> {
        Ok(self.presence.leave().await?)
    }

    /// Everyone currently present, this session included.
    #[must_use]
    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.presence.active_at(now_ms())
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Wait for the next remote change or lease outcome and fold it into the
    /// session. Returns `None` only if the lease channel closed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if let Some(notice) = self.notices.pop_front() {
            return Some(notice);
        }
        tokio::select! {
            inbound = self.bridge.next_inbound(), if self.bridge.is_subscribed() => {
                Some(match inbound {
                    Some(Inbound::Change(event)) => self.apply_event(&event),
                    Some(Inbound::Resync { .. }) => self.resync().await,
                    None => {
                        warn!(user_id = %self.user_id, "change feed closed");
                        SessionEvent::Disconnected
                    }
                })
            }
            event = self.lock_rx.recv() => {
                let event = event?;
                self.handle_lock_event(&event);
                Some(SessionEvent::Lock(event))
            }
        }
    }

    fn apply_event(&mut self, event: &ChangeEvent) -> SessionEvent {
        match &event.change {
            Change::LockChanged { shape_id, lease } => {
                match lease {
                    Some(lease) if !lease.is_held_by(&self.user_id) => {
                        self.foreign.insert(shape_id.clone(), lease.clone());
                    }
                    _ => {
                        self.foreign.remove(shape_id);
                    }
                }
                SessionEvent::LockChanged { shape_id: shape_id.clone(), lease: lease.clone() }
            }
            Change::PresenceChanged { .. } | Change::PresenceLeft { .. } => {
                self.presence.apply_change(&event.change);
                SessionEvent::PresenceChanged
            }
            _ => {
                let changed = self.bridge.apply_inbound(&mut self.store, event);
                SessionEvent::Remote { seq: event.seq, collection: event.collection(), changed }
            }
        }
    }

    async fn resync(&mut self) -> SessionEvent {
        match self.bridge.reconcile_full(&mut self.store).await {
            Ok(report) => {
                if let Err(e) = self.refresh_locks().await {
                    warn!(error = %e, "lease refresh after resync failed");
                }
                SessionEvent::Resynced(report)
            }
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "resync failed; reconnect required");
                self.bridge.unsubscribe();
                SessionEvent::Disconnected
            }
        }
    }

    /// Apply a lease outcome. Denied or lost shapes drop their pending
    /// frames and yield to remote state; those in the current gesture are
    /// also frozen.
    pub fn handle_lock_event(&mut self, event: &LockEvent) {
        let (shape_id, held_by) = match event {
            LockEvent::Granted(lease) => {
                debug!(shape_id = %lease.shape_id, "lease granted");
                return;
            }
            LockEvent::Denied { shape_id, held_by } => {
                info!(%shape_id, %held_by, "lease denied; transform disabled");
                (shape_id, Some(held_by.clone()))
            }
            LockEvent::Lost { shape_id, held_by } => {
                warn!(%shape_id, held_by = ?held_by, "lease lost; transform disabled");
                (shape_id, held_by.clone())
            }
        };
        if let Err(e) = self.bridge.discard(shape_id.clone()) {
            warn!(%shape_id, error = %e, "could not discard pending frame");
        }
        self.store.yield_to_remote(shape_id);
        if self.gesture.contains(shape_id) {
            self.frozen.insert(shape_id.clone(), held_by);
        }
    }

    fn drain_lock_events(&mut self) {
        while let Ok(event) = self.lock_rx.try_recv() {
            self.handle_lock_event(&event);
            self.notices.push_back(SessionEvent::Lock(event));
        }
    }

    async fn refresh_locks(&mut self) -> Result<(), SyncError> {
        self.foreign = load_foreign_leases(self.backend.as_ref(), &self.user_id).await?;
        Ok(())
    }
}

/// Live leases not held by `user_id`, keyed by shape.
async fn load_foreign_leases(backend: &dyn Backend, user_id: &str) -> Result<HashMap<ShapeId, Lease>, SyncError> {
    let now = now_ms();
    Ok(backend
        .list_locks()
        .await?
        .into_iter()
        .filter(|lease| !lease.is_held_by(user_id) && !lease.is_expired_at(now))
        .map(|lease| (lease.shape_id.clone(), lease))
        .collect())
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
