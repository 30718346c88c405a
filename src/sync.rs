//! Sync bridge — the only component that talks to the durable store.
//!
//! ARCHITECTURE
//! ============
//! Outbound, `publish` never blocks: deltas go over an unbounded channel to
//! a background worker. Geometry deltas (drag, rotate, resize) pass through
//! a per-shape coalescing throttle first, so a gesture produces at most one
//! write per window plus a final one. Everything else goes straight to the
//! outbound queue. The queue keeps one entry per written key, and a newer
//! delta for a key replaces the queued one in place, so retries always
//! carry the latest state.
//!
//! Inbound, the bridge owns at most one bounded change-feed receiver. A
//! receiver that falls behind reports `Inbound::Resync`; the caller must
//! then reconcile fully, since deltas were lost.
//!
//! ERROR HANDLING
//! ==============
//! Retryable write failures stay queued and are retried indefinitely,
//! spaced by an adaptive throttle that backs off to the configured ceiling
//! and recovers toward the base on success. Writes the backend rejects
//! outright are dropped with a warning. A key stays "unpublished" from the
//! moment it is handed to `publish` until its latest delta is written or
//! dropped; full reconciliation never erases unpublished local state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError};
use crate::change::{Change, ChangeEvent, ErrorCode};
use crate::config::SyncConfig;
use crate::lock::LockManager;
use crate::scale::ScaleLine;
use crate::shape::{Layer, LayerId, Shape, ShapeId};
use crate::store::{ReconcileReport, ShapeStore, Unpublished};
use crate::throttle::{AdaptiveThrottle, KeyedCoalescer};

/// Upper bound on shapes written by one `put_shapes` call.
const MAX_BATCH: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

/// A local mutation to persist.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeDelta {
    /// Gesture frame. Coalesced per shape.
    Geometry(Shape),
    /// Creation or non-geometric edit. Not throttled.
    Content(Shape),
    Removed { ids: Vec<ShapeId>, deleted_at: i64 },
    Layer(Layer),
    LayerRemoved(LayerId),
    Scale(Option<ScaleLine>),
}

/// One delivery from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Change(ChangeEvent),
    /// The receiver fell behind and `missed` events were lost.
    Resync { missed: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync worker stopped")]
    WorkerStopped,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::WorkerStopped => "E_SYNC_WORKER_STOPPED",
            Self::Backend(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::WorkerStopped => false,
            Self::Backend(e) => e.retryable(),
        }
    }
}

/// Unit of durable state a write replaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum WriteKey {
    Shape(ShapeId),
    Layer(LayerId),
    Scale,
}

#[derive(Debug, Clone)]
enum Write {
    PutShape(Shape),
    DeleteShape { deleted_at: i64 },
    PutLayer(Layer),
    DeleteLayer,
    PutScale(Option<ScaleLine>),
}

enum Command {
    Geometry { shape: Shape, generation: u64 },
    Enqueue(Vec<(WriteKey, Write, u64)>),
    /// Release coalesced frames for these shapes now.
    Flush(Vec<ShapeId>),
    /// Drop the coalesced frame for a shape without writing it.
    Discard(ShapeId),
    /// Reply once nothing is coalesced or queued.
    Drain(oneshot::Sender<()>),
    /// Retry immediately at the base interval.
    Kick,
}

// =============================================================================
// PENDING WRITES
// =============================================================================

/// Latest generation handed to `publish` per key. A key is unpublished
/// until the worker settles that exact generation.
#[derive(Debug, Default)]
struct PendingWrites {
    next_generation: u64,
    latest: HashMap<WriteKey, u64>,
}

impl PendingWrites {
    fn mark(&mut self, key: WriteKey) -> u64 {
        self.next_generation += 1;
        self.latest.insert(key, self.next_generation);
        self.next_generation
    }

    fn settle(&mut self, key: &WriteKey, generation: u64) {
        if self.latest.get(key) == Some(&generation) {
            self.latest.remove(key);
        }
    }

    /// Track `generation` again unless something newer is pending for `key`.
    fn restore(&mut self, key: WriteKey, generation: u64) {
        self.latest.entry(key).or_insert(generation);
    }

    fn unpublished(&self) -> Unpublished {
        let mut out = Unpublished::default();
        for key in self.latest.keys() {
            match key {
                WriteKey::Shape(id) => {
                    out.shapes.insert(id.clone());
                }
                WriteKey::Layer(id) => {
                    out.layers.insert(id.clone());
                }
                WriteKey::Scale => out.scale = true,
            }
        }
        out
    }
}

type SharedPending = Arc<Mutex<PendingWrites>>;

fn pending(shared: &SharedPending) -> std::sync::MutexGuard<'_, PendingWrites> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// BRIDGE
// =============================================================================

/// Bidirectional channel between one session's store and the backend.
pub struct SyncBridge {
    backend: Arc<dyn Backend>,
    config: SyncConfig,
    commands: mpsc::UnboundedSender<Command>,
    pending: SharedPending,
    feed: Option<broadcast::Receiver<ChangeEvent>>,
    worker: JoinHandle<()>,
}

impl SyncBridge {
    /// Start the outbound worker. The feed is not subscribed yet.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: SyncConfig) -> Self {
        let pending = SharedPending::default();
        let (commands, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            backend: Arc::clone(&backend),
            pending: Arc::clone(&pending),
            drag: KeyedCoalescer::new(config.drag_throttle()),
            queue: OutboundQueue::default(),
            throttle: AdaptiveThrottle::new(config.publish_backoff_base(), config.publish_backoff_max()),
            drains: Vec::new(),
        };
        info!(
            client_id = %backend.client_id(),
            drag_throttle_ms = config.drag_throttle_ms,
            backoff_base_ms = config.publish_backoff_base_ms,
            backoff_max_ms = config.publish_backoff_max_ms,
            "sync worker configured"
        );
        let worker = tokio::spawn(worker.run(rx, config.drag_throttle()));
        Self { backend, config, commands, pending, feed: None, worker }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.backend.client_id()
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::WorkerStopped)
    }

    // -------------------------------------------------------------------------
    // OUTBOUND
    // -------------------------------------------------------------------------

    /// Hand a local mutation to the worker. Never waits on I/O.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge has been shut down.
    pub fn publish(&self, delta: ShapeDelta) -> Result<(), SyncError> {
        let mut pending = pending(&self.pending);
        let command = match delta {
            ShapeDelta::Geometry(shape) => {
                let generation = pending.mark(WriteKey::Shape(shape.id.clone()));
                Command::Geometry { shape, generation }
            }
            ShapeDelta::Content(shape) => {
                let key = WriteKey::Shape(shape.id.clone());
                let generation = pending.mark(key.clone());
                Command::Enqueue(vec![(key, Write::PutShape(shape), generation)])
            }
            ShapeDelta::Removed { ids, deleted_at } => Command::Enqueue(
                ids.into_iter()
                    .map(|id| {
                        let key = WriteKey::Shape(id);
                        let generation = pending.mark(key.clone());
                        (key, Write::DeleteShape { deleted_at }, generation)
                    })
                    .collect(),
            ),
            ShapeDelta::Layer(layer) => {
                let key = WriteKey::Layer(layer.id.clone());
                let generation = pending.mark(key.clone());
                Command::Enqueue(vec![(key, Write::PutLayer(layer), generation)])
            }
            ShapeDelta::LayerRemoved(id) => {
                let key = WriteKey::Layer(id);
                let generation = pending.mark(key.clone());
                Command::Enqueue(vec![(key, Write::DeleteLayer, generation)])
            }
            ShapeDelta::Scale(line) => {
                let generation = pending.mark(WriteKey::Scale);
                Command::Enqueue(vec![(WriteKey::Scale, Write::PutScale(line), generation)])
            }
        };
        drop(pending);
        self.send(command)
    }

    /// Publish every shape in `shapes` as a content write.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge has been shut down.
    pub fn publish_shapes(&self, shapes: Vec<Shape>) -> Result<(), SyncError> {
        for shape in shapes {
            self.publish(ShapeDelta::Content(shape))?;
        }
        Ok(())
    }

    /// Release the coalesced end-of-gesture frames for `ids` immediately.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge has been shut down.
    pub fn flush_shapes(&self, ids: Vec<ShapeId>) -> Result<(), SyncError> {
        self.send(Command::Flush(ids))
    }

    /// Stop publishing the coalesced frame for `id`. Frames already released
    /// stay queued.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the bridge has been shut down.
    pub fn discard(&self, id: ShapeId) -> Result<(), SyncError> {
        self.send(Command::Discard(id))
    }

    /// Wait until every published delta has been written or dropped.
    /// Waits indefinitely while the backend is failing; wrap in a timeout.
    ///
    /// # Errors
    ///
    /// Returns `WorkerStopped` if the worker exits first.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Drain(tx))?;
        rx.await.map_err(|_| SyncError::WorkerStopped)
    }

    /// Keys with local state the backend has not acknowledged.
    #[must_use]
    pub fn unpublished(&self) -> Unpublished {
        pending(&self.pending).unpublished()
    }

    // -------------------------------------------------------------------------
    // INBOUND
    // -------------------------------------------------------------------------

    /// Open a fresh feed receiver, replacing any previous one.
    pub fn subscribe(&mut self) {
        self.feed = Some(self.backend.subscribe());
    }

    /// Drop the feed receiver.
    pub fn unsubscribe(&mut self) {
        self.feed = None;
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.feed.is_some()
    }

    /// Next feed delivery. `None` once unsubscribed or the feed closed.
    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        let feed = self.feed.as_mut()?;
        match feed.recv().await {
            Ok(event) => Some(Inbound::Change(event)),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "change feed lagged; full reconcile required");
                Some(Inbound::Resync { missed })
            }
            Err(RecvError::Closed) => {
                self.feed = None;
                None
            }
        }
    }

    /// Non-blocking [`Self::next_inbound`].
    pub fn try_next_inbound(&mut self) -> Option<Inbound> {
        let feed = self.feed.as_mut()?;
        match feed.try_recv() {
            Ok(event) => Some(Inbound::Change(event)),
            Err(TryRecvError::Lagged(missed)) => {
                warn!(missed, "change feed lagged; full reconcile required");
                Some(Inbound::Resync { missed })
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => {
                self.feed = None;
                None
            }
        }
    }

    /// Merge one feed event into `store` through the last-writer-wins rule.
    /// Echoes of this bridge's own writes are skipped, except for shapes
    /// yielding to remote state with nothing left to write: for those the
    /// echo is the durable record. Lock and presence events are left to the
    /// caller. Returns whether the store changed.
    pub fn apply_inbound(&self, store: &mut ShapeStore, event: &ChangeEvent) -> bool {
        if event.is_echo_for(self.client_id()) {
            return self.apply_echo(store, event);
        }
        match &event.change {
            Change::ShapesUpserted { shapes } => !store.apply_remote_snapshot(shapes.clone()).is_empty(),
            Change::ShapesDeleted { ids, deleted_at } => !store.apply_remote_removal(ids, *deleted_at).is_empty(),
            Change::LayerUpserted { layer } => {
                store.apply_remote_layer(layer.clone());
                true
            }
            Change::LayerDeleted { id } => store.apply_remote_layer_removal(id),
            Change::ScaleChanged { line } => store.apply_remote_scale(line.clone()),
            Change::LockChanged { .. } | Change::PresenceChanged { .. } | Change::PresenceLeft { .. } => false,
        }
    }

    fn apply_echo(&self, store: &mut ShapeStore, event: &ChangeEvent) -> bool {
        let Change::ShapesUpserted { shapes } = &event.change else {
            debug!(seq = event.seq, "skipping echo of own write");
            return false;
        };
        let unpublished = self.unpublished();
        let durable: Vec<Shape> = shapes
            .iter()
            .filter(|shape| store.is_yielded(&shape.id) && !unpublished.shapes.contains(&shape.id))
            .cloned()
            .collect();
        if durable.is_empty() {
            debug!(seq = event.seq, "skipping echo of own write");
            return false;
        }
        !store.apply_remote_snapshot(durable).is_empty()
    }

    // -------------------------------------------------------------------------
    // RECONCILIATION
    // -------------------------------------------------------------------------

    /// Reload the full durable state into `store`, keeping unpublished
    /// local writes.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the snapshot could not be loaded.
    pub async fn reconcile_full(&self, store: &mut ShapeStore) -> Result<ReconcileReport, SyncError> {
        let unpublished = self.unpublished();
        let snapshot = self.backend.load_snapshot().await?;
        let report = store.reconcile(snapshot, &unpublished);
        info!(
            applied = report.applied,
            removed = report.removed,
            kept_local = report.kept_local,
            "full reconcile complete"
        );
        Ok(report)
    }

    /// Recover from a connectivity gap: resubscribe, reconcile fully, sweep
    /// expired leases, then retry queued writes at once. Retryable failures
    /// are retried with adaptive backoff until one pass succeeds.
    ///
    /// # Errors
    ///
    /// Returns non-retryable backend errors, or `WorkerStopped`.
    pub async fn reconnect(&mut self, store: &mut ShapeStore, locks: &LockManager) -> Result<ReconcileReport, SyncError> {
        let mut backoff = AdaptiveThrottle::new(self.config.publish_backoff_base(), self.config.publish_backoff_max());
        loop {
            if let Some(at) = backoff.ready_at() {
                tokio::time::sleep_until(at).await;
            }
            backoff.record_attempt_at(Instant::now());
            match self.resync_once(store, locks).await {
                Ok(report) => return Ok(report),
                Err(e) if e.retryable() => {
                    backoff.on_failure();
                    warn!(
                        error = %e,
                        code = e.error_code(),
                        attempt = backoff.consecutive_failures(),
                        "reconnect failed; retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn resync_once(&mut self, store: &mut ShapeStore, locks: &LockManager) -> Result<ReconcileReport, SyncError> {
        // Subscribe before loading so nothing written during the load is missed.
        self.subscribe();
        let report = self.reconcile_full(store).await?;
        locks.sweep_expired().await?;
        self.send(Command::Kick)?;
        info!(client_id = %self.client_id(), "reconnected");
        Ok(report)
    }

    /// Stop the worker after one last attempt to write what is queued.
    pub async fn shutdown(self) {
        let Self { commands, worker, .. } = self;
        drop(commands);
        if let Err(e) = worker.await {
            error!(error = %e, "sync worker panicked");
        }
    }
}

// =============================================================================
// OUTBOUND QUEUE
// =============================================================================

struct Queued {
    write: Write,
    generation: u64,
}

/// One entry per key, in first-queued order.
#[derive(Default)]
struct OutboundQueue {
    order: VecDeque<WriteKey>,
    entries: HashMap<WriteKey, Queued>,
}

impl OutboundQueue {
    /// Queue `write`, replacing an older queued write for the same key.
    /// Returns false if the queued write is already newer.
    fn push(&mut self, key: WriteKey, write: Write, generation: u64) -> bool {
        match self.entries.get_mut(&key) {
            Some(existing) if existing.generation > generation => false,
            Some(existing) => {
                *existing = Queued { write, generation };
                true
            }
            None => {
                self.order.push_back(key.clone());
                self.entries.insert(key, Queued { write, generation });
                true
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn generation(&self, key: &WriteKey) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.generation)
    }

    /// Keys for the next write: a run of shape upserts, a run of shape
    /// deletes sharing one delete stamp, or one other write.
    fn next_batch(&self) -> Vec<WriteKey> {
        let mut batch = Vec::new();
        let mut head: Option<&Write> = None;
        for key in &self.order {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            match head {
                None => {
                    head = Some(&entry.write);
                    batch.push(key.clone());
                }
                Some(first) if batch.len() < MAX_BATCH && batchable(first, &entry.write) => batch.push(key.clone()),
                Some(_) => break,
            }
        }
        batch
    }

    fn request(&self, keys: &[WriteKey]) -> Option<Request> {
        let first = keys.first()?;
        let entry = self.entries.get(first)?;
        let request = match (&entry.write, first) {
            (Write::PutShape(_), _) => Request::PutShapes(
                keys.iter()
                    .filter_map(|key| match self.entries.get(key).map(|e| &e.write) {
                        Some(Write::PutShape(shape)) => Some(shape.clone()),
                        _ => None,
                    })
                    .collect(),
            ),
            (Write::DeleteShape { deleted_at }, WriteKey::Shape(_)) => Request::DeleteShapes(
                keys.iter()
                    .filter_map(|key| match key {
                        WriteKey::Shape(id) => Some(id.clone()),
                        WriteKey::Layer(_) | WriteKey::Scale => None,
                    })
                    .collect(),
                *deleted_at,
            ),
            (Write::PutLayer(layer), _) => Request::PutLayer(layer.clone()),
            (Write::DeleteLayer, WriteKey::Layer(id)) => Request::DeleteLayer(id.clone()),
            (Write::PutScale(line), _) => Request::PutScale(line.clone()),
            (Write::DeleteShape { .. } | Write::DeleteLayer, _) => return None,
        };
        Some(request)
    }

    /// Remove `keys`, returning their generations.
    fn complete(&mut self, keys: &[WriteKey]) -> Vec<(WriteKey, u64)> {
        self.order.retain(|key| !keys.contains(key));
        keys.iter()
            .filter_map(|key| self.entries.remove(key).map(|entry| (key.clone(), entry.generation)))
            .collect()
    }
}

fn batchable(first: &Write, next: &Write) -> bool {
    match (first, next) {
        (Write::PutShape(_), Write::PutShape(_)) => true,
        (Write::DeleteShape { deleted_at: a }, Write::DeleteShape { deleted_at: b }) => a == b,
        _ => false,
    }
}

/// One backend call.
enum Request {
    PutShapes(Vec<Shape>),
    DeleteShapes(Vec<ShapeId>, i64),
    PutLayer(Layer),
    DeleteLayer(LayerId),
    PutScale(Option<ScaleLine>),
}

impl Request {
    async fn send(&self, backend: &dyn Backend) -> Result<(), BackendError> {
        match self {
            Self::PutShapes(shapes) => backend.put_shapes(shapes).await,
            Self::DeleteShapes(ids, deleted_at) => backend.delete_shapes(ids, *deleted_at).await,
            Self::PutLayer(layer) => backend.put_layer(layer).await,
            Self::DeleteLayer(id) => backend.delete_layer(id).await,
            Self::PutScale(line) => backend.put_scale(line.as_ref()).await,
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

struct Worker {
    backend: Arc<dyn Backend>,
    pending: SharedPending,
    drag: KeyedCoalescer<ShapeId, (Shape, u64)>,
    queue: OutboundQueue,
    throttle: AdaptiveThrottle,
    drains: Vec<oneshot::Sender<()>>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, drag_interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(drag_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let retry_at = self.throttle.ready_at().unwrap_or_else(Instant::now);
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        return;
                    };
                    self.handle(command);
                }
                _ = ticker.tick(), if self.drag.has_pending() => {
                    for (shape, generation) in self.drag.poll_at(Instant::now()) {
                        self.enqueue(WriteKey::Shape(shape.id.clone()), Write::PutShape(shape), generation);
                    }
                }
                () = tokio::time::sleep_until(retry_at), if !self.queue.is_empty() => {
                    self.attempt().await;
                }
            }
            self.notify_drains();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Geometry { shape, generation } => {
                let id = shape.id.clone();
                if let Some((shape, generation)) = self.drag.push_at(Instant::now(), id, (shape, generation)) {
                    self.enqueue(WriteKey::Shape(shape.id.clone()), Write::PutShape(shape), generation);
                }
            }
            Command::Enqueue(writes) => {
                for (key, write, generation) in writes {
                    if let WriteKey::Shape(id) = &key {
                        self.drop_frame(id);
                    }
                    self.enqueue(key, write, generation);
                }
            }
            Command::Flush(ids) => {
                for id in ids {
                    if let Some((shape, generation)) = self.drag.flush_key(&id) {
                        self.enqueue(WriteKey::Shape(id), Write::PutShape(shape), generation);
                    }
                }
            }
            Command::Discard(id) => self.drop_frame(&id),
            Command::Drain(done) => {
                for (shape, generation) in self.drag.flush_all() {
                    self.enqueue(WriteKey::Shape(shape.id.clone()), Write::PutShape(shape), generation);
                }
                self.drains.push(done);
            }
            Command::Kick => self.throttle.reset(),
        }
    }

    /// Drop a coalesced frame that will never be written. An older frame
    /// already queued for the shape stays unpublished until it lands.
    fn drop_frame(&mut self, id: &ShapeId) {
        let Some((_, generation)) = self.drag.flush_key(id) else {
            return;
        };
        let key = WriteKey::Shape(id.clone());
        let mut pending = pending(&self.pending);
        pending.settle(&key, generation);
        if let Some(queued) = self.queue.generation(&key) {
            pending.restore(key, queued);
        }
    }

    fn enqueue(&mut self, key: WriteKey, write: Write, generation: u64) {
        if !self.queue.push(key.clone(), write, generation) {
            debug!(?key, generation, "superseded by a newer queued write");
            pending(&self.pending).settle(&key, generation);
        }
    }

    fn settle(&self, completed: Vec<(WriteKey, u64)>) {
        let mut pending = pending(&self.pending);
        for (key, generation) in completed {
            pending.settle(&key, generation);
        }
    }

    /// Write the next batch once. Returns whether the queue shrank.
    async fn attempt(&mut self) -> bool {
        let keys = self.queue.next_batch();
        let Some(request) = self.queue.request(&keys) else {
            let completed = self.queue.complete(&keys);
            self.settle(completed);
            return !keys.is_empty();
        };

        let backend = Arc::clone(&self.backend);
        let result = self.throttle.run(|| request.send(backend.as_ref())).await;
        match result {
            Ok(()) => {
                debug!(count = keys.len(), "published");
                let completed = self.queue.complete(&keys);
                self.settle(completed);
                true
            }
            Err(e) if e.retryable() => {
                warn!(
                    error = %e,
                    code = e.error_code(),
                    attempt = self.throttle.consecutive_failures(),
                    retry_in_ms = u64::try_from(self.throttle.interval().as_millis()).unwrap_or(u64::MAX),
                    queued = self.queue.len(),
                    "publish failed; will retry"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, code = e.error_code(), count = keys.len(), "publish rejected; dropping write");
                let completed = self.queue.complete(&keys);
                self.settle(completed);
                true
            }
        }
    }

    fn notify_drains(&mut self) {
        if self.drains.is_empty() || !self.queue.is_empty() || self.drag.has_pending() {
            return;
        }
        for done in self.drains.drain(..) {
            if done.send(()).is_err() {
                debug!("drain waiter went away");
            }
        }
    }

    async fn shutdown(&mut self) {
        for (shape, generation) in self.drag.flush_all() {
            self.enqueue(WriteKey::Shape(shape.id.clone()), Write::PutShape(shape), generation);
        }
        while !self.queue.is_empty() {
            if !self.attempt().await {
                break;
            }
        }
        self.notify_drains();
        if self.queue.is_empty() {
            info!("sync worker stopped");
        } else {
            error!(count = self.queue.len(), "sync worker stopped with unpublished writes");
        }
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
