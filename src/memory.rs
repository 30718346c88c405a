//! In-process backend — shared collections with broadcast fan-out.
//!
//! DESIGN
//! ======
//! A `MemoryHub` owns one canvas's durable state. Each session gets its own
//! `MemoryBackend` handle from [`MemoryHub::connect`]; every accepted write
//! is stamped with the next feed sequence number and fanned out to every
//! connected, online client, the writer included.
//!
//! The hub applies the same last-writer-wins rule as the session store, so
//! a retried write that lost the race cannot regress durable state, and a
//! late upsert cannot resurrect a deleted shape. Server `updated_at` values
//! are strictly monotonic per hub.
//!
//! FAULT INJECTION
//! ===============
//! `fail_next_writes(n)` makes the next `n` shape, layer or scale writes
//! from any client fail with a retryable error. Lease and presence calls
//! are unaffected. `set_online(client, false)` makes every call from that
//! client fail and stops delivering its feed, so it misses events exactly
//! as a disconnected session would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::{Backend, BackendError};
use crate::change::{Change, ChangeEvent, ClientId, now_ms};
use crate::config::{DEFAULT_FEED_CAPACITY, SyncConfig};
use crate::lock::Lease;
use crate::presence::PresenceEntry;
use crate::scale::ScaleLine;
use crate::shape::{Layer, LayerId, Shape, ShapeId, UserId};
use crate::store::{MAX_TOMBSTONES, bound_tombstones};

// =============================================================================
// HUB
// =============================================================================

#[derive(Default)]
struct HubInner {
    shapes: HashMap<ShapeId, Shape>,
    tombstones: HashMap<ShapeId, i64>,
    layers: HashMap<LayerId, Layer>,
    scale: Option<ScaleLine>,
    locks: HashMap<ShapeId, Lease>,
    presence: HashMap<(UserId, String), PresenceEntry>,
    feeds: HashMap<ClientId, broadcast::Sender<ChangeEvent>>,
    offline: HashSet<ClientId>,
    seq: u64,
    last_write_at: i64,
    fail_next_writes: u32,
    shape_writes: u64,
}

impl HubInner {
    fn write_stamp(&mut self) -> i64 {
        self.last_write_at = now_ms().max(self.last_write_at + 1);
        self.last_write_at
    }

    fn check_online(&self, client_id: &str) -> Result<(), BackendError> {
        if self.offline.contains(client_id) {
            return Err(BackendError::Unavailable(format!("client {client_id} is offline")));
        }
        Ok(())
    }

    fn check_write(&mut self, client_id: &str) -> Result<(), BackendError> {
        self.check_online(client_id)?;
        if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            return Err(BackendError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    /// Fan a change out to every online subscriber.
    fn emit(&mut self, origin: &str, change: Change) {
        self.seq += 1;
        let event = ChangeEvent::new(origin, self.seq, change);
        for (client_id, feed) in &self.feeds {
            if self.offline.contains(client_id) || feed.receiver_count() == 0 {
                continue;
            }
            if feed.send(event.clone()).is_err() {
                debug!(%client_id, seq = event.seq, "feed closed during send");
            }
        }
    }
}

/// Durable state for one canvas, shared by every connected session.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
    feed_capacity: usize,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl MemoryHub {
    /// New empty hub. `feed_capacity` bounds each client's undelivered events.
    #[must_use]
    pub fn new(feed_capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(HubInner::default())), feed_capacity: feed_capacity.max(1) }
    }

    /// New empty hub sized by `config.feed_capacity`.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.feed_capacity)
    }

    #[must_use]
    pub fn feed_capacity(&self) -> usize {
        self.feed_capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle for one session. Reconnecting with the same id reuses its feed.
    #[must_use]
    pub fn connect(&self, client_id: impl Into<ClientId>) -> MemoryBackend {
        let client_id = client_id.into();
        let capacity = self.feed_capacity;
        self.lock()
            .feeds
            .entry(client_id.clone())
            .or_insert_with(|| broadcast::channel(capacity).0);
        MemoryBackend { hub: self.clone(), client_id }
    }

    /// Fail the next `count` shape, layer or scale writes with a retryable error.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().fail_next_writes = count;
    }

    /// Take a client offline (calls fail, feed goes dark) or bring it back.
    pub fn set_online(&self, client_id: &str, online: bool) {
        let mut inner = self.lock();
        if online {
            inner.offline.remove(client_id);
        } else {
            inner.offline.insert(client_id.to_string());
        }
    }

    /// Current durable shapes, ordered by id.
    #[must_use]
    pub fn shapes(&self) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = self.lock().shapes.values().cloned().collect();
        shapes.sort_by(|a, b| a.id.cmp(&b.id));
        shapes
    }

    #[must_use]
    pub fn shape(&self, id: &str) -> Option<Shape> {
        self.lock().shapes.get(id).cloned()
    }

    #[must_use]
    pub fn lease(&self, shape_id: &str) -> Option<Lease> {
        self.lock().locks.get(shape_id).cloned()
    }

    /// Write a lease directly, bypassing compare-and-swap. Models a session
    /// that crashed while holding it.
    pub fn insert_lease(&self, lease: Lease) {
        self.lock().locks.insert(lease.shape_id.clone(), lease);
    }

    #[must_use]
    pub fn scale(&self) -> Option<ScaleLine> {
        self.lock().scale.clone()
    }

    #[must_use]
    pub fn layer(&self, id: &str) -> Option<Layer> {
        self.lock().layers.get(id).cloned()
    }

    /// Number of successful `put_shapes` calls across all clients.
    #[must_use]
    pub fn shape_writes(&self) -> u64 {
        self.lock().shape_writes
    }

    /// Sequence number of the last emitted change.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.lock().seq
    }
}

// =============================================================================
// BACKEND HANDLE
// =============================================================================

/// One session's connection to a `MemoryHub`.
#[derive(Clone)]
pub struct MemoryBackend {
    hub: MemoryHub,
    client_id: ClientId,
}

impl MemoryBackend {
    #[must_use]
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn put_shapes(&self, shapes: &[Shape]) -> Result<(), BackendError> {
        let mut inner = self.hub.lock();
        inner.check_write(&self.client_id)?;
        inner.shape_writes += 1;

        let mut accepted = Vec::with_capacity(shapes.len());
        for shape in shapes {
            if inner.tombstones.get(&shape.id).is_some_and(|&at| shape.client_updated_at <= at) {
                debug!(shape_id = %shape.id, "hub: upsert older than delete");
                continue;
            }
            if inner
                .shapes
                .get(&shape.id)
                .is_some_and(|stored| stored.client_updated_at > shape.client_updated_at)
            {
                debug!(shape_id = %shape.id, "hub: stored record is newer");
                continue;
            }
            let mut record = shape.clone();
            record.updated_at = inner.write_stamp();
            inner.tombstones.remove(&record.id);
            inner.shapes.insert(record.id.clone(), record.clone());
            accepted.push(record);
        }

        if !accepted.is_empty() {
            inner.emit(&self.client_id, Change::ShapesUpserted { shapes: accepted });
        }
        Ok(())
    }

    async fn delete_shapes(&self, ids: &[ShapeId], deleted_at: i64) -> Result<(), BackendError> {
        let mut inner = self.hub.lock();
        inner.check_write(&self.client_id)?;
        for id in ids {
            let newer = inner.shapes.get(id).is_some_and(|s| s.client_updated_at > deleted_at);
            if newer {
                continue;
            }
            inner.shapes.remove(id);
            let tombstone = inner.tombstones.entry(id.clone()).or_insert(deleted_at);
            *tombstone = (*tombstone).max(deleted_at);
        }
        bound_tombstones(&mut inner.tombstones, MAX_TOMBSTONES);
        inner.emit(&self.client_id, Change::ShapesDeleted { ids: ids.to_vec(), deleted_at });
        Ok(())
    }

    async fn load_shapes(&self) -> Result<Vec<Shape>, BackendError> {
        let inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        Ok(inner.shapes.values().cloned().collect())
    }

    async fn put_layer(&self, layer: &Layer) -> Result<(), BackendError> {
        let mut inner = self.hub.lock();
        inner.check_write(&self.client_id)?;
        inner.layers.insert(layer.id.clone(), layer.clone());
        inner.emit(&self.client_id, Change::LayerUpserted { layer: layer.clone() });
        Ok(())
    }

    async fn delete_layer(&self, id: &LayerId) -> Result<(), BackendError> {
        let mut inner = self.hub.lock();
        inner.check_write(&self.client_id)?;
        inner.layers.remove(id);
        inner.emit(&self.client_id, Change::LayerDeleted { id: id.clone() });
        Ok(())
    }

    async fn load_layers(&self) -> Result<Vec<Layer>, BackendError> {
        let inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        Ok(inner.layers.values().cloned().collect())
    }

    async fn put_scale(&self, line: Option<&ScaleLine>) -> Result<(), BackendError> {
        let mut inner = self.hub.lock();
        inner.check_write(&self.client_id)?;
        inner.scale = line.cloned();
        inner.emit(&self.client_id, Change::ScaleChanged { line: line.cloned() });
        Ok(())
    }

    async fn load_scale(&self) -> Result<Option<ScaleLine>, BackendError> {
        let inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        Ok(inner.scale.clone())
    }

    async fn get_lock(&self, shape_id: &ShapeId) -> Result<Option<Lease>, BackendError> {
        let inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        Ok(inner.locks.get(shape_id).cloned())
    }

    async fn list_locks(&self) -> Result<Vec<Lease>, BackendError> {
        let inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        Ok(inner.locks.values().cloned().collect())
    }

    async fn swap_lock(
        &self,
        shape_id: &ShapeId,
        expected: Option<&Lease>,
        new: Option<&Lease>,
    ) -> Result<bool, BackendError> {
        let mut inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        if inner.locks.get(shape_id) != expected {
            return Ok(false);
        }
        match new {
            Some(lease) => inner.locks.insert(shape_id.clone(), lease.clone()),
            None => inner.locks.remove(shape_id),
        };
        inner.emit(&self.client_id, Change::LockChanged { shape_id: shape_id.clone(), lease: new.cloned() });
        Ok(true)
    }

    async fn put_presence(&self, entry: &PresenceEntry) -> Result<(), BackendError> {
        let mut inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        inner
            .presence
            .insert((entry.user_id.clone(), entry.view.clone()), entry.clone());
        inner.emit(&self.client_id, Change::PresenceChanged { entry: entry.clone() });
        Ok(())
    }

    async fn delete_presence(&self, user_id: &UserId, view: &str) -> Result<(), BackendError> {
        let mut inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        if inner.presence.remove(&(user_id.clone(), view.to_string())).is_some() {
            inner.emit(&self.client_id, Change::PresenceLeft { user_id: user_id.clone(), view: view.to_string() });
        }
        Ok(())
    }

    async fn list_presence(&self) -> Result<Vec<PresenceEntry>, BackendError> {
        let inner = self.hub.lock();
        inner.check_online(&self.client_id)?;
        Ok(inner.presence.values().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        let capacity = self.hub.feed_capacity;
        self.hub
            .lock()
            .feeds
            .entry(self.client_id.clone())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
