//! Shape store — one session's in-memory view of the canvas.
//!
//! DESIGN
//! ======
//! Local mutations apply immediately and return their effect (the changed
//! shapes, or the removed ids) so the caller can hand it to the sync bridge.
//! Operations on unknown ids are no-ops with an empty effect: a remote
//! delete racing a local move must never crash the session.
//!
//! CONFLICT RESOLUTION
//! ===================
//! Remote records merge at shape granularity, last-writer-wins on the
//! client-stamped `client_updated_at`: the incoming record replaces the
//! local one unless the local stamp is strictly greater. Deletes leave a
//! tombstone carrying the delete's client stamp, so a late upsert that is
//! not newer than the delete cannot resurrect the shape. Tombstones are
//! bounded; past the limit the oldest are evicted first.
//!
//! A shape can be marked as yielding to remote state after its lease was
//! denied or lost. Its local record carries stamps from frames that were
//! never written, so the next remote record for it is applied regardless
//! of stamps. Any later local edit clears the mark.
//!
//! Measurements are derived on every read from the current scale line and
//! never cached.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::change::now_ms;
use crate::config::DEFAULT_DUPLICATE_OFFSET;
use crate::scale::{Measurement, ScaleLine};
use crate::shape::{Layer, LayerId, Shape, ShapeId, UserId, new_id};

/// Default bound on tombstones kept per store or hub.
pub const MAX_TOMBSTONES: usize = 10_000;

// =============================================================================
// TYPES
// =============================================================================

/// Effect of a local delete.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Removal {
    pub ids: Vec<ShapeId>,
    /// Client stamp recorded on the tombstones.
    pub deleted_at: i64,
}

impl Removal {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Full durable state, as loaded for reconciliation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub shapes: Vec<Shape>,
    pub layers: Vec<Layer>,
    pub scale_line: Option<ScaleLine>,
}

/// Local writes not yet acknowledged by the backend. Reconciliation keeps
/// these rather than letting the durable snapshot erase them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unpublished {
    pub shapes: HashSet<ShapeId>,
    pub layers: HashSet<LayerId>,
    pub scale: bool,
}

/// What a full reconciliation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    /// Remote records that replaced or added local ones.
    pub applied: usize,
    /// Local shapes dropped because the durable store no longer has them.
    pub removed: usize,
    /// Local shapes kept because their writes are still in flight.
    pub kept_local: usize,
}

// =============================================================================
// STORE
// =============================================================================

/// In-memory canvas state for one session.
pub struct ShapeStore {
    user_id: UserId,
    shapes: HashMap<ShapeId, Shape>,
    layers: HashMap<LayerId, Layer>,
    selection: HashSet<ShapeId>,
    scale_line: Option<ScaleLine>,
    tombstones: HashMap<ShapeId, i64>,
    max_tombstones: usize,
    /// Shapes whose next remote record wins regardless of stamps.
    yielded: HashSet<ShapeId>,
    duplicate_offset: f64,
    last_stamp: i64,
}

impl ShapeStore {
    /// Empty store whose local edits are attributed to `user_id`.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            shapes: HashMap::new(),
            layers: HashMap::new(),
            selection: HashSet::new(),
            scale_line: None,
            tombstones: HashMap::new(),
            max_tombstones: MAX_TOMBSTONES,
            yielded: HashSet::new(),
            duplicate_offset: DEFAULT_DUPLICATE_OFFSET,
            last_stamp: 0,
        }
    }

    #[must_use]
    pub fn with_duplicate_offset(mut self, offset: f64) -> Self {
        self.duplicate_offset = offset;
        self
    }

    #[must_use]
    pub fn with_tombstone_limit(mut self, max: usize) -> Self {
        self.max_tombstones = max.max(1);
        self
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Client stamp for a local edit: wall clock, strictly increasing within the session.
    fn stamp(&mut self) -> i64 {
        let now = now_ms().max(self.last_stamp + 1);
        self.last_stamp = now;
        now
    }

    fn touch(&mut self, id: &ShapeId) -> Option<&mut Shape> {
        let stamp = self.stamp();
        let user = self.user_id.clone();
        self.yielded.remove(id);
        let shape = self.shapes.get_mut(id)?;
        shape.client_updated_at = stamp;
        shape.updated_by = user;
        Some(shape)
    }

    // -------------------------------------------------------------------------
    // LOCAL MUTATIONS
    // -------------------------------------------------------------------------

    /// Insert or replace a shape as a local edit. New shapes get creation
    /// fields stamped if the caller left them empty.
    pub fn upsert(&mut self, mut shape: Shape) -> Shape {
        let stamp = self.stamp();
        if shape.created_at == 0 {
            shape.created_at = stamp;
        }
        if shape.created_by.is_empty() {
            shape.created_by = self.user_id.clone();
        }
        shape.updated_by = self.user_id.clone();
        shape.client_updated_at = stamp;
        self.tombstones.remove(&shape.id);
        self.yielded.remove(&shape.id);
        self.shapes.insert(shape.id.clone(), shape.clone());
        shape
    }

    /// Delete shapes. Unknown ids are skipped.
    pub fn remove(&mut self, ids: &[ShapeId]) -> Removal {
        let deleted_at = self.stamp();
        let mut removed = Vec::new();
        for id in ids {
            if self.shapes.remove(id).is_some() {
                self.selection.remove(id);
                self.yielded.remove(id);
                self.tombstones.insert(id.clone(), deleted_at);
                removed.push(id.clone());
            } else {
                debug!(shape_id = %id, "remove: unknown shape");
            }
        }
        bound_tombstones(&mut self.tombstones, self.max_tombstones);
        Removal { ids: removed, deleted_at }
    }

    pub fn move_by(&mut self, ids: &[ShapeId], dx: f64, dy: f64) -> Vec<Shape> {
        self.edit_each(ids, "move_by", |shape| {
            shape.translate(dx, dy);
            true
        })
    }

    pub fn rotate_by(&mut self, ids: &[ShapeId], degrees: f64) -> Vec<Shape> {
        self.edit_each(ids, "rotate_by", |shape| {
            shape.rotate(degrees);
            true
        })
    }

    pub fn resize(&mut self, id: &ShapeId, w: f64, h: f64) -> Option<Shape> {
        self.edit_each(std::slice::from_ref(id), "resize", |shape| {
            shape.resize(w, h);
            true
        })
        .pop()
    }

    pub fn recolor(&mut self, ids: &[ShapeId], color: &str) -> Vec<Shape> {
        self.edit_each(ids, "recolor", |shape| {
            shape.color = color.to_string();
            true
        })
    }

    /// Relabel a text shape. Other kinds are left untouched.
    pub fn set_text(&mut self, id: &ShapeId, text: &str) -> Option<Shape> {
        self.edit_each(std::slice::from_ref(id), "set_text", |shape| shape.set_text(text))
            .pop()
    }

    pub fn set_stroke_width(&mut self, ids: &[ShapeId], width: f64) -> Vec<Shape> {
        self.edit_each(ids, "set_stroke_width", |shape| shape.set_stroke_width(width))
    }

    /// Move shapes onto a layer, or off any layer with `None`.
    /// Assigning to a layer this store does not know is a no-op.
    pub fn assign_layer(&mut self, ids: &[ShapeId], layer_id: Option<&LayerId>) -> Vec<Shape> {
        if let Some(layer_id) = layer_id {
            if !self.layers.contains_key(layer_id) {
                debug!(layer_id = %layer_id, "assign_layer: unknown layer");
                return Vec::new();
            }
        }
        self.edit_each(ids, "assign_layer", |shape| {
            shape.layer_id = layer_id.cloned();
            true
        })
    }

    /// Clone shapes with fresh ids, offset position and new creator/timestamps.
    pub fn duplicate(&mut self, ids: &[ShapeId]) -> Vec<Shape> {
        let offset = self.duplicate_offset;
        let originals: Vec<Shape> = ids
            .iter()
            .filter_map(|id| {
                let found = self.shapes.get(id).cloned();
                if found.is_none() {
                    debug!(shape_id = %id, "duplicate: unknown shape");
                }
                found
            })
            .collect();

        originals
            .into_iter()
            .map(|mut copy| {
                copy.id = new_id();
                copy.translate(offset, offset);
                copy.created_at = 0;
                copy.created_by = UserId::new();
                copy.updated_at = 0;
                self.upsert(copy)
            })
            .collect()
    }

    /// Apply `edit` to each known id, stamping those it reports as changed.
    fn edit_each(&mut self, ids: &[ShapeId], op: &'static str, mut edit: impl FnMut(&mut Shape) -> bool) -> Vec<Shape> {
        let mut changed = Vec::new();
        for id in ids {
            let Some(shape) = self.shapes.get_mut(id) else {
                debug!(shape_id = %id, op, "unknown shape");
                continue;
            };
            if !edit(shape) {
                debug!(shape_id = %id, op, kind = shape.type_name(), "edit does not apply to shape kind");
                continue;
            }
            if let Some(shape) = self.touch(id) {
                changed.push(shape.clone());
            }
        }
        changed
    }

    /// Set or clear the calibration line. Audit fields are stamped here.
    pub fn set_scale_line(&mut self, line: Option<ScaleLine>) -> Option<ScaleLine> {
        let stamp = self.stamp();
        let stamped = line.map(|mut line| {
            match &self.scale_line {
                Some(previous) if !previous.created_by.is_empty() => {
                    line.created_by = previous.created_by.clone();
                    line.created_at = previous.created_at;
                }
                _ => {
                    line.created_by = self.user_id.clone();
                    line.created_at = stamp;
                }
            }
            line.updated_by = self.user_id.clone();
            line.updated_at = stamp;
            line
        });
        self.scale_line.clone_from(&stamped);
        stamped
    }

    // -------------------------------------------------------------------------
    // LAYERS
    // -------------------------------------------------------------------------

    pub fn upsert_layer(&mut self, layer: Layer) -> Layer {
        self.layers.insert(layer.id.clone(), layer.clone());
        layer
    }

    pub fn rename_layer(&mut self, id: &LayerId, name: &str) -> Option<Layer> {
        self.edit_layer(id, |layer| layer.name = name.to_string())
    }

    pub fn set_layer_visible(&mut self, id: &LayerId, visible: bool) -> Option<Layer> {
        self.edit_layer(id, |layer| layer.visible = visible)
    }

    fn edit_layer(&mut self, id: &LayerId, edit: impl FnOnce(&mut Layer)) -> Option<Layer> {
        let Some(layer) = self.layers.get_mut(id) else {
            debug!(layer_id = %id, "unknown layer");
            return None;
        };
        edit(layer);
        Some(layer.clone())
    }

    /// Delete a layer. Member shapes are orphaned to "no layer", never
    /// deleted; the orphaned shapes are returned so they can be published.
    pub fn remove_layer(&mut self, id: &LayerId) -> Vec<Shape> {
        if self.layers.remove(id).is_none() {
            debug!(layer_id = %id, "remove_layer: unknown layer");
            return Vec::new();
        }
        let members: Vec<ShapeId> = self
            .shapes
            .values()
            .filter(|s| s.layer_id.as_ref() == Some(id))
            .map(|s| s.id.clone())
            .collect();
        self.edit_each(&members, "orphan", |shape| {
            shape.layer_id = None;
            true
        })
    }

    // -------------------------------------------------------------------------
    // SELECTION
    // -------------------------------------------------------------------------

    /// Replace the selection. Unknown ids are ignored.
    pub fn select(&mut self, ids: &[ShapeId]) {
        self.selection = ids
            .iter()
            .filter(|id| self.shapes.contains_key(*id))
            .cloned()
            .collect();
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Selected ids in a stable order.
    #[must_use]
    pub fn selected(&self) -> Vec<ShapeId> {
        let mut ids: Vec<ShapeId> = self.selection.iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    // -------------------------------------------------------------------------
    // REMOTE APPLICATION
    // -------------------------------------------------------------------------

    /// Let the next remote record for `id` replace the local one even if the
    /// local stamp is newer. Used when a gesture's frames were dropped
    /// unwritten. Unknown ids are ignored.
    pub fn yield_to_remote(&mut self, id: &ShapeId) {
        if self.shapes.contains_key(id) {
            debug!(shape_id = %id, "yielding to remote state");
            self.yielded.insert(id.clone());
        }
    }

    #[must_use]
    pub fn is_yielded(&self, id: &str) -> bool {
        self.yielded.contains(id)
    }

    /// Merge remote shape records by last-writer-wins. Returns the ids that
    /// were applied; records that lost the comparison are discarded.
    pub fn apply_remote_snapshot(&mut self, shapes: Vec<Shape>) -> Vec<ShapeId> {
        shapes
            .into_iter()
            .filter_map(|shape| {
                let id = shape.id.clone();
                self.merge_remote(shape).then_some(id)
            })
            .collect()
    }

    fn merge_remote(&mut self, incoming: Shape) -> bool {
        if let Some(&deleted_at) = self.tombstones.get(&incoming.id) {
            if incoming.client_updated_at <= deleted_at {
                debug!(shape_id = %incoming.id, deleted_at, "remote upsert older than local delete");
                return false;
            }
            self.tombstones.remove(&incoming.id);
        }
        if self.yielded.remove(&incoming.id) {
            debug!(shape_id = %incoming.id, remote = incoming.client_updated_at, "applied remote over yielded shape");
        } else if let Some(local) = self.shapes.get(&incoming.id) {
            if local.client_updated_at > incoming.client_updated_at {
                debug!(
                    shape_id = %incoming.id,
                    local = local.client_updated_at,
                    remote = incoming.client_updated_at,
                    "kept newer local shape"
                );
                return false;
            }
        }
        self.shapes.insert(incoming.id.clone(), incoming);
        true
    }

    /// Apply a remote delete. A local record edited after the delete survives.
    pub fn apply_remote_removal(&mut self, ids: &[ShapeId], deleted_at: i64) -> Vec<ShapeId> {
        let mut removed = Vec::new();
        for id in ids {
            let newer_local = !self.yielded.contains(id)
                && self
                    .shapes
                    .get(id)
                    .is_some_and(|local| local.client_updated_at > deleted_at);
            if newer_local {
                debug!(shape_id = %id, deleted_at, "kept local shape edited after remote delete");
                continue;
            }
            let tombstone = self.tombstones.entry(id.clone()).or_insert(deleted_at);
            *tombstone = (*tombstone).max(deleted_at);
            self.yielded.remove(id);
            if self.shapes.remove(id).is_some() {
                self.selection.remove(id);
                removed.push(id.clone());
            }
        }
        bound_tombstones(&mut self.tombstones, self.max_tombstones);
        removed
    }

    pub fn apply_remote_layer(&mut self, layer: Layer) {
        self.layers.insert(layer.id.clone(), layer);
    }

    /// Remote layer delete. Member shapes simply read as layer-less until the
    /// deleting session's orphaning writes arrive.
    pub fn apply_remote_layer_removal(&mut self, id: &LayerId) -> bool {
        self.layers.remove(id).is_some()
    }

    /// Apply a remote calibration change. When both sides have a line, the
    /// later `updated_at` wins.
    pub fn apply_remote_scale(&mut self, line: Option<ScaleLine>) -> bool {
        if let (Some(local), Some(remote)) = (&self.scale_line, &line) {
            if local.updated_at > remote.updated_at {
                debug!(local = local.updated_at, remote = remote.updated_at, "kept newer local scale line");
                return false;
            }
        }
        self.scale_line = line;
        true
    }

    /// Reconcile against a full durable snapshot after a connectivity gap.
    ///
    /// Remote records merge through the usual last-writer-wins rule. Local
    /// shapes missing from the snapshot are dropped unless their writes are
    /// still unpublished. Tombstones are only kept for unpublished deletes.
    /// A yielded shape with a write still in flight keeps its mark until
    /// that write lands, since the snapshot predates it.
    pub fn reconcile(&mut self, snapshot: Snapshot, unpublished: &Unpublished) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let remote_ids: HashSet<ShapeId> = snapshot.shapes.iter().map(|s| s.id.clone()).collect();

        self.tombstones.retain(|id, _| unpublished.shapes.contains(id));
        let deferred: Vec<ShapeId> = self
            .yielded
            .iter()
            .filter(|id| unpublished.shapes.contains(*id))
            .cloned()
            .collect();
        for id in &deferred {
            self.yielded.remove(id);
        }
        report.applied = self.apply_remote_snapshot(snapshot.shapes).len();
        self.yielded.extend(deferred);

        let stale: Vec<ShapeId> = self
            .shapes
            .keys()
            .filter(|id| !remote_ids.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if unpublished.shapes.contains(&id) {
                report.kept_local += 1;
                continue;
            }
            self.shapes.remove(&id);
            self.selection.remove(&id);
            self.yielded.remove(&id);
            report.removed += 1;
        }

        let remote_layers: HashSet<LayerId> = snapshot.layers.iter().map(|l| l.id.clone()).collect();
        self.layers
            .retain(|id, _| remote_layers.contains(id) || unpublished.layers.contains(id));
        for layer in snapshot.layers {
            if !unpublished.layers.contains(&layer.id) {
                self.layers.insert(layer.id.clone(), layer);
            }
        }

        if !unpublished.scale {
            self.scale_line = snapshot.scale_line;
        }
        report
    }

    // -------------------------------------------------------------------------
    // READS
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Shape> {
        self.shapes.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.shapes.contains_key(id)
    }

    pub fn shapes(&self) -> impl Iterator<Item = &Shape> {
        self.shapes.values()
    }

    /// All shapes ordered by `(created_at, id)`.
    #[must_use]
    pub fn sorted_shapes(&self) -> Vec<&Shape> {
        let mut shapes: Vec<&Shape> = self.shapes.values().collect();
        shapes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        shapes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    #[must_use]
    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    /// The shape's layer, or `None` when unset or dangling.
    #[must_use]
    pub fn layer_of(&self, shape: &Shape) -> Option<&Layer> {
        shape.layer_id.as_deref().and_then(|id| self.layers.get(id))
    }

    /// Shape color, falling back to the layer's default when the shape has none.
    #[must_use]
    pub fn effective_color<'a>(&'a self, shape: &'a Shape) -> &'a str {
        if !shape.color.is_empty() {
            return &shape.color;
        }
        self.layer_of(shape)
            .and_then(|layer| layer.color.as_deref())
            .unwrap_or(crate::shape::DEFAULT_COLOR)
    }

    /// Shapes not hidden by their layer. Dangling layer references are visible.
    #[must_use]
    pub fn visible_shapes(&self) -> Vec<&Shape> {
        self.sorted_shapes()
            .into_iter()
            .filter(|shape| self.layer_of(shape).is_none_or(|layer| layer.visible))
            .collect()
    }

    #[must_use]
    pub fn scale_line(&self) -> Option<&ScaleLine> {
        self.scale_line.as_ref()
    }

    /// Current measurement of one shape. `None` only for unknown ids; an
    /// uncalibrated canvas yields a measurement whose real values are `None`.
    #[must_use]
    pub fn measure(&self, id: &str) -> Option<Measurement> {
        let shape = self.shapes.get(id)?;
        let (length, area) = shape.pixel_metrics();
        Some(Measurement::from_pixels(length, area, self.scale_line.as_ref()))
    }

    /// Sum of the measurements of the known ids.
    #[must_use]
    pub fn measure_total(&self, ids: &[ShapeId]) -> Measurement {
        let scale = self.scale_line.as_ref();
        ids.iter()
            .filter_map(|id| self.measure(id))
            .fold(Measurement::from_pixels(0.0, 0.0, scale), Measurement::combine)
    }

    /// Client stamp of the tombstone for `id`, if it was deleted.
    #[must_use]
    pub fn tombstone(&self, id: &str) -> Option<i64> {
        self.tombstones.get(id).copied()
    }
}

/// Evict the oldest tombstones beyond `max`.
pub(crate) fn bound_tombstones(tombstones: &mut HashMap<ShapeId, i64>, max: usize) {
    let excess = tombstones.len().saturating_sub(max);
    if excess == 0 {
        return;
    }
    let mut by_age: Vec<(i64, ShapeId)> = tombstones.iter().map(|(id, &at)| (at, id.clone())).collect();
    by_age.sort_unstable();
    for (_, id) in by_age.into_iter().take(excess) {
        tombstones.remove(&id);
    }
    debug!(evicted = excess, max, "evicted oldest tombstones");
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
