//! Shape and layer records: what is on the canvas and how it persists.
//!
//! A `Shape` is a common base (id, bounding box, rotation, color, layer,
//! provenance, bookkeeping) plus a `ShapeKind` carrying only the fields that
//! mean something for that kind. Records serialize flat, with a `type` tag,
//! in the camelCase form stored in the `shapes` collection.
//!
//! Vertex-based kinds store `points` relative to the bounding box's minimum
//! corner: absolute vertex `k` is `(x + points[2k], y + points[2k + 1])`.
//! Every constructor and mutator here keeps `(x, y, w, h)` and `points`
//! consistent.

#[cfg(test)]
#[path = "shape_test.rs"]
mod shape_test;

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scale::{Point, pixel_area, pixel_length, pixel_perimeter, points_from_flat};

/// Opaque unique shape identifier.
pub type ShapeId = String;

/// Opaque unique layer identifier.
pub type LayerId = String;

/// User (or session) identity as recorded on shapes, leases and presence.
pub type UserId = String;

pub const DEFAULT_COLOR: &str = "#1F1A17";

/// Fresh random identifier for shapes and layers.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Where a shape came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Manual,
    Ai,
}

/// Kind-specific shape fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ShapeKind {
    Rectangle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stroke_width: Option<f64>,
    },
    Circle {
        radius: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stroke_width: Option<f64>,
    },
    Text {
        text: String,
        font_size: f64,
    },
    Line {
        points: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stroke_width: Option<f64>,
    },
    Polyline {
        points: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stroke_width: Option<f64>,
    },
    Polygon {
        points: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stroke_width: Option<f64>,
    },
}

/// Vertex-based kinds accepted by [`Shape::from_vertices`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    Line,
    Polyline,
    Polygon,
}

impl VertexKind {
    fn min_vertices(self) -> usize {
        match self {
            Self::Line | Self::Polyline => 2,
            Self::Polygon => 3,
        }
    }
}

/// A drawable entity as stored in the session and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    pub id: ShapeId,
    #[serde(flatten)]
    pub kind: ShapeKind,
    /// Left edge of the bounding box.
    pub x: f64,
    /// Top edge of the bounding box.
    pub y: f64,
    pub w: f64,
    pub h: f64,
    /// Clockwise rotation in degrees around the bounding-box center, in `[0, 360)`.
    pub rotation: f64,
    pub color: String,
    /// Weak reference. A layer that no longer exists reads as "no layer".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<LayerId>,
    #[serde(default)]
    pub source: Source,
    /// Annotation confidence in `[0, 1]`, set for AI-sourced shapes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub created_by: UserId,
    /// Server-assigned write time, monotonic per backend. Zero until persisted.
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub updated_by: UserId,
    /// Client-stamped edit time; the last-writer-wins comparison key.
    #[serde(default)]
    pub client_updated_at: i64,
}

impl Shape {
    fn base(kind: ShapeKind, x: f64, y: f64, w: f64, h: f64) -> Self {
        Self {
            id: new_id(),
            kind,
            x,
            y,
            w,
            h,
            rotation: 0.0,
            color: DEFAULT_COLOR.to_string(),
            layer_id: None,
            source: Source::Manual,
            confidence: None,
            created_at: 0,
            created_by: UserId::new(),
            updated_at: 0,
            updated_by: UserId::new(),
            client_updated_at: 0,
        }
    }

    #[must_use]
    pub fn rectangle(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self::base(ShapeKind::Rectangle { stroke_width: None }, x, y, w.abs(), h.abs())
    }

    /// Circle centered on `(cx, cy)`; the bounding box is the enclosing square.
    #[must_use]
    pub fn circle(cx: f64, cy: f64, radius: f64) -> Self {
        let r = radius.abs();
        Self::base(ShapeKind::Circle { radius: r, stroke_width: None }, cx - r, cy - r, 2.0 * r, 2.0 * r)
    }

    #[must_use]
    pub fn text(x: f64, y: f64, text: impl Into<String>, font_size: f64) -> Self {
        Self::base(ShapeKind::Text { text: text.into(), font_size }, x, y, 0.0, font_size)
    }

    /// Build a vertex shape from absolute canvas coordinates.
    ///
    /// Returns `None` when there are too few vertices for the kind.
    #[must_use]
    pub fn from_vertices(kind: VertexKind, vertices: &[Point]) -> Option<Self> {
        if vertices.len() < kind.min_vertices() {
            return None;
        }
        let (origin, w, h, points) = encode_relative(vertices);
        let kind = match kind {
            VertexKind::Line => ShapeKind::Line { points, stroke_width: None },
            VertexKind::Polyline => ShapeKind::Polyline { points, stroke_width: None },
            VertexKind::Polygon => ShapeKind::Polygon { points, stroke_width: None },
        };
        Some(Self::base(kind, origin.x, origin.y, w, h))
    }

    #[must_use]
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    #[must_use]
    pub fn with_layer(mut self, layer_id: impl Into<LayerId>) -> Self {
        self.layer_id = Some(layer_id.into());
        self
    }

    /// Mark as produced by an annotation pass. Confidence is clamped to `[0, 1]`.
    #[must_use]
    pub fn with_ai_provenance(mut self, confidence: f64) -> Self {
        self.source = Source::Ai;
        self.confidence = Some(if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 });
        self
    }

    /// Bounding-box-relative points, for vertex kinds.
    #[must_use]
    pub fn points(&self) -> Option<&[f64]> {
        match &self.kind {
            ShapeKind::Line { points, .. } | ShapeKind::Polyline { points, .. } | ShapeKind::Polygon { points, .. } => {
                Some(points)
            }
            _ => None,
        }
    }

    fn points_mut(&mut self) -> Option<&mut Vec<f64>> {
        match &mut self.kind {
            ShapeKind::Line { points, .. } | ShapeKind::Polyline { points, .. } | ShapeKind::Polygon { points, .. } => {
                Some(points)
            }
            _ => None,
        }
    }

    /// Absolute vertices: decoded points for vertex kinds, corners for rectangles.
    #[must_use]
    pub fn absolute_vertices(&self) -> Vec<Point> {
        match &self.kind {
            ShapeKind::Rectangle { .. } => vec![
                Point::new(self.x, self.y),
                Point::new(self.x + self.w, self.y),
                Point::new(self.x + self.w, self.y + self.h),
                Point::new(self.x, self.y + self.h),
            ],
            ShapeKind::Line { points, .. } | ShapeKind::Polyline { points, .. } | ShapeKind::Polygon { points, .. } => {
                points_from_flat(points)
                    .into_iter()
                    .map(|p| Point::new(self.x + p.x, self.y + p.y))
                    .collect()
            }
            ShapeKind::Circle { .. } | ShapeKind::Text { .. } => Vec::new(),
        }
    }

    /// Replace the vertices of a vertex shape, re-deriving the bounding box.
    /// Returns false for other kinds or too few vertices.
    pub fn set_vertices(&mut self, vertices: &[Point]) -> bool {
        let min = match self.kind {
            ShapeKind::Line { .. } | ShapeKind::Polyline { .. } => 2,
            ShapeKind::Polygon { .. } => 3,
            _ => return false,
        };
        if vertices.len() < min {
            return false;
        }
        let (origin, w, h, encoded) = encode_relative(vertices);
        if let Some(points) = self.points_mut() {
            *points = encoded;
        }
        self.x = origin.x;
        self.y = origin.y;
        self.w = w;
        self.h = h;
        true
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        self.x += dx;
        self.y += dy;
    }

    /// Add `degrees` to the rotation, normalized into `[0, 360)`.
    pub fn rotate(&mut self, degrees: f64) {
        self.rotation = (self.rotation + degrees).rem_euclid(360.0);
    }

    /// Resize the bounding box, scaling relative points (or the radius) with it.
    pub fn resize(&mut self, w: f64, h: f64) {
        let (w, h) = (w.abs(), h.abs());
        let sx = if self.w > 0.0 { w / self.w } else { 1.0 };
        let sy = if self.h > 0.0 { h / self.h } else { 1.0 };
        match &mut self.kind {
            ShapeKind::Circle { radius, .. } => {
                let r = w.min(h) / 2.0;
                *radius = r;
                self.w = 2.0 * r;
                self.h = 2.0 * r;
                return;
            }
            ShapeKind::Line { points, .. } | ShapeKind::Polyline { points, .. } | ShapeKind::Polygon { points, .. } => {
                for pair in points.chunks_exact_mut(2) {
                    pair[0] *= sx;
                    pair[1] *= sy;
                }
            }
            ShapeKind::Rectangle { .. } | ShapeKind::Text { .. } => {}
        }
        self.w = w;
        self.h = h;
    }

    /// Replace the text of a text shape. Returns false for other kinds.
    pub fn set_text(&mut self, value: impl Into<String>) -> bool {
        match &mut self.kind {
            ShapeKind::Text { text, .. } => {
                *text = value.into();
                true
            }
            _ => false,
        }
    }

    /// Set the stroke width of stroked kinds. Returns false for text.
    pub fn set_stroke_width(&mut self, width: f64) -> bool {
        match &mut self.kind {
            ShapeKind::Rectangle { stroke_width }
            | ShapeKind::Circle { stroke_width, .. }
            | ShapeKind::Line { stroke_width, .. }
            | ShapeKind::Polyline { stroke_width, .. }
            | ShapeKind::Polygon { stroke_width, .. } => {
                *stroke_width = Some(width.max(0.0));
                true
            }
            ShapeKind::Text { .. } => false,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ShapeKind::Rectangle { .. } | ShapeKind::Circle { .. } | ShapeKind::Polygon { .. })
    }

    /// Pixel `(length, area)`: arc length for open kinds, perimeter and area
    /// for closed kinds, zero for text.
    #[must_use]
    pub fn pixel_metrics(&self) -> (f64, f64) {
        match &self.kind {
            ShapeKind::Rectangle { .. } => (2.0 * (self.w + self.h), self.w * self.h),
            ShapeKind::Circle { radius, .. } => (2.0 * PI * radius, PI * radius * radius),
            ShapeKind::Line { .. } | ShapeKind::Polyline { .. } => (pixel_length(&self.absolute_vertices()), 0.0),
            ShapeKind::Polygon { .. } => {
                let vertices = self.absolute_vertices();
                (pixel_perimeter(&vertices), pixel_area(&vertices))
            }
            ShapeKind::Text { .. } => (0.0, 0.0),
        }
    }

    /// Kind name as stored in the `type` field.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ShapeKind::Rectangle { .. } => "rectangle",
            ShapeKind::Circle { .. } => "circle",
            ShapeKind::Text { .. } => "text",
            ShapeKind::Line { .. } => "line",
            ShapeKind::Polyline { .. } => "polyline",
            ShapeKind::Polygon { .. } => "polygon",
        }
    }
}

/// Grouping construct. Shapes refer to layers by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub visible: bool,
    /// Default color for member shapes that do not set their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Layer {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { id: new_id(), name: name.into(), visible: true, color: None }
    }

    #[must_use]
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// Encode absolute vertices relative to their bounding box's minimum corner.
/// Returns `(origin, width, height, flat_points)`.
fn encode_relative(vertices: &[Point]) -> (Point, f64, f64, Vec<f64>) {
    let min_x = vertices.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let min_y = vertices.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_x = vertices.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let max_y = vertices.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
    let points = vertices.iter().flat_map(|p| [p.x - min_x, p.y - min_y]).collect();
    (Point::new(min_x, min_y), max_x - min_x, max_y - min_y, points)
}
