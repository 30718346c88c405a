//! Scale calibration and pixel → real-world measurement.
//!
//! A `ScaleLine` maps a pixel-space segment to a known real-world length.
//! Everything here is pure. A missing or degenerate calibration is a
//! first-class "unmeasurable" state, reported as `None` rather than zero or
//! an error, so callers can display it.

use serde::{Deserialize, Serialize};

use crate::shape::UserId;

/// A point in canvas pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance_to(&self, other: &Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Real-world length unit of a calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Feet,
    Inches,
    Meters,
}

impl Unit {
    /// Short display suffix (`"ft"`, `"in"`, `"m"`).
    #[must_use]
    pub fn abbreviation(self) -> &'static str {
        match self {
            Self::Feet => "ft",
            Self::Inches => "in",
            Self::Meters => "m",
        }
    }

    fn meters_per_unit(self) -> f64 {
        match self {
            Self::Feet => 0.3048,
            Self::Inches => 0.0254,
            Self::Meters => 1.0,
        }
    }

    /// Convert a length expressed in `self` into `to`.
    #[must_use]
    pub fn convert(self, value: f64, to: Unit) -> f64 {
        value * self.meters_per_unit() / to.meters_per_unit()
    }

    /// Convert an area expressed in square `self` into square `to`.
    #[must_use]
    pub fn convert_area(self, value: f64, to: Unit) -> f64 {
        let ratio = self.meters_per_unit() / to.meters_per_unit();
        value * ratio * ratio
    }
}

/// Calibration record. At most one is active per canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleLine {
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
    /// Known length of the segment in `unit`. Must be positive to calibrate.
    pub real_world_length: f64,
    pub unit: Unit,
    pub visible: bool,
    pub created_by: UserId,
    pub created_at: i64,
    pub updated_by: UserId,
    pub updated_at: i64,
}

impl ScaleLine {
    /// New visible calibration line with empty audit fields. The store fills
    /// the audit fields when the line is set.
    #[must_use]
    pub fn new(start: Point, end: Point, real_world_length: f64, unit: Unit) -> Self {
        Self {
            start_x: start.x,
            start_y: start.y,
            end_x: end.x,
            end_y: end.y,
            real_world_length,
            unit,
            visible: true,
            created_by: UserId::new(),
            created_at: 0,
            updated_by: UserId::new(),
            updated_at: 0,
        }
    }

    #[must_use]
    pub fn start(&self) -> Point {
        Point::new(self.start_x, self.start_y)
    }

    #[must_use]
    pub fn end(&self) -> Point {
        Point::new(self.end_x, self.end_y)
    }

    /// Length of the calibration segment in pixels.
    #[must_use]
    pub fn pixel_distance(&self) -> f64 {
        self.start().distance_to(&self.end())
    }

    /// Real-world units per pixel, or `None` when the line cannot calibrate
    /// (non-positive length or a zero-length segment).
    #[must_use]
    pub fn units_per_pixel(&self) -> Option<f64> {
        if !self.real_world_length.is_finite() || self.real_world_length <= 0.0 {
            return None;
        }
        let pixels = self.pixel_distance();
        if !pixels.is_finite() || pixels <= 0.0 {
            return None;
        }
        Some(self.real_world_length / pixels)
    }
}

// =============================================================================
// PURE CONVERSIONS
// =============================================================================

/// Arc length of an open polyline: the sum of its segment lengths.
#[must_use]
pub fn pixel_length(points: &[Point]) -> f64 {
    points.windows(2).map(|w| w[0].distance_to(&w[1])).sum()
}

/// Perimeter of a closed ring, including the closing segment.
#[must_use]
pub fn pixel_perimeter(points: &[Point]) -> f64 {
    match (points.first(), points.last()) {
        (Some(first), Some(last)) if points.len() > 2 => pixel_length(points) + last.distance_to(first),
        _ => pixel_length(points),
    }
}

/// Polygon area by the shoelace formula over the ordered vertex list.
///
/// The caller supplies a simple (non-self-intersecting) polygon; winding
/// direction does not matter. Fewer than three vertices have no area.
#[must_use]
pub fn pixel_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice_area: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();
    twice_area.abs() / 2.0
}

/// Convert a pixel length to real-world units. `None` when unmeasurable.
#[must_use]
pub fn to_real_world(pixel_value: f64, scale_line: Option<&ScaleLine>) -> Option<f64> {
    let factor = scale_line?.units_per_pixel()?;
    Some(pixel_value * factor)
}

/// Convert a pixel area to square real-world units. `None` when unmeasurable.
#[must_use]
pub fn to_real_world_area(pixel_value: f64, scale_line: Option<&ScaleLine>) -> Option<f64> {
    let factor = scale_line?.units_per_pixel()?;
    Some(pixel_value * factor * factor)
}

/// Pair up a flat `[x0, y0, x1, y1, ...]` sequence. A trailing odd value is ignored.
#[must_use]
pub fn points_from_flat(flat: &[f64]) -> Vec<Point> {
    flat.chunks_exact(2).map(|c| Point::new(c[0], c[1])).collect()
}

// =============================================================================
// MEASUREMENT
// =============================================================================

/// Derived measurement for one shape or a group of shapes.
///
/// `pixel_length` is arc length for open shapes and perimeter for closed ones.
/// Real-world values are `None` whenever no usable calibration exists.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    pub pixel_length: f64,
    pub pixel_area: f64,
    pub real_length: Option<f64>,
    pub real_area: Option<f64>,
    pub unit: Option<Unit>,
}

impl Measurement {
    #[must_use]
    pub fn from_pixels(pixel_length: f64, pixel_area: f64, scale_line: Option<&ScaleLine>) -> Self {
        let real_length = to_real_world(pixel_length, scale_line);
        let real_area = to_real_world_area(pixel_area, scale_line);
        let unit = real_length.and(scale_line.map(|l| l.unit));
        Self { pixel_length, pixel_area, real_length, real_area, unit }
    }

    #[must_use]
    pub fn is_measurable(&self) -> bool {
        self.real_length.is_some()
    }

    /// Sum two measurements taken against the same calibration.
    #[must_use]
    pub fn combine(self, other: Measurement) -> Measurement {
        Measurement {
            pixel_length: self.pixel_length + other.pixel_length,
            pixel_area: self.pixel_area + other.pixel_area,
            real_length: self.real_length.zip(other.real_length).map(|(a, b)| a + b),
            real_area: self.real_area.zip(other.real_area).map(|(a, b)| a + b),
            unit: self.unit.or(other.unit),
        }
    }
}

#[cfg(test)]
#[path = "scale_test.rs"]
mod tests;
