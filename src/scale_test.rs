#![allow(clippy::float_cmp)]

use super::*;

fn feet_line(length: f64) -> ScaleLine {
    ScaleLine::new(Point::new(0.0, 0.0), Point::new(100.0, 0.0), length, Unit::Feet)
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// =============================================================
// Length and area
// =============================================================

#[test]
fn pixel_length_sums_segments() {
    let pts = [Point::new(0.0, 0.0), Point::new(3.0, 4.0), Point::new(3.0, 10.0)];
    assert!(approx(pixel_length(&pts), 11.0));
}

#[test]
fn pixel_length_of_single_point_is_zero() {
    assert_eq!(pixel_length(&[Point::new(5.0, 5.0)]), 0.0);
    assert_eq!(pixel_length(&[]), 0.0);
}

#[test]
fn l_shape_area_is_7500() {
    let pts = [
        Point::new(0.0, 0.0),
        Point::new(100.0, 0.0),
        Point::new(100.0, 50.0),
        Point::new(50.0, 50.0),
        Point::new(50.0, 100.0),
        Point::new(0.0, 100.0),
    ];
    assert!(approx(pixel_area(&pts), 7500.0));
}

#[test]
fn area_ignores_winding_direction() {
    let cw = [Point::new(0.0, 0.0), Point::new(0.0, 10.0), Point::new(10.0, 10.0), Point::new(10.0, 0.0)];
    let mut ccw = cw;
    ccw.reverse();
    assert!(approx(pixel_area(&cw), 100.0));
    assert!(approx(pixel_area(&ccw), 100.0));
}

#[test]
fn degenerate_polygon_has_no_area() {
    assert_eq!(pixel_area(&[Point::new(0.0, 0.0), Point::new(10.0, 0.0)]), 0.0);
}

#[test]
fn perimeter_closes_the_ring() {
    let square = [Point::new(0.0, 0.0), Point::new(10.0, 0.0), Point::new(10.0, 10.0), Point::new(0.0, 10.0)];
    assert!(approx(pixel_perimeter(&square), 40.0));
}

#[test]
fn points_from_flat_pairs_values() {
    let pts = points_from_flat(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(pts, vec![Point::new(1.0, 2.0), Point::new(3.0, 4.0)]);
}

// =============================================================
// Real-world conversion
// =============================================================

#[test]
fn hundred_pixels_is_ten_feet() {
    let line = feet_line(10.0);
    let feet = to_real_world(100.0, Some(&line)).unwrap();
    assert!(approx(feet, 10.0));
}

#[test]
fn area_uses_squared_factor() {
    let line = feet_line(10.0);
    let area = to_real_world_area(10_000.0, Some(&line)).unwrap();
    assert!(approx(area, 100.0));
}

#[test]
fn no_scale_line_is_unmeasurable() {
    for x in [0.0, 1.0, 123.4, -5.0] {
        assert_eq!(to_real_world(x, None), None);
        assert_eq!(to_real_world_area(x, None), None);
    }
}

#[test]
fn non_positive_length_is_unmeasurable() {
    assert_eq!(to_real_world(100.0, Some(&feet_line(0.0))), None);
    assert_eq!(to_real_world(100.0, Some(&feet_line(-3.0))), None);
    assert_eq!(to_real_world(100.0, Some(&feet_line(f64::NAN))), None);
}

#[test]
fn zero_pixel_segment_is_unmeasurable() {
    let line = ScaleLine::new(Point::new(4.0, 4.0), Point::new(4.0, 4.0), 10.0, Unit::Meters);
    assert_eq!(line.units_per_pixel(), None);
    assert_eq!(to_real_world(50.0, Some(&line)), None);
}

// =============================================================
// Units
// =============================================================

#[test]
fn unit_conversion_feet_to_inches() {
    assert!(approx(Unit::Feet.convert(2.0, Unit::Inches), 24.0));
    assert!(approx(Unit::Meters.convert(1.0, Unit::Meters), 1.0));
}

#[test]
fn unit_area_conversion_squares_ratio() {
    assert!(approx(Unit::Feet.convert_area(1.0, Unit::Inches), 144.0));
}

#[test]
fn unit_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&Unit::Inches).unwrap(), "\"inches\"");
    assert_eq!(Unit::Meters.abbreviation(), "m");
}

// =============================================================
// Measurement
// =============================================================

#[test]
fn measurement_without_scale_keeps_pixels() {
    let m = Measurement::from_pixels(40.0, 100.0, None);
    assert_eq!(m.pixel_length, 40.0);
    assert_eq!(m.pixel_area, 100.0);
    assert!(!m.is_measurable());
    assert_eq!(m.unit, None);
}

#[test]
fn measurement_combine_sums_when_measurable() {
    let line = feet_line(10.0);
    let a = Measurement::from_pixels(100.0, 0.0, Some(&line));
    let b = Measurement::from_pixels(50.0, 10_000.0, Some(&line));
    let total = a.combine(b);
    assert!(approx(total.real_length.unwrap(), 15.0));
    assert!(approx(total.real_area.unwrap(), 100.0));
    assert_eq!(total.unit, Some(Unit::Feet));
}

#[test]
fn scale_line_serializes_camel_case() {
    let json = serde_json::to_value(feet_line(10.0)).unwrap();
    assert_eq!(json["realWorldLength"], 10.0);
    assert_eq!(json["unit"], "feet");
    assert!(json.get("startX").is_some());
}
