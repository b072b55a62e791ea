//! Geospatial kernel (C1): haversine distance, bearing, interpolation and
//! uniform-distance resampling. Pure functions, no state — the primitives
//! every other component in this crate is built on.

use crate::error::AppError;
use serde::{Deserialize, Serialize};

/// Mean earth radius in meters, per spec §4.1.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    pub fn in_range(&self) -> bool {
        self.lat.abs() <= 90.0 && self.lng.abs() <= 180.0
    }
}

fn to_radians(deg: f64) -> f64 {
    deg * std::f64::consts::PI / 180.0
}

fn to_degrees(rad: f64) -> f64 {
    rad * 180.0 / std::f64::consts::PI
}

/// Great-circle distance between two points, in meters.
pub fn distance(a: LatLng, b: LatLng) -> f64 {
    let (lat1, lat2) = (to_radians(a.lat), to_radians(b.lat));
    let dlat = lat2 - lat1;
    let dlng = to_radians(b.lng - a.lng);

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlng = (dlng / 2.0).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlng * sin_dlng;
    let c = 2.0 * h.sqrt().clamp(-1.0, 1.0).asin();
    EARTH_RADIUS_M * c
}

/// Initial bearing from `a` to `b`, degrees normalized to `[0, 360)`.
pub fn bearing(a: LatLng, b: LatLng) -> f64 {
    let (lat1, lat2) = (to_radians(a.lat), to_radians(b.lat));
    let dlng = to_radians(b.lng - a.lng);

    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();
    let theta = y.atan2(x);
    (to_degrees(theta) + 360.0) % 360.0
}

/// Fold an angle difference into `[-180, 180]`.
pub fn fold_angle(deg: f64) -> f64 {
    let mut d = deg % 360.0;
    if d > 180.0 {
        d -= 360.0;
    } else if d < -180.0 {
        d += 360.0;
    }
    d
}

/// Absolute turn angle between two bearings, folded to `[0, 180]`.
pub fn turn_angle(bearing_a: f64, bearing_b: f64) -> f64 {
    fold_angle(bearing_b - bearing_a).abs()
}

/// Linear interpolation between `a` and `b` at fraction `f` (acceptable
/// approximation over sub-kilometer segments per spec §4.1).
pub fn interpolate(a: LatLng, b: LatLng, f: f64) -> LatLng {
    LatLng::new(a.lat + (b.lat - a.lat) * f, a.lng + (b.lng - a.lng) * f)
}

/// Total length of a polyline, in meters.
pub fn polyline_length(points: &[LatLng]) -> f64 {
    points.windows(2).map(|w| distance(w[0], w[1])).sum()
}

/// Resample a polyline so consecutive points are approximately `step_meters`
/// apart, always preserving the first and last input points.
///
/// Carries the residual distance from the previous segment forward so the
/// total length is preserved within numerical tolerance (spec §4.1
/// correctness note).
pub fn resample(points: &[LatLng], step_meters: f64) -> Result<Vec<LatLng>, AppError> {
    if points.len() < 2 {
        return Ok(points.to_vec());
    }
    if step_meters <= 0.0 {
        return Err(AppError::BadArgument(
            "resample stepMeters must be > 0".into(),
        ));
    }

    let mut out = vec![points[0]];
    let mut traveled = 0.0_f64;
    let mut next_sample_at = step_meters;

    for w in points.windows(2) {
        let (seg_start, seg_end) = (w[0], w[1]);
        let seg_len = distance(seg_start, seg_end);
        if seg_len <= 0.0 {
            continue;
        }
        let seg_end_dist = traveled + seg_len;

        while next_sample_at <= seg_end_dist {
            let f = (next_sample_at - traveled) / seg_len;
            out.push(interpolate(seg_start, seg_end, f));
            next_sample_at += step_meters;
        }
        traveled = seg_end_dist;
    }

    let last = *points.last().unwrap();
    if out.last() != Some(&last) {
        out.push(last);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_zero_for_identical_points() {
        let p = LatLng::new(41.0, 29.0);
        assert!(distance(p, p) < 1e-9);
    }

    #[test]
    fn distance_one_degree_longitude_near_equator() {
        let a = LatLng::new(0.0, 0.0);
        let b = LatLng::new(0.0, 0.001);
        let d = distance(a, b);
        assert!((d - 111.3).abs() < 1.0, "got {d}");
    }

    #[test]
    fn bearing_due_east_is_90() {
        let a = LatLng::new(0.0, 0.0);
        let b = LatLng::new(0.0, 1.0);
        let b_deg = bearing(a, b);
        assert!((b_deg - 90.0).abs() < 0.5, "got {b_deg}");
    }

    #[test]
    fn resample_preserves_endpoints_and_spacing() {
        let points = vec![LatLng::new(0.0, 0.0), LatLng::new(0.0, 0.01)];
        let step = 50.0;
        let out = resample(&points, step).unwrap();
        assert_eq!(out.first(), points.first());
        assert_eq!(out.last(), points.last());
        for w in out.windows(2).take(out.len().saturating_sub(2)) {
            let d = distance(w[0], w[1]);
            assert!(d >= step * 0.5 && d <= step * 1.5, "got {d}");
        }
    }

    #[test]
    fn resample_rejects_nonpositive_step() {
        let points = vec![LatLng::new(0.0, 0.0), LatLng::new(1.0, 1.0)];
        assert!(matches!(
            resample(&points, 0.0),
            Err(AppError::BadArgument(_))
        ));
    }

    #[test]
    fn resample_passthrough_under_two_points() {
        let points = vec![LatLng::new(1.0, 1.0)];
        let out = resample(&points, 10.0).unwrap();
        assert_eq!(out, points);
    }

    #[test]
    fn fold_angle_wraps() {
        assert!((fold_angle(190.0) - (-170.0)).abs() < 1e-9);
        assert!((fold_angle(-190.0) - 170.0).abs() < 1e-9);
    }
}
