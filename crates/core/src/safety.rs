//! Route Safety Gate (C2). Five fixed stages applied before any RoutePoint
//! write: sanitize, validate, simplify (Douglas-Peucker with anchored
//! points), resample, spike detection. Errors are terminal — the gate
//! either returns a clean polyline or rejects the whole route (spec §4.2).

use crate::error::AppError;
use crate::geo::{distance, resample, turn_angle, LatLng};

#[derive(Debug, Clone)]
pub struct GatePoint {
    pub pos: LatLng,
    pub dwell_seconds: u32,
    pub label: Option<String>,
}

impl GatePoint {
    pub fn plain(pos: LatLng) -> Self {
        Self {
            pos,
            dwell_seconds: 0,
            label: None,
        }
    }

    fn is_anchor(&self) -> bool {
        self.dwell_seconds > 0 || self.label.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SafetyGateConfig {
    pub max_segment_meters: f64,
    pub min_total_meters: f64,
    pub tolerance_meters: f64,
    pub step_meters: f64,
    pub spike_straight_meters: f64,
    pub spike_turn_degrees: f64,
    pub spike_cluster_window_meters: f64,
}

impl Default for SafetyGateConfig {
    fn default() -> Self {
        Self {
            max_segment_meters: 200.0,
            min_total_meters: 50.0,
            tolerance_meters: 5.0, // `toleranceMeters` default; distinct from resample step below
            step_meters: 5.0,
            spike_straight_meters: 5.0,
            spike_turn_degrees: 160.0,
            spike_cluster_window_meters: 30.0,
        }
    }
}

/// Run all five stages in order, returning the clean polyline (with
/// dwell/label metadata preserved on surviving anchors) or the terminal
/// rejection.
pub fn run_safety_gate(
    points: &[GatePoint],
    cfg: &SafetyGateConfig,
) -> Result<Vec<GatePoint>, AppError> {
    let sanitized = sanitize(points);
    validate(&sanitized, cfg)?;
    let simplified = simplify(&sanitized, cfg.tolerance_meters);
    let resampled = resample_gate(&simplified, cfg.step_meters)?;
    detect_spikes(&resampled, cfg)?;
    Ok(resampled)
}

/// Stage 1 — drop non-finite/out-of-range points, merge exact duplicates and
/// sub-0.5m successors into the previous kept point, accumulating dwell and
/// preserving label.
fn sanitize(points: &[GatePoint]) -> Vec<GatePoint> {
    let mut out: Vec<GatePoint> = Vec::with_capacity(points.len());
    for p in points {
        if !p.pos.is_finite() || !p.pos.in_range() {
            continue;
        }
        if let Some(prev) = out.last_mut() {
            if distance(prev.pos, p.pos) < 0.5 {
                prev.dwell_seconds += p.dwell_seconds;
                if prev.label.is_none() {
                    prev.label = p.label.clone();
                }
                continue;
            }
        }
        out.push(p.clone());
    }
    out
}

/// Stage 2 — geometry validation.
fn validate(points: &[GatePoint], cfg: &SafetyGateConfig) -> Result<(), AppError> {
    if points.len() < 2 {
        return Err(AppError::InvalidRouteGeometry(
            "fewer than 2 points survive sanitize".into(),
        ));
    }
    let mut total = 0.0;
    for w in points.windows(2) {
        let d = distance(w[0].pos, w[1].pos);
        if d > cfg.max_segment_meters {
            return Err(AppError::InvalidRouteGeometry(format!(
                "segment of {d:.1}m exceeds max of {:.1}m",
                cfg.max_segment_meters
            )));
        }
        total += d;
    }
    if total < cfg.min_total_meters {
        return Err(AppError::InvalidRouteGeometry(format!(
            "total length {total:.1}m below minimum {:.1}m",
            cfg.min_total_meters
        )));
    }
    Ok(())
}

/// Stage 3 — Douglas-Peucker simplification, recursive, with anchor
/// protection: any point with dwell or label has effective perpendicular
/// distance infinite and is never dropped.
fn simplify(points: &[GatePoint], tolerance_meters: f64) -> Vec<GatePoint> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;
    dp_recurse(points, 0, points.len() - 1, tolerance_meters, &mut keep);

    points
        .iter()
        .zip(keep.iter())
        .filter(|(_, k)| **k)
        .map(|(p, _)| p.clone())
        .collect()
}

fn dp_recurse(
    points: &[GatePoint],
    start: usize,
    end: usize,
    tolerance_meters: f64,
    keep: &mut [bool],
) {
    if end <= start + 1 {
        return;
    }
    let mut max_dist = -1.0_f64;
    let mut max_idx = start;
    for i in (start + 1)..end {
        let d = if points[i].is_anchor() {
            f64::INFINITY
        } else {
            perpendicular_distance(points[i].pos, points[start].pos, points[end].pos)
        };
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }
    if max_dist > tolerance_meters {
        keep[max_idx] = true;
        dp_recurse(points, start, max_idx, tolerance_meters, keep);
        dp_recurse(points, max_idx, end, tolerance_meters, keep);
    }
}

/// Approximate perpendicular distance from `p` to the segment `(a,b)` in
/// meters, using an equirectangular projection valid at these short
/// distances (consistent with the linear-interpolation approximation used
/// elsewhere in the geospatial kernel).
fn perpendicular_distance(p: LatLng, a: LatLng, b: LatLng) -> f64 {
    let lat_to_m = 111_320.0;
    let lng_to_m = 111_320.0 * a.lat.to_radians().cos();

    let (ax, ay) = (a.lng * lng_to_m, a.lat * lat_to_m);
    let (bx, by) = (b.lng * lng_to_m, b.lat * lat_to_m);
    let (px, py) = (p.lng * lng_to_m, p.lat * lat_to_m);

    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    if len_sq < 1e-9 {
        return ((px - ax).powi(2) + (py - ay).powi(2)).sqrt();
    }
    let t = ((px - ax) * dx + (py - ay) * dy) / len_sq;
    let t = t.clamp(0.0, 1.0);
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Stage 4 — resample to uniform spacing. Interpolated points carry no
/// label or dwell; original anchors (label/dwell) are preserved verbatim
/// wherever they land close to a sample.
fn resample_gate(points: &[GatePoint], step_meters: f64) -> Result<Vec<GatePoint>, AppError> {
    let plain: Vec<LatLng> = points.iter().map(|p| p.pos).collect();
    let resampled = resample(&plain, step_meters)?;

    // Re-attach anchor metadata: an emitted sample that coincides with (or
    // is within half a step of) a surviving anchor keeps that anchor's
    // dwell/label; everything else is a bare interpolated point.
    let half_step = step_meters / 2.0;
    let out = resampled
        .into_iter()
        .map(|pos| {
            if let Some(anchor) = points
                .iter()
                .find(|p| p.is_anchor() && distance(p.pos, pos) <= half_step)
            {
                GatePoint {
                    pos,
                    dwell_seconds: anchor.dwell_seconds,
                    label: anchor.label.clone(),
                }
            } else {
                GatePoint::plain(pos)
            }
        })
        .collect();
    Ok(out)
}

/// Stage 5 — spike detection. A point is a spike when both neighboring
/// segments are short and the turn angle is sharp; three spikes within a
/// 30m window is a terminal rejection.
fn detect_spikes(points: &[GatePoint], cfg: &SafetyGateConfig) -> Result<(), AppError> {
    if points.len() < 3 {
        return Ok(());
    }
    let mut spike_positions = Vec::new();
    let mut cumulative = vec![0.0_f64; points.len()];
    for i in 1..points.len() {
        cumulative[i] = cumulative[i - 1] + distance(points[i - 1].pos, points[i].pos);
    }

    for i in 1..points.len() - 1 {
        let prev_seg = distance(points[i - 1].pos, points[i].pos);
        let next_seg = distance(points[i].pos, points[i + 1].pos);
        if prev_seg < cfg.spike_straight_meters && next_seg < cfg.spike_straight_meters {
            let b1 = crate::geo::bearing(points[i - 1].pos, points[i].pos);
            let b2 = crate::geo::bearing(points[i].pos, points[i + 1].pos);
            if turn_angle(b1, b2) > cfg.spike_turn_degrees {
                spike_positions.push(cumulative[i]);
            }
        }
    }

    for w in spike_positions.windows(3) {
        if w[2] - w[0] <= cfg.spike_cluster_window_meters {
            return Err(AppError::InvalidRouteSpikes(format!(
                "3 spikes within {:.0}m window",
                cfg.spike_cluster_window_meters
            )));
        }
    }
    Ok(())
}

/// Convenience used by `interpolate`-adjacent callers that only need a
/// midpoint, e.g. waypoint-to-point snapping in the control plane.
pub fn nearest_point_index(points: &[LatLng], target: LatLng) -> usize {
    points
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            distance(**a, target)
                .partial_cmp(&distance(**b, target))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(lat: f64, lng: f64) -> GatePoint {
        GatePoint::plain(LatLng::new(lat, lng))
    }

    #[test]
    fn rejects_large_detour_segment() {
        // Two points 20m apart via a single ~1000m detour vertex (spec §8
        // testable property 8 / scenario S6 shape).
        let points = vec![
            pt(0.0, 0.0),
            pt(0.009, 0.0), // ~1000m north
            pt(0.00018, 0.0),
        ];
        let cfg = SafetyGateConfig::default();
        let err = run_safety_gate(&points, &cfg).unwrap_err();
        assert!(matches!(err, AppError::InvalidRouteGeometry(_)));
    }

    #[test]
    fn accepts_straight_line_within_defaults() {
        let points = vec![pt(0.0, 0.0), pt(0.0, 0.001)];
        let cfg = SafetyGateConfig::default();
        let out = run_safety_gate(&points, &cfg).unwrap();
        assert!(out.len() >= 2);
        assert!((out.first().unwrap().pos.lat - 0.0).abs() < 1e-9);
    }

    #[test]
    fn sanitize_merges_near_duplicates_and_accumulates_dwell() {
        let points = vec![
            GatePoint {
                pos: LatLng::new(0.0, 0.0),
                dwell_seconds: 2,
                label: None,
            },
            GatePoint {
                pos: LatLng::new(0.0, 0.0000001),
                dwell_seconds: 3,
                label: Some("stop".into()),
            },
        ];
        let out = sanitize(&points);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dwell_seconds, 5);
        assert_eq!(out[0].label.as_deref(), Some("stop"));
    }

    #[test]
    fn simplify_preserves_anchors() {
        let mut points = vec![pt(0.0, 0.0)];
        for i in 1..20 {
            points.push(pt(0.0, i as f64 * 0.00001));
        }
        points[10].dwell_seconds = 5; // force anchor mid-line
        let simplified = simplify(&points, 1000.0); // huge tolerance would drop everything but anchors/ends
        assert!(simplified.iter().any(|p| p.dwell_seconds == 5));
    }
}
