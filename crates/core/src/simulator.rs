//! Kinematic Simulator (C8): two engines selected by configuration, both
//! emitting `{lat, lng, speed, bearing, accuracy, state}` frames where
//! `state ∈ {MOVE, WAIT, PAUSED}` and `speed` is always m/s on the wire
//! (spec §9 open question, resolved: m/s for both engines).

use crate::geo::{bearing, distance, fold_angle, interpolate, LatLng};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_JUMP_METERS: f64 = 100.0;
const LOOK_AHEAD_METERS: f64 = 15.0;
const ACCEL_MPS2: f64 = 1.5;
const DECEL_MPS2: f64 = 2.5;
const HEADING_LOWPASS: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SimState {
    Move,
    Wait,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Index,
    Distance,
}

/// Whether the owning stream is currently running or paused; the engines
/// only need this binary signal (spec §4.6 step 10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy)]
pub struct SimPoint {
    pub pos: LatLng,
    pub dwell_seconds: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    pub engine_mode: EngineMode,
    pub dt_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s_meters: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v_mps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seg_index: Option<usize>,
    pub point_index: usize,
    pub total_points: usize,
    pub route_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dwell_remaining_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub lat: f64,
    pub lng: f64,
    /// Always meters per second on the wire.
    pub speed: f64,
    pub bearing: f64,
    pub accuracy: f64,
    pub state: SimState,
    pub meta: FrameMeta,
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub frame: Frame,
    pub terminated: bool,
    pub anti_teleport: bool,
}

fn effective_state(inner: SimState, status: RunStatus) -> SimState {
    if status == RunStatus::Paused {
        SimState::Paused
    } else {
        inner
    }
}

// ---------------------------------------------------------------------
// Index engine (legacy, step-per-point)
// ---------------------------------------------------------------------

pub struct IndexEngine {
    points: Vec<SimPoint>,
    route_id: Uuid,
    current_index: usize,
    accuracy: f64,
    r#loop: bool,
}

impl IndexEngine {
    pub fn new(points: Vec<SimPoint>, route_id: Uuid, accuracy: f64, r#loop: bool) -> Self {
        Self {
            points,
            route_id,
            current_index: 0,
            accuracy,
            r#loop,
        }
    }

    pub fn tick(&mut self, dt_ms: u64, status: RunStatus, waiting: bool) -> TickOutcome {
        let n = self.points.len();
        let idx = self.current_index.min(n - 1);
        let next_idx = (idx + 1) % n;
        let b = bearing(self.points[idx].pos, self.points[next_idx].pos);

        let inner_state = if waiting { SimState::Wait } else { SimState::Move };
        let moving = status == RunStatus::Running && !waiting;

        let frame = Frame {
            lat: self.points[idx].pos.lat,
            lng: self.points[idx].pos.lng,
            speed: if moving { 0.0 } else { 0.0 }, // index engine carries no velocity model; see distance engine
            bearing: b,
            accuracy: self.accuracy,
            state: effective_state(inner_state, status),
            meta: FrameMeta {
                engine_mode: EngineMode::Index,
                dt_ms,
                s_meters: None,
                v_mps: None,
                seg_index: None,
                point_index: idx,
                total_points: n,
                route_id: self.route_id,
                timestamp: Utc::now(),
                dwell_remaining_seconds: None,
            },
        };

        let mut terminated = false;
        if moving {
            if idx + 1 >= n {
                if self.r#loop {
                    self.current_index = 0;
                } else {
                    terminated = true;
                }
            } else {
                self.current_index += 1;
            }
        }

        TickOutcome {
            frame,
            terminated,
            anti_teleport: false,
        }
    }
}

// ---------------------------------------------------------------------
// Distance engine (default)
// ---------------------------------------------------------------------

pub struct DistanceEngineConfig {
    pub route_id: Uuid,
    pub accuracy: f64,
    pub target_speed_mps: f64,
    pub interval_ms: u64,
    pub r#loop: bool,
}

pub struct DistanceEngine {
    points: Vec<SimPoint>,
    cfg: DistanceEngineConfig,
    seg_index: usize,
    seg_progress: f64,
    v_mps: f64,
    v_target_mps: f64,
    heading_deg: f64,
    heading_initialized: bool,
    s_meters: f64,
    last_emitted: Option<LatLng>,
    state: SimState,
    dwell_ticks_remaining: u64,
    dwell_consumed_for: Option<usize>,
    keepalive_tick_counter: u64,
}

impl DistanceEngine {
    pub fn new(points: Vec<SimPoint>, cfg: DistanceEngineConfig) -> Self {
        let v_target_mps = cfg.target_speed_mps;
        Self {
            points,
            cfg,
            seg_index: 0,
            seg_progress: 0.0,
            v_mps: 0.0,
            v_target_mps,
            heading_deg: 0.0,
            heading_initialized: false,
            s_meters: 0.0,
            last_emitted: None,
            state: SimState::Move,
            dwell_ticks_remaining: 0,
            dwell_consumed_for: None,
            keepalive_tick_counter: 0,
        }
    }

    fn seg_len(&self, i: usize) -> f64 {
        distance(self.points[i].pos, self.points[i + 1].pos)
    }

    fn n(&self) -> usize {
        self.points.len()
    }

    /// Reset segment counters for a `loop` wraparound; `sMeters` resets to
    /// 0 at wrap (spec §4.5 scenario S3: "specify explicitly in the frame
    /// meta by resetting sMeters to 0 at wrap").
    fn wrap(&mut self) {
        self.seg_index = 0;
        self.seg_progress = 0.0;
        self.s_meters = 0.0;
        self.dwell_consumed_for = None;
    }

    /// Reset the kinematic wall-clock reference on resume (spec §4.5
    /// `resume`): re-snap the heading so a stale look-ahead isn't dragged
    /// across the pause boundary.
    pub fn reset_reference(&mut self) {
        self.heading_initialized = false;
    }

    pub fn position_at_lookahead(&self, ahead_meters: f64) -> LatLng {
        let mut remaining = self.seg_progress + ahead_meters;
        let mut i = self.seg_index;
        loop {
            if i + 1 >= self.n() {
                return self.points[self.n() - 1].pos;
            }
            let len = self.seg_len(i);
            if remaining <= len {
                return interpolate(self.points[i].pos, self.points[i + 1].pos, remaining / len.max(1e-9));
            }
            remaining -= len;
            i += 1;
        }
    }

    fn current_position(&self) -> LatLng {
        if self.seg_index + 1 >= self.n() {
            return self.points[self.n() - 1].pos;
        }
        let len = self.seg_len(self.seg_index).max(1e-9);
        interpolate(
            self.points[self.seg_index].pos,
            self.points[self.seg_index + 1].pos,
            (self.seg_progress / len).min(1.0),
        )
    }

    fn is_terminated(&self) -> bool {
        self.seg_index >= self.n() - 1
            || (self.seg_index == self.n() - 2
                && self.seg_progress >= self.seg_len(self.seg_index) - 0.5)
    }

    pub fn tick(&mut self, dt_ms: u64, status: RunStatus) -> TickOutcome {
        let dt = dt_ms as f64 / 1000.0;
        let point_idx = self.seg_index.min(self.n() - 1);

        // Step 2: dwell entry. Guarded by `dwell_consumed_for` so resuming
        // from WAIT at the same point (seg_progress still ~0) never
        // re-triggers the same dwell.
        if self.points[point_idx].dwell_seconds > 0
            && self.state == SimState::Move
            && self.dwell_ticks_remaining == 0
            && self.dwell_consumed_for != Some(point_idx)
            && self.seg_progress < 1e-6
        {
            self.v_target_mps = 0.0;
            self.state = SimState::Wait;
            self.dwell_consumed_for = Some(point_idx);
            self.dwell_ticks_remaining = ((self.points[point_idx].dwell_seconds as u64 * 1000)
                + self.cfg.interval_ms
                - 1)
                / self.cfg.interval_ms;
        }

        // Step 3: dwell countdown.
        if self.state == SimState::Wait && self.v_mps <= 0.1 {
            self.v_mps = 0.0;
            if status == RunStatus::Running {
                self.dwell_ticks_remaining = self.dwell_ticks_remaining.saturating_sub(1);
            }
            if self.dwell_ticks_remaining == 0 {
                self.v_target_mps = self.cfg.target_speed_mps;
                self.state = SimState::Move;
            }
        }

        // Step 4: velocity update.
        let target = if status == RunStatus::Running {
            self.v_target_mps
        } else {
            0.0
        };
        if self.v_mps < target {
            self.v_mps = (self.v_mps + ACCEL_MPS2 * dt).min(target);
        } else if self.v_mps > target {
            self.v_mps = (self.v_mps - DECEL_MPS2 * dt).max(target);
        }
        self.v_mps = self.v_mps.max(0.0);

        // Step 5: movement clamp.
        let max_meters_per_tick = (self.v_target_mps * dt * 2.5).clamp(15.0, 80.0);
        let meters_to_advance = (self.v_mps * dt).min(max_meters_per_tick);

        // Step 6: segment traversal.
        let mut remaining = meters_to_advance;
        while remaining > 0.0 && self.seg_index + 1 < self.n() {
            let len = self.seg_len(self.seg_index);
            let room = len - self.seg_progress;
            if remaining < room {
                self.seg_progress += remaining;
                self.s_meters += remaining;
                remaining = 0.0;
            } else {
                self.s_meters += room;
                remaining -= room;
                self.seg_index += 1;
                self.seg_progress = 0.0;
                if self.seg_index + 1 >= self.n() {
                    break;
                }
            }
        }

        // Step 7: position.
        let is_keepalive = self.v_mps == 0.0
            && (matches!(status, RunStatus::Paused) || self.state == SimState::Wait);
        let position = if is_keepalive {
            self.last_emitted
                .unwrap_or_else(|| self.points[self.seg_index].pos)
        } else {
            self.current_position()
        };

        // Step 8: heading.
        let lookahead_pos = self.position_at_lookahead(LOOK_AHEAD_METERS);
        let target_heading = bearing(position, lookahead_pos);
        if self.v_mps > 0.5 {
            if !self.heading_initialized {
                self.heading_deg = target_heading;
                self.heading_initialized = true;
            } else {
                self.heading_deg += fold_angle(target_heading - self.heading_deg) * HEADING_LOWPASS;
                self.heading_deg = (self.heading_deg + 360.0) % 360.0;
            }
        } else if !self.heading_initialized {
            self.heading_deg = target_heading;
            self.heading_initialized = true;
        }

        // Step 9: anti-teleport.
        let mut anti_teleport = false;
        if let Some(prev) = self.last_emitted {
            if distance(prev, position) > MAX_JUMP_METERS {
                anti_teleport = true;
            }
        }
        self.last_emitted = Some(position);

        // Step 10/11: effective state + meta.
        let effective = effective_state(self.state, status);
        self.keepalive_tick_counter = self.keepalive_tick_counter.wrapping_add(1);

        let dwell_remaining_seconds = if self.state == SimState::Wait {
            Some(((self.dwell_ticks_remaining * self.cfg.interval_ms) + 999) / 1000)
        } else {
            None
        };

        let frame = Frame {
            lat: position.lat,
            lng: position.lng,
            speed: self.v_mps,
            bearing: self.heading_deg,
            accuracy: self.cfg.accuracy,
            state: effective,
            meta: FrameMeta {
                engine_mode: EngineMode::Distance,
                dt_ms,
                s_meters: Some(self.s_meters),
                v_mps: Some(self.v_mps),
                seg_index: Some(self.seg_index),
                point_index: self.seg_index,
                total_points: self.n(),
                route_id: self.cfg.route_id,
                timestamp: Utc::now(),
                dwell_remaining_seconds,
            },
        };

        let mut terminated = false;
        if self.is_terminated() {
            if self.cfg.r#loop {
                self.wrap();
            } else {
                terminated = true;
            }
        }

        TickOutcome {
            frame,
            terminated,
            anti_teleport,
        }
    }

    /// Whether this tick should only emit a heartbeat audit, not a full
    /// structured log line (spec §4.6 "Keepalive throttling": every 10
    /// ticks in WAIT/PAUSED).
    pub fn should_log_keepalive(&self) -> bool {
        self.keepalive_tick_counter % 10 == 0
    }

    /// `skipDwell` control op: end the current dwell on the next tick.
    /// Returns `false` (no-op) if the stream isn't currently waiting.
    pub fn skip_dwell(&mut self) -> bool {
        if self.state == SimState::Wait {
            self.dwell_ticks_remaining = 0;
            true
        } else {
            false
        }
    }

    /// `extendDwell` control op: add `extra_seconds` to the remaining
    /// dwell, rounded up to whole ticks. Returns `false` if not waiting.
    pub fn extend_dwell(&mut self, extra_seconds: u64, interval_ms: u64) -> bool {
        if self.state == SimState::Wait {
            let extra_ticks = ((extra_seconds * 1000) + interval_ms - 1) / interval_ms;
            self.dwell_ticks_remaining += extra_ticks;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_line_points() -> Vec<SimPoint> {
        vec![
            SimPoint {
                pos: LatLng::new(0.0, 0.0),
                dwell_seconds: 0,
            },
            SimPoint {
                pos: LatLng::new(0.0, 0.001),
                dwell_seconds: 0,
            },
        ]
    }

    fn new_engine(points: Vec<SimPoint>, speed_kmh: f64, interval_ms: u64, r#loop: bool) -> DistanceEngine {
        DistanceEngine::new(
            points,
            DistanceEngineConfig {
                route_id: Uuid::nil(),
                accuracy: 5.0,
                target_speed_mps: speed_kmh / 3.6,
                interval_ms,
                r#loop,
            },
        )
    }

    #[test]
    fn s1_straight_line_reaches_destination() {
        let mut engine = new_engine(straight_line_points(), 30.0, 1000, false);
        let mut frames = Vec::new();
        let mut terminated = false;
        for _ in 0..60 {
            let out = engine.tick(1000, RunStatus::Running);
            frames.push(out.frame.clone());
            if out.terminated {
                terminated = true;
                break;
            }
        }
        assert!(terminated, "stream should terminate within 60 ticks");
        assert!(frames.len() >= 10 && frames.len() <= 20, "got {}", frames.len());
        let last = frames.last().unwrap();
        let d = distance(LatLng::new(last.lat, last.lng), LatLng::new(0.0, 0.001));
        assert!(d < 1.0, "final position {d}m from destination");

        let mut prev_s = -1.0;
        for f in &frames {
            let s = f.meta.s_meters.unwrap();
            assert!(s >= prev_s - 1e-6, "sMeters must be non-decreasing");
            prev_s = s;
        }
    }

    #[test]
    fn s2_dwell_emits_wait_frames_then_moves() {
        let mut points = straight_line_points();
        points[0].dwell_seconds = 3;
        let mut engine = new_engine(points, 30.0, 1000, false);

        let mut wait_count = 0;
        let mut saw_move = false;
        for _ in 0..60 {
            let out = engine.tick(1000, RunStatus::Running);
            if out.frame.state == SimState::Wait {
                wait_count += 1;
            } else if out.frame.state == SimState::Move {
                saw_move = true;
            }
            if out.terminated {
                break;
            }
        }
        assert!(wait_count >= 3 && wait_count <= 4, "got {wait_count}");
        assert!(saw_move);
    }

    #[test]
    fn s3_loop_resets_s_meters_at_wrap() {
        let points = vec![
            SimPoint {
                pos: LatLng::new(0.0, 0.0),
                dwell_seconds: 0,
            },
            SimPoint {
                pos: LatLng::new(0.0, 0.00009), // ~10m
                dwell_seconds: 0,
            },
        ];
        let mut engine = new_engine(points, 18.0, 500, true);
        let mut saw_wrap_reset = false;
        let mut prev_s = 0.0;
        for _ in 0..40 {
            let out = engine.tick(500, RunStatus::Running);
            let s = out.frame.meta.s_meters.unwrap();
            if s < prev_s {
                saw_wrap_reset = true;
            }
            prev_s = s;
            assert!(!out.terminated, "looping stream never terminates");
        }
        assert!(saw_wrap_reset, "sMeters should reset to 0 across a wraparound");
    }

    #[test]
    fn anti_teleport_detects_large_jump() {
        let points = straight_line_points();
        let mut engine = new_engine(points, 30.0, 1000, false);
        engine.last_emitted = Some(LatLng::new(10.0, 10.0)); // far from actual polyline
        let out = engine.tick(1000, RunStatus::Running);
        assert!(out.anti_teleport);
    }
}
