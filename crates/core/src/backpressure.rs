//! Socket Fan-out and Backpressure Guard (C9). Samples per-socket buffer
//! occupancy before every emission; skips the tick if either threshold is
//! exceeded, and auto-pauses the stream after enough strikes within a
//! sliding window (spec §4.7).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub ws_max_bytes: usize,
    pub tcp_max_bytes: usize,
    pub pressure_window_ms: u64,
    pub strikes_to_pause: u32,
    pub enabled: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            ws_max_bytes: 262_144,
            tcp_max_bytes: 524_288,
            pressure_window_ms: 15_000,
            strikes_to_pause: 10,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Emit,
    SkipAndStrike,
    SkipAndAutoPause,
}

/// Per-device strike tracker.
pub struct BackpressureGuard {
    cfg: BackpressureConfig,
    strikes: VecDeque<Instant>,
    last_health_log: Option<Instant>,
}

impl BackpressureGuard {
    pub fn new(cfg: BackpressureConfig) -> Self {
        Self {
            cfg,
            strikes: VecDeque::new(),
            last_health_log: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = Duration::from_millis(self.cfg.pressure_window_ms);
        while let Some(front) = self.strikes.front() {
            if now.duration_since(*front) > window {
                self.strikes.pop_front();
            } else {
                break;
            }
        }
    }

    /// `sample`: `(ws_buffered, tcp_buffered)` in bytes.
    pub fn evaluate(&mut self, sample: (usize, usize), now: Instant) -> GuardDecision {
        if !self.cfg.enabled {
            return GuardDecision::Emit;
        }
        self.prune(now);
        let (ws, tcp) = sample;
        if ws <= self.cfg.ws_max_bytes && tcp <= self.cfg.tcp_max_bytes {
            return GuardDecision::Emit;
        }
        self.strikes.push_back(now);
        if self.strikes.len() as u32 >= self.cfg.strikes_to_pause {
            GuardDecision::SkipAndAutoPause
        } else {
            GuardDecision::SkipAndStrike
        }
    }

    pub fn strike_count(&self) -> usize {
        self.strikes.len()
    }

    /// At most every 10s per device (spec §4.7 "health" audit).
    pub fn should_log_health(&mut self, now: Instant) -> bool {
        match self.last_health_log {
            Some(prev) if now.duration_since(prev) < Duration::from_secs(10) => false,
            _ => {
                self.last_health_log = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_ten_strikes_within_window_triggers_auto_pause() {
        let mut guard = BackpressureGuard::new(BackpressureConfig::default());
        let start = Instant::now();
        let mut last = GuardDecision::Emit;
        for i in 0..10 {
            let now = start + Duration::from_millis(i * 500);
            last = guard.evaluate((300_000, 0), now);
        }
        assert_eq!(last, GuardDecision::SkipAndAutoPause);
    }

    #[test]
    fn strikes_outside_window_do_not_accumulate() {
        let mut guard = BackpressureGuard::new(BackpressureConfig::default());
        let start = Instant::now();
        for _ in 0..5 {
            guard.evaluate((300_000, 0), start);
        }
        assert_eq!(guard.strike_count(), 5);
        let later = start + Duration::from_millis(20_000);
        let decision = guard.evaluate((300_000, 0), later);
        assert_eq!(guard.strike_count(), 1);
        assert_eq!(decision, GuardDecision::SkipAndStrike);
    }

    #[test]
    fn under_threshold_always_emits() {
        let mut guard = BackpressureGuard::new(BackpressureConfig::default());
        let now = Instant::now();
        assert_eq!(guard.evaluate((100, 100), now), GuardDecision::Emit);
        assert_eq!(guard.strike_count(), 0);
    }
}
