//! Confusion-scroll detection
//!
//! Watches debounced vertical scroll deltas for rapid direction flips.
//! Enough flips inside a short trailing window, outside a cooldown, emit a
//! single scored confusion envelope. A heuristic, not ground truth; every
//! constant here is tunable policy.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::config::DetectorTunables;

/// A detected confusion-scroll episode
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionSignal {
    /// clamp((changes-per-second × average delta) / divisor, 0..1)
    pub score: f64,
    pub direction_changes: u32,
    pub avg_delta_px: f64,
}

#[derive(Debug, Clone, Copy)]
struct DirectionChange {
    at: DateTime<Utc>,
    delta_px: f64,
}

/// Detects to-and-fro scrolling
pub struct ConfusionScrollDetector {
    entries: VecDeque<DirectionChange>,
    last_sample_at: Option<DateTime<Utc>>,
    last_y: Option<f64>,
    last_direction: i8,
    last_emit_at: Option<DateTime<Utc>>,
    debounce_ms: i64,
    min_delta_px: f64,
    window_ms: i64,
    window_cap: usize,
    change_threshold: usize,
    cooldown_ms: i64,
    score_divisor: f64,
}

impl ConfusionScrollDetector {
    pub fn new(tunables: &DetectorTunables) -> Self {
        Self {
            entries: VecDeque::new(),
            last_sample_at: None,
            last_y: None,
            last_direction: 0,
            last_emit_at: None,
            debounce_ms: tunables.scroll_debounce_ms,
            min_delta_px: tunables.scroll_min_delta_px,
            window_ms: tunables.scroll_window_ms,
            window_cap: tunables.scroll_window_cap,
            change_threshold: tunables.scroll_change_threshold,
            cooldown_ms: tunables.scroll_cooldown_ms,
            score_divisor: tunables.scroll_score_divisor,
        }
    }

    /// Record a scroll position sample; returns a signal when the episode
    /// threshold is crossed.
    pub fn on_scroll(&mut self, scroll_y: f64, now: DateTime<Utc>) -> Option<ConfusionSignal> {
        // Debounce: samples inside the tick interval are dropped entirely
        if let Some(last) = self.last_sample_at {
            if (now - last).num_milliseconds() < self.debounce_ms {
                return None;
            }
        }
        self.last_sample_at = Some(now);

        let previous_y = match self.last_y.replace(scroll_y) {
            Some(y) => y,
            None => return None,
        };

        let delta = scroll_y - previous_y;
        if delta.abs() < self.min_delta_px {
            return None;
        }

        let direction: i8 = if delta > 0.0 { 1 } else { -1 };
        let flipped = self.last_direction != 0 && direction != self.last_direction;
        self.last_direction = direction;

        if flipped {
            self.entries.push_back(DirectionChange {
                at: now,
                delta_px: delta.abs(),
            });
        }

        let cutoff = now - Duration::milliseconds(self.window_ms);
        while self.entries.front().is_some_and(|e| e.at < cutoff) {
            self.entries.pop_front();
        }
        while self.entries.len() > self.window_cap {
            self.entries.pop_front();
        }

        if self.entries.len() < self.change_threshold {
            return None;
        }
        if let Some(last_emit) = self.last_emit_at {
            if (now - last_emit).num_milliseconds() < self.cooldown_ms {
                return None;
            }
        }

        let changes = self.entries.len();
        let avg_delta_px =
            self.entries.iter().map(|e| e.delta_px).sum::<f64>() / changes as f64;
        let changes_per_second = changes as f64 / (self.window_ms as f64 / 1_000.0);
        let score = ((changes_per_second * avg_delta_px) / self.score_divisor).clamp(0.0, 1.0);

        self.entries.clear();
        self.last_emit_at = Some(now);

        Some(ConfusionSignal {
            score,
            direction_changes: changes as u32,
            avg_delta_px,
        })
    }

    pub fn recorded_changes(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn detector() -> ConfusionScrollDetector {
        ConfusionScrollDetector::new(&DetectorTunables::default())
    }

    /// Feed an alternating up/down scroll pattern with the given step and
    /// spacing; returns the first signal emitted, if any.
    fn feed_zigzag(
        detector: &mut ConfusionScrollDetector,
        start: DateTime<Utc>,
        steps: usize,
        step_px: f64,
        spacing_ms: i64,
    ) -> Option<ConfusionSignal> {
        let mut result = None;
        let mut y = 1_000.0;
        for i in 0..steps {
            y += if i % 2 == 0 { step_px } else { -step_px };
            let at = start + Duration::milliseconds(spacing_ms * (i as i64 + 1));
            if let Some(signal) = detector.on_scroll(y, at) {
                result.get_or_insert(signal);
            }
        }
        result
    }

    #[test]
    fn test_zigzag_reaches_threshold() {
        let mut detector = detector();
        detector.on_scroll(1_000.0, base_time());

        // Every step after the second flips direction; 5 flips emit
        let signal = feed_zigzag(&mut detector, base_time(), 8, 120.0, 100)
            .expect("confusion expected");
        assert_eq!(signal.direction_changes, 5);
        assert!(signal.score > 0.0 && signal.score <= 1.0);
        assert_eq!(detector.recorded_changes(), 0);
    }

    #[test]
    fn test_below_threshold_never_emits() {
        let mut detector = detector();
        detector.on_scroll(1_000.0, base_time());

        // Only 4 direction changes possible from 5 steps
        assert!(feed_zigzag(&mut detector, base_time(), 5, 120.0, 100).is_none());
    }

    #[test]
    fn test_small_deltas_are_noise() {
        let mut detector = detector();
        detector.on_scroll(1_000.0, base_time());

        assert!(feed_zigzag(&mut detector, base_time(), 20, 30.0, 100).is_none());
        assert_eq!(detector.recorded_changes(), 0);
    }

    #[test]
    fn test_monotonic_scroll_never_emits() {
        let mut detector = detector();
        let t = base_time();
        for i in 0..30 {
            let signal = detector.on_scroll(
                1_000.0 + 200.0 * i as f64,
                t + Duration::milliseconds(100 * i),
            );
            assert!(signal.is_none());
        }
    }

    #[test]
    fn test_cooldown_suppresses_second_episode() {
        let mut detector = detector();
        detector.on_scroll(1_000.0, base_time());

        let first = feed_zigzag(&mut detector, base_time(), 8, 120.0, 100);
        assert!(first.is_some());

        // Immediately continue zigzagging inside the cooldown window
        let resumed = base_time() + Duration::milliseconds(900);
        let second = feed_zigzag(&mut detector, resumed, 10, 120.0, 100);
        assert!(second.is_none());
    }

    #[test]
    fn test_new_episode_after_cooldown() {
        let mut detector = detector();
        detector.on_scroll(1_000.0, base_time());
        assert!(feed_zigzag(&mut detector, base_time(), 8, 120.0, 100).is_some());

        let later = base_time() + Duration::milliseconds(10_000);
        detector.on_scroll(1_000.0, later);
        assert!(feed_zigzag(&mut detector, later, 8, 120.0, 100).is_some());
    }

    #[test]
    fn test_debounced_samples_are_dropped() {
        let mut detector = detector();
        let t = base_time();
        detector.on_scroll(1_000.0, t);
        // 10ms later: inside the 50ms debounce, ignored entirely
        assert!(detector
            .on_scroll(2_000.0, t + Duration::milliseconds(10))
            .is_none());
        assert!(detector.last_y.is_some_and(|y| y == 1_000.0));
    }

    #[test]
    fn test_stale_entries_pruned_from_window() {
        let mut detector = detector();
        detector.on_scroll(1_000.0, base_time());

        assert!(feed_zigzag(&mut detector, base_time(), 5, 120.0, 100).is_none());
        assert_eq!(detector.recorded_changes(), 4);

        // One more flip far outside the window leaves only itself recorded
        let later = base_time() + Duration::milliseconds(5_000);
        detector.on_scroll(1_000.0, later);
        assert_eq!(detector.recorded_changes(), 1);
    }
}
