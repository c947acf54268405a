//! Rage-click detection
//!
//! Keeps a rolling window of recent click positions. When the last three
//! clicks within the window all lie inside a fixed radius of their
//! centroid, one burst envelope is emitted and the window is cleared, so
//! the same burst is never reported twice. Detection piggybacks on the next
//! click; there is no debounce timer.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::config::DetectorTunables;

/// A detected rage-click burst
#[derive(Debug, Clone, PartialEq)]
pub struct RageSignal {
    /// Number of clicks in the burst window
    pub click_count: u32,
    /// Coordinates of the last click
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy)]
struct ClickSample {
    x: f64,
    y: f64,
    at: DateTime<Utc>,
}

/// Detects bursts of rapid clicks in one spot
pub struct RageClickDetector {
    window: VecDeque<ClickSample>,
    window_ms: i64,
    radius_px: f64,
    min_clicks: usize,
    history_cap: usize,
}

impl RageClickDetector {
    pub fn new(tunables: &DetectorTunables) -> Self {
        Self {
            window: VecDeque::new(),
            window_ms: tunables.rage_window_ms,
            radius_px: tunables.rage_radius_px,
            min_clicks: tunables.rage_min_clicks,
            history_cap: tunables.rage_history_cap,
        }
    }

    /// Record a click; returns a burst signal when one completes
    pub fn on_click(&mut self, x: f64, y: f64, now: DateTime<Utc>) -> Option<RageSignal> {
        let cutoff = now - Duration::milliseconds(self.window_ms);
        while self.window.front().is_some_and(|s| s.at < cutoff) {
            self.window.pop_front();
        }

        self.window.push_back(ClickSample { x, y, at: now });
        while self.window.len() > self.history_cap {
            self.window.pop_front();
        }

        if self.window.len() < self.min_clicks {
            return None;
        }

        let recent: Vec<ClickSample> = self
            .window
            .iter()
            .rev()
            .take(self.min_clicks)
            .copied()
            .collect();
        let n = recent.len() as f64;
        let cx = recent.iter().map(|s| s.x).sum::<f64>() / n;
        let cy = recent.iter().map(|s| s.y).sum::<f64>() / n;

        let within_radius = recent
            .iter()
            .all(|s| ((s.x - cx).powi(2) + (s.y - cy).powi(2)).sqrt() <= self.radius_px);
        if !within_radius {
            return None;
        }

        let signal = RageSignal {
            click_count: self.window.len() as u32,
            x,
            y,
        };
        self.window.clear();
        Some(signal)
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}
