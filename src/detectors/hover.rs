//! Hover and attention tracking
//!
//! Throttled mouse samples resolve the element under the cursor, classify
//! it into an attention zone, and accrue dwell time per selector. A
//! periodic flush ranks selectors by dwell and emits the top entries. Raw
//! samples are also ring-buffered for the cursor-path analyzer.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DetectorTunables;
use crate::detectors::path::PathPoint;
use crate::document::ElementInfo;

/// Where on the page the user's attention is resting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionZone {
    Heading,
    Content,
    Interactive,
    Media,
    Navigation,
    Form,
    Other,
}

impl AttentionZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionZone::Heading => "heading",
            AttentionZone::Content => "content",
            AttentionZone::Interactive => "interactive",
            AttentionZone::Media => "media",
            AttentionZone::Navigation => "navigation",
            AttentionZone::Form => "form",
            AttentionZone::Other => "other",
        }
    }
}

/// Classify an element into an attention zone by tag and role heuristics
pub fn classify_zone(element: &ElementInfo) -> AttentionZone {
    if let Some(role) = element.role.as_deref() {
        match role {
            "navigation" | "menu" | "menubar" | "tablist" => return AttentionZone::Navigation,
            "button" | "link" | "tab" | "switch" => return AttentionZone::Interactive,
            "form" | "searchbox" | "textbox" | "combobox" => return AttentionZone::Form,
            "heading" => return AttentionZone::Heading,
            "img" | "figure" => return AttentionZone::Media,
            _ => {}
        }
    }
    match element.tag.as_str() {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => AttentionZone::Heading,
        "a" | "button" | "summary" | "details" => AttentionZone::Interactive,
        "img" | "video" | "audio" | "svg" | "canvas" | "picture" | "figure" => {
            AttentionZone::Media
        }
        "nav" | "header" | "footer" | "aside" | "menu" => AttentionZone::Navigation,
        "input" | "select" | "textarea" | "label" | "form" | "fieldset" | "option" => {
            AttentionZone::Form
        }
        "p" | "span" | "li" | "ul" | "ol" | "td" | "th" | "table" | "article" | "section"
        | "main" | "blockquote" | "pre" | "code" | "em" | "strong" | "div" => {
            AttentionZone::Content
        }
        _ => AttentionZone::Other,
    }
}

/// A dwell aggregate ready for emission
#[derive(Debug, Clone, PartialEq)]
pub struct HoverSignal {
    pub selector: String,
    pub zone: AttentionZone,
    pub dwell_ms: i64,
}

#[derive(Debug, Clone)]
struct HoverRecord {
    total_ms: i64,
    last_update: DateTime<Utc>,
    zone: AttentionZone,
}

/// Tracks per-selector dwell and buffers raw mouse samples
pub struct HoverTracker {
    records: HashMap<String, HoverRecord>,
    samples: VecDeque<PathPoint>,
    last_sample_at: Option<DateTime<Utc>>,
    last_selector: Option<String>,
    sample_interval_ms: i64,
    gap_reset_ms: i64,
    min_dwell_ms: i64,
    top_n: usize,
    map_cap: usize,
    evict_count: usize,
    buffer_cap: usize,
}

impl HoverTracker {
    pub fn new(tunables: &DetectorTunables) -> Self {
        Self {
            records: HashMap::new(),
            samples: VecDeque::new(),
            last_sample_at: None,
            last_selector: None,
            sample_interval_ms: tunables.hover_sample_interval_ms,
            gap_reset_ms: tunables.hover_gap_reset_ms,
            min_dwell_ms: tunables.hover_min_dwell_ms,
            top_n: tunables.hover_top_n,
            map_cap: tunables.hover_map_cap,
            evict_count: tunables.hover_evict_count,
            buffer_cap: tunables.mouse_buffer_cap,
        }
    }

    /// Record a mouse movement. Samples inside the throttle interval are
    /// dropped entirely.
    pub fn on_mouse_move(
        &mut self,
        x: f64,
        y: f64,
        element: Option<&ElementInfo>,
        now: DateTime<Utc>,
    ) {
        let previous_at = self.last_sample_at;
        if let Some(last) = previous_at {
            if (now - last).num_milliseconds() < self.sample_interval_ms {
                return;
            }
        }
        self.last_sample_at = Some(now);

        self.samples.push_back(PathPoint { x, y, at: now });
        while self.samples.len() > self.buffer_cap {
            self.samples.pop_front();
        }

        let Some(element) = element else {
            self.last_selector = None;
            return;
        };
        let selector = element.selector();
        let zone = classify_zone(element);

        // Dwell accrues only for consecutive same-selector samples close
        // enough in time; a gap implies the cursor left and returned.
        let gap_ms = previous_at.map(|last| (now - last).num_milliseconds());
        let accrues = self.last_selector.as_deref() == Some(selector.as_str())
            && gap_ms.is_some_and(|gap| gap <= self.gap_reset_ms);

        let record = self
            .records
            .entry(selector.clone())
            .or_insert_with(|| HoverRecord {
                total_ms: 0,
                last_update: now,
                zone,
            });
        if accrues {
            if let Some(gap) = gap_ms {
                record.total_ms += gap;
            }
        }
        record.last_update = now;
        self.last_selector = Some(selector);

        if self.records.len() > self.map_cap {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        let mut by_age: Vec<(String, DateTime<Utc>)> = self
            .records
            .iter()
            .map(|(selector, record)| (selector.clone(), record.last_update))
            .collect();
        by_age.sort_by_key(|(_, last_update)| *last_update);
        for (selector, _) in by_age.into_iter().take(self.evict_count) {
            self.records.remove(&selector);
        }
    }

    /// Rank dwell aggregates, emit the top entries, and clear the map
    pub fn flush_hovers(&mut self) -> Vec<HoverSignal> {
        let mut ranked: Vec<HoverSignal> = self
            .records
            .drain()
            .filter(|(_, record)| record.total_ms >= self.min_dwell_ms)
            .map(|(selector, record)| HoverSignal {
                selector,
                zone: record.zone,
                dwell_ms: record.total_ms,
            })
            .collect();
        ranked.sort_by(|a, b| b.dwell_ms.cmp(&a.dwell_ms));
        ranked.truncate(self.top_n);
        self.last_selector = None;
        ranked
    }

    /// Number of buffered raw samples
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn tracked_selectors(&self) -> usize {
        self.records.len()
    }

    /// Splice out the buffered raw samples for path analysis
    pub fn drain_samples(&mut self) -> Vec<PathPoint> {
        self.samples.drain(..).collect()
    }
}
