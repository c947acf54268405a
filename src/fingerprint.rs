//! Structural fingerprinting and snapshot orchestration
//!
//! A fingerprint is a single hash folded from a deterministic sample of the
//! document tree plus current content dimensions. Fingerprints are only
//! comparable for equality: any inequality means "document materially
//! changed" and triggers an idle-priority snapshot re-capture tagged with
//! both the new and previous hash.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DetectorTunables;
use crate::document::DocumentView;
use crate::envelope::DeviceClass;

/// Structural snapshot wire shape. Multiple snapshots may coexist per page,
/// keyed by device type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub site_id: String,
    pub page_path: String,
    pub device_type: DeviceClass,
    pub snapshot: String,
    pub width: u32,
    pub height: u32,
    pub origin: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Render a fingerprint as its fixed-width wire token
pub fn format_hash(hash: u64) -> String {
    format!("{hash:016x}")
}

fn fold(mut hash: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(u64::from(byte));
    }
    hash
}

/// Hash a deterministic sample of the document structure. Every Nth body
/// node contributes tag, id, and first two class tokens; N is chosen so the
/// sample stays near `sample_target` regardless of document size. Content
/// dimensions fold in last so pure layout changes also register.
pub fn structural_fingerprint(document: &dyn DocumentView, sample_target: usize) -> u64 {
    let nodes = document.body_nodes();
    let step = (nodes.len() / sample_target.max(1)).max(1);

    let mut hash: u64 = 5381;
    for node in nodes.iter().step_by(step) {
        hash = fold(hash, node.tag.as_bytes());
        if let Some(id) = &node.id {
            hash = fold(hash, b"#");
            hash = fold(hash, id.as_bytes());
        }
        for class in node.classes.iter().take(2) {
            hash = fold(hash, b".");
            hash = fold(hash, class.as_bytes());
        }
    }

    let (width, height) = document.content_size();
    hash = fold(hash, format!("|{}x{}", width as i64, height as i64).as_bytes());
    hash
}

/// A snapshot capture the collector should schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub hash: u64,
    pub previous_hash: Option<u64>,
    /// 1-based attempt number, for logging
    pub attempt: u32,
}

#[derive(Debug)]
struct PendingCapture {
    hash: u64,
    previous_hash: Option<u64>,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
    in_flight: bool,
}

/// Watches for structural change and drives snapshot capture retries
pub struct FingerprintMonitor {
    current_hash: Option<u64>,
    pending: Option<PendingCapture>,
    next_periodic_at: Option<DateTime<Utc>>,
    resize_due_at: Option<DateTime<Utc>>,
    orientation_due_at: Option<DateTime<Utc>>,
    sample_target: usize,
    interval_ms: i64,
    resize_debounce_ms: i64,
    orientation_defer_ms: i64,
    max_attempts: u32,
    backoff_base_ms: i64,
}

impl FingerprintMonitor {
    pub fn new(tunables: &DetectorTunables) -> Self {
        Self {
            current_hash: None,
            pending: None,
            next_periodic_at: None,
            resize_due_at: None,
            orientation_due_at: None,
            sample_target: tunables.fingerprint_sample_target,
            interval_ms: tunables.fingerprint_interval_ms,
            resize_debounce_ms: tunables.resize_debounce_ms,
            orientation_defer_ms: tunables.orientation_defer_ms,
            max_attempts: tunables.snapshot_max_attempts,
            backoff_base_ms: tunables.snapshot_backoff_base_ms,
        }
    }

    /// Take the initial fingerprint and request the on-load snapshot
    pub fn prime(&mut self, document: &dyn DocumentView, now: DateTime<Utc>) {
        let hash = structural_fingerprint(document, self.sample_target);
        self.current_hash = Some(hash);
        self.next_periodic_at = Some(now + Duration::milliseconds(self.interval_ms));
        self.pending = Some(PendingCapture {
            hash,
            previous_hash: None,
            attempts: 0,
            next_attempt_at: now,
            in_flight: false,
        });
    }

    pub fn current_hash(&self) -> Option<u64> {
        self.current_hash
    }

    /// Each resize pushes the recheck out by the debounce window
    pub fn on_resize(&mut self, now: DateTime<Utc>) {
        self.resize_due_at = Some(now + Duration::milliseconds(self.resize_debounce_ms));
    }

    /// Orientation changes defer the recheck until layout settles
    pub fn on_orientation_change(&mut self, now: DateTime<Utc>) {
        self.orientation_due_at = Some(now + Duration::milliseconds(self.orientation_defer_ms));
    }

    /// Recompute the fingerprint and, on inequality, queue a capture
    fn check_changes(&mut self, document: &dyn DocumentView, now: DateTime<Utc>) {
        let fresh = structural_fingerprint(document, self.sample_target);
        if self.current_hash == Some(fresh) {
            return;
        }
        let previous = self.current_hash;
        self.current_hash = Some(fresh);
        self.pending = Some(PendingCapture {
            hash: fresh,
            previous_hash: previous,
            attempts: 0,
            next_attempt_at: now,
            in_flight: false,
        });
    }

    /// Service due triggers and return a capture to schedule, if any
    pub fn poll(&mut self, document: &dyn DocumentView, now: DateTime<Utc>) -> Option<CaptureRequest> {
        if self.resize_due_at.is_some_and(|due| now >= due) {
            self.resize_due_at = None;
            self.check_changes(document, now);
        }
        if self.orientation_due_at.is_some_and(|due| now >= due) {
            self.orientation_due_at = None;
            self.check_changes(document, now);
        }
        if self.next_periodic_at.is_some_and(|due| now >= due) {
            self.next_periodic_at = Some(now + Duration::milliseconds(self.interval_ms));
            self.check_changes(document, now);
        }

        let pending = self.pending.as_mut()?;
        if pending.in_flight || now < pending.next_attempt_at {
            return None;
        }
        pending.in_flight = true;
        pending.attempts += 1;
        Some(CaptureRequest {
            hash: pending.hash,
            previous_hash: pending.previous_hash,
            attempt: pending.attempts,
        })
    }

    /// The capture target was not ready; back off and retry, or give up
    /// silently after the attempt cap.
    pub fn capture_failed(&mut self, now: DateTime<Utc>) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.attempts >= self.max_attempts {
            log::debug!(
                "giving up on snapshot capture after {} attempts",
                pending.attempts
            );
            self.pending = None;
            return;
        }
        pending.in_flight = false;
        pending.next_attempt_at =
            now + Duration::milliseconds(self.backoff_base_ms * i64::from(pending.attempts));
    }

    pub fn capture_succeeded(&mut self) {
        self.pending = None;
    }

    /// Whether a resize or orientation recheck is scheduled
    pub fn has_pending_recheck(&self) -> bool {
        self.resize_due_at.is_some() || self.orientation_due_at.is_some()
    }

    pub fn has_pending_capture(&self) -> bool {
        self.pending.is_some()
    }
}
