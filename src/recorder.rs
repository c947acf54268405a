//! Session recorder bridge
//!
//! Replay frames are captured by a third-party recorder outside this crate;
//! the bridge only buffers them and flushes batches through the delivery
//! pipeline. A final best-effort flush happens at page unload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DetectorTunables;
use crate::envelope::DeviceInfo;

/// One externally captured replay frame, passed through opaquely
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayFrame {
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Replay batch wire shape
#[derive(Debug, Clone, Serialize)]
pub struct ReplayBatch<'a> {
    pub site_id: &'a str,
    pub session_id: &'a str,
    pub visitor_id: &'a str,
    pub events: Vec<ReplayFrame>,
    pub device: &'a DeviceInfo,
    pub page_url: &'a str,
    pub page_path: &'a str,
}

/// Buffers replay frames until a flush is due
pub struct RecorderBridge {
    buffer: Vec<ReplayFrame>,
    flush_count: usize,
}

impl RecorderBridge {
    pub fn new(tunables: &DetectorTunables) -> Self {
        Self {
            buffer: Vec::new(),
            flush_count: tunables.recorder_flush_count,
        }
    }

    pub fn push_frame(&mut self, kind: &str, data: Value, timestamp: DateTime<Utc>) {
        self.buffer.push(ReplayFrame {
            kind: kind.to_string(),
            data,
            timestamp,
        });
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the buffered frames if the batch threshold is reached, or
    /// unconditionally when `force` is set (interval flush, page unload).
    pub fn take_batch(&mut self, force: bool) -> Option<Vec<ReplayFrame>> {
        if self.buffer.is_empty() {
            return None;
        }
        if !force && self.buffer.len() < self.flush_count {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn bridge() -> RecorderBridge {
        RecorderBridge::new(&DetectorTunables::default())
    }

    #[test]
    fn test_batch_held_until_threshold() {
        let mut bridge = bridge();
        for i in 0..49 {
            bridge.push_frame("dom", serde_json::json!({ "seq": i }), base_time());
        }
        assert!(bridge.take_batch(false).is_none());

        bridge.push_frame("dom", serde_json::json!({ "seq": 49 }), base_time());
        let batch = bridge.take_batch(false).unwrap();
        assert_eq!(batch.len(), 50);
        assert_eq!(bridge.buffered(), 0);
    }

    #[test]
    fn test_forced_flush_takes_partial_batch() {
        let mut bridge = bridge();
        bridge.push_frame("dom", serde_json::json!({}), base_time());
        bridge.push_frame("input", serde_json::json!({}), base_time());

        let batch = bridge.take_batch(true).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_empty_buffer_never_flushes() {
        let mut bridge = bridge();
        assert!(bridge.take_batch(true).is_none());
    }
}
