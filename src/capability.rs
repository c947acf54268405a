//! Host capability interfaces
//!
//! The collector runs inside a host page it does not control. Every optional
//! host facility (wall clock, durable storage, network transport, streaming
//! compression) sits behind a small trait with a degraded implementation, so
//! detector logic never feature-detects inline. Capabilities are selected
//! once at attach time.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::CollectorError;

/// Source of the current time. Production uses [`SystemClock`]; tests drive
/// a [`ManualClock`] to step through debounce windows and timers.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the system time
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    /// Advance the clock by the given number of milliseconds
    pub fn advance_ms(&self, ms: i64) {
        self.now
            .set(self.now.get() + chrono::Duration::milliseconds(ms));
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Durable string storage (the host's persistent store). A `set` failure
/// signals quota exhaustion or a private browsing mode; callers degrade to
/// in-memory state rather than erroring out.
pub trait KeyValueStorage {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), CollectorError>;
    fn remove(&self, key: &str);
}

/// In-memory storage, used both as the degraded fallback and in tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: RefCell<HashMap<String, String>>,
    fail_writes: Cell<bool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail, simulating an exhausted quota
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CollectorError> {
        if self.fail_writes.get() {
            return Err(CollectorError::StorageUnavailable(
                "write rejected".to_string(),
            ));
        }
        self.map.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.map.borrow_mut().remove(key);
    }
}

/// HTTP method for outbound requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

/// A fully prepared outbound request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Response from an awaited send
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network transport. `send_beacon` is fire-and-forget and must survive page
/// unload on a real host; `send` is awaited and reports failure so the
/// delivery pipeline can queue a retry.
pub trait Transport {
    fn send_beacon(&self, request: TransportRequest);
    fn send(&self, request: TransportRequest) -> Result<TransportResponse, CollectorError>;
}

/// Transport that records every request, used by tests, the CLI replay
/// harness, and the FFI embedding (where the host performs the actual IO).
///
/// Failures can be scripted with [`MemoryTransport::fail_next`].
#[derive(Debug, Default)]
pub struct MemoryTransport {
    requests: RefCell<Vec<TransportRequest>>,
    failures_remaining: Cell<u32>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` awaited sends fail with a transport error
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.set(count);
    }

    /// Number of requests recorded so far
    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Remove and return every recorded request
    pub fn drain(&self) -> Vec<TransportRequest> {
        self.requests.borrow_mut().drain(..).collect()
    }

    /// Requests recorded against the given URL
    pub fn requests_to(&self, url: &str) -> Vec<TransportRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn send_beacon(&self, request: TransportRequest) {
        self.requests.borrow_mut().push(request);
    }

    fn send(&self, request: TransportRequest) -> Result<TransportResponse, CollectorError> {
        let remaining = self.failures_remaining.get();
        if remaining > 0 {
            self.failures_remaining.set(remaining - 1);
            return Err(CollectorError::TransportError(
                "scripted failure".to_string(),
            ));
        }
        self.requests.borrow_mut().push(request);
        Ok(TransportResponse {
            status: 200,
            body: Vec::new(),
        })
    }
}

/// Payload compression. `compress` returning `None` means the capability is
/// unavailable or the attempt failed; the caller sends the uncompressed body
/// and never surfaces an error.
pub trait Compressor {
    /// Value for the `Content-Encoding` header, if compression is applied
    fn encoding(&self) -> Option<&'static str>;
    fn compress(&self, bytes: &[u8]) -> Option<Vec<u8>>;
}

/// Gzip compression via flate2
#[derive(Debug, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn encoding(&self) -> Option<&'static str> {
        Some("gzip")
    }

    fn compress(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).ok()?;
        encoder.finish().ok()
    }
}

/// No-op compressor for hosts without a compression stream
#[derive(Debug, Default)]
pub struct NoCompressor;

impl Compressor for NoCompressor {
    fn encoding(&self) -> Option<&'static str> {
        None
    }

    fn compress(&self, _bytes: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance_ms(1500);
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.get("k").is_none());
        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k").as_deref(), Some("v"));
        storage.remove("k");
        assert!(storage.get("k").is_none());
    }

    #[test]
    fn test_memory_storage_failing_writes() {
        let storage = MemoryStorage::new();
        storage.fail_writes(true);
        assert!(storage.set("k", "v").is_err());
        assert!(storage.get("k").is_none());
    }

    #[test]
    fn test_memory_transport_scripted_failures() {
        let transport = MemoryTransport::new();
        transport.fail_next(1);

        let request = TransportRequest {
            method: HttpMethod::Post,
            url: "https://ingest.example/e".to_string(),
            headers: vec![],
            body: b"{}".to_vec(),
        };

        assert!(transport.send(request.clone()).is_err());
        assert!(transport.send(request).is_ok());
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn test_gzip_compressor_shrinks_repetitive_payload() {
        let compressor = GzipCompressor;
        let body = "abcabcabc".repeat(200);
        let compressed = compressor.compress(body.as_bytes()).unwrap();
        assert!(compressed.len() < body.len());
        assert_eq!(compressor.encoding(), Some("gzip"));
    }

    #[test]
    fn test_no_compressor_declines() {
        let compressor = NoCompressor;
        assert!(compressor.compress(b"payload").is_none());
        assert!(compressor.encoding().is_none());
    }
}
