//! Delivery pipeline
//!
//! Compresses, batches, and ships event payloads. Two send modes exist:
//! best-effort beacons (fire-and-forget, survive page unload) and awaited
//! sends with failure visibility. Failed awaited sends enter a bounded
//! retry queue processed on a fixed timer; items past the retry cap are
//! dropped with a warning and never escalated.

use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::capability::{Compressor, HttpMethod, Transport, TransportRequest};
use crate::envelope::EventEnvelope;
use crate::error::CollectorError;

/// Maximum transport failures before an item is dropped
pub const MAX_RETRIES: u32 = 3;

/// Delivery tuning. The retry delay is fixed, not exponential.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub retry_interval_ms: i64,
    pub retry_batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_interval_ms: 5_000,
            retry_batch_size: 5,
        }
    }
}

/// Ingest batch wire shape
#[derive(Debug, Clone, Serialize)]
pub struct IngestBatch<'a> {
    pub events: &'a [EventEnvelope],
    pub site_id: &'a str,
}

/// Debug telemetry batch wire shape (console, network, web-vitals events)
#[derive(Debug, Clone, Serialize)]
pub struct DebugBatch<'a> {
    pub events: &'a [Value],
    pub site_id: &'a str,
    pub session_id: &'a str,
}

/// A queued payload awaiting re-send. `retry_count` is the number of
/// transport failures observed so far.
#[derive(Debug, Clone)]
struct RetryItem {
    url: String,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
    retry_count: u32,
}

/// Compress-batch-send-retry pipeline
pub struct DeliveryPipeline {
    transport: Rc<dyn Transport>,
    compressor: Box<dyn Compressor>,
    api_key: String,
    config: DeliveryConfig,
    retry_queue: VecDeque<RetryItem>,
    last_retry_run: Option<DateTime<Utc>>,
}

impl DeliveryPipeline {
    pub fn new(
        transport: Rc<dyn Transport>,
        compressor: Box<dyn Compressor>,
        api_key: &str,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            transport,
            compressor,
            api_key: api_key.to_string(),
            config,
            retry_queue: VecDeque::new(),
            last_retry_run: None,
        }
    }

    /// Serialize, compress, and build the outbound request. Compression
    /// failure silently falls back to the raw JSON body.
    fn prepare(&self, url: &str, json: Vec<u8>) -> TransportRequest {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("X-Api-Key".to_string(), self.api_key.clone()),
        ];
        let body = match (self.compressor.compress(&json), self.compressor.encoding()) {
            (Some(compressed), Some(encoding)) => {
                headers.push(("Content-Encoding".to_string(), encoding.to_string()));
                compressed
            }
            _ => json,
        };
        TransportRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers,
            body,
        }
    }

    /// Fire-and-forget send. Never fails, never retries.
    pub fn send_beacon<T: Serialize>(&self, url: &str, payload: &T) {
        let json = match serde_json::to_vec(payload) {
            Ok(json) => json,
            Err(err) => {
                log::warn!("dropping unserializable beacon payload: {err}");
                return;
            }
        };
        self.transport.send_beacon(self.prepare(url, json));
    }

    /// Awaited send with failure visibility. A failed send is queued for
    /// retry before the error is returned.
    pub fn send<T: Serialize>(&mut self, url: &str, payload: &T) -> Result<(), CollectorError> {
        let json = serde_json::to_vec(payload)?;
        let request = self.prepare(url, json);
        match self.dispatch(&request) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.retry_queue.push_back(RetryItem {
                    url: request.url,
                    body: request.body,
                    headers: request.headers,
                    retry_count: 1,
                });
                Err(err)
            }
        }
    }

    /// Awaited GET, used for the remote widget configuration
    pub fn get(&self, url: &str) -> Result<Vec<u8>, CollectorError> {
        let response = self.transport.send(TransportRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: vec![("X-Api-Key".to_string(), self.api_key.clone())],
            body: Vec::new(),
        })?;
        if !response.is_success() {
            return Err(CollectorError::HttpStatus(response.status));
        }
        Ok(response.body)
    }

    fn dispatch(&self, request: &TransportRequest) -> Result<(), CollectorError> {
        let response = self.transport.send(request.clone())?;
        if !response.is_success() {
            return Err(CollectorError::HttpStatus(response.status));
        }
        Ok(())
    }

    /// Process up to one retry batch if the fixed delay has elapsed.
    /// Exhausted items are dropped quietly; the caller never sees an error.
    pub fn process_retries(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_retry_run {
            if (now - last).num_milliseconds() < self.config.retry_interval_ms {
                return;
            }
        }
        self.last_retry_run = Some(now);

        let batch = self.config.retry_batch_size.min(self.retry_queue.len());
        for _ in 0..batch {
            let mut item = match self.retry_queue.pop_front() {
                Some(item) => item,
                None => break,
            };
            let request = TransportRequest {
                method: HttpMethod::Post,
                url: item.url.clone(),
                headers: item.headers.clone(),
                body: item.body.clone(),
            };
            if self.dispatch(&request).is_err() {
                item.retry_count += 1;
                if item.retry_count >= self.config.max_retries {
                    log::warn!(
                        "dropping payload for {} after {} failed attempts",
                        item.url,
                        item.retry_count
                    );
                } else {
                    self.retry_queue.push_back(item);
                }
            }
        }
    }

    pub fn pending_retries(&self) -> usize {
        self.retry_queue.len()
    }

    /// Abandon queued retries; called when the page is torn down
    pub fn abandon_retries(&mut self) {
        self.retry_queue.clear();
    }
}
