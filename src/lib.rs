//! Pagepulse - In-page behavioral telemetry collector for hosted documents
//!
//! Pagepulse observes a visitor's interaction with a page, derives
//! behavioral signals (frustration, confusion, attention, navigation
//! intent), and ships compact, privacy-scrubbed event batches to a
//! collection backend without degrading host responsiveness.
//!
//! ## Modules
//!
//! - **Detectors**: click/dead-click, rage-click, confusion-scroll,
//!   hover/attention, and cursor-path analysis over the live event stream
//! - **Delivery**: compression, batching, beacons, and bounded retry
//! - **Fingerprinting**: structural change detection driving snapshot
//!   re-capture

pub mod capability;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod detectors;
pub mod document;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod recorder;
pub mod scheduler;
pub mod scrub;
pub mod session;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use capability::{
    Clock, Compressor, GzipCompressor, KeyValueStorage, ManualClock, MemoryStorage,
    MemoryTransport, NoCompressor, SystemClock, Transport,
};
pub use collector::{Collector, HostCapabilities, InputEvent};
pub use config::{AttachConfig, CollectorConfig, DetectorTunables, WidgetConfig};
pub use envelope::{DeviceClass, EventEnvelope, EventType, PageContext};
pub use error::CollectorError;
pub use scrub::{scrub, scrub_value};

/// Collector version embedded in outbound payloads
pub const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Agent name for provenance
pub const AGENT_NAME: &str = "pagepulse";
