//! Error types for Pagepulse

use thiserror::Error;

/// Errors that can occur inside the collector
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Invalid attach configuration: {0}")]
    ConfigError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Client storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Transport failure: {0}")]
    TransportError(String),

    #[error("Ingest endpoint returned status {0}")]
    HttpStatus(u16),

    #[error("Scheduled task failed: {0}")]
    TaskFailed(String),

    #[error("Snapshot capture target not ready")]
    SnapshotUnavailable,

    #[error("Invalid input event: {0}")]
    InvalidEvent(String),
}
