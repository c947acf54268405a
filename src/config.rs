//! Collector configuration
//!
//! Attachment attributes from the host script tag, tunable detector policy
//! constants, and the remotely fetched widget configuration. Detector
//! thresholds are deliberately configuration, not hard constants; the
//! defaults below match the documented behavior.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryConfig;
use crate::error::CollectorError;
use crate::session::DEFAULT_SESSION_TIMEOUT_MINUTES;

/// Identity of the collector attachment, carried as script-tag attributes.
/// Missing site id or api key is a fatal configuration error that leaves
/// the tracker inert (logged, never thrown).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachConfig {
    pub site_id: String,
    pub api_key: String,
    #[serde(default = "default_api_host")]
    pub api_host: String,
}

fn default_api_host() -> String {
    "https://in.pagepulse.dev".to_string()
}

impl AttachConfig {
    /// Read the attach identity from host attachment attributes
    /// (`data-site-id`, `data-api-key`, `data-api-host`).
    pub fn from_attributes(attributes: &HashMap<String, String>) -> Result<Self, CollectorError> {
        let site_id = attributes
            .get("data-site-id")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CollectorError::ConfigError("missing data-site-id".to_string()))?;
        let api_key = attributes
            .get("data-api-key")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CollectorError::ConfigError("missing data-api-key".to_string()))?;
        let api_host = attributes
            .get("data-api-host")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(default_api_host);
        Ok(Self {
            site_id: site_id.clone(),
            api_key: api_key.clone(),
            api_host,
        })
    }

    pub fn ingest_url(&self) -> String {
        format!("{}/ingest", self.api_host)
    }

    pub fn replay_url(&self) -> String {
        format!("{}/replay", self.api_host)
    }

    pub fn snapshots_url(&self) -> String {
        format!("{}/snapshots", self.api_host)
    }

    pub fn debug_url(&self) -> String {
        format!("{}/debug", self.api_host)
    }

    pub fn forms_url(&self) -> String {
        format!("{}/forms", self.api_host)
    }

    pub fn config_url(&self) -> String {
        format!("{}/config/{}", self.api_host, self.site_id)
    }
}

/// Policy constants for every detector. Empirically chosen defaults; all of
/// them are tunable per attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorTunables {
    /// How long after a click to wait for a qualifying mutation
    pub dead_click_window_ms: i64,
    /// Attributes whose mutation counts as "something happened"
    pub mutation_attribute_allowlist: Vec<String>,

    pub rage_window_ms: i64,
    pub rage_radius_px: f64,
    pub rage_min_clicks: usize,
    pub rage_history_cap: usize,

    pub scroll_debounce_ms: i64,
    pub scroll_min_delta_px: f64,
    pub scroll_window_ms: i64,
    pub scroll_window_cap: usize,
    pub scroll_change_threshold: usize,
    pub scroll_cooldown_ms: i64,
    pub scroll_score_divisor: f64,

    pub hover_sample_interval_ms: i64,
    pub hover_gap_reset_ms: i64,
    pub hover_flush_interval_ms: i64,
    pub hover_min_dwell_ms: i64,
    pub hover_top_n: usize,
    pub hover_map_cap: usize,
    pub hover_evict_count: usize,

    pub mouse_buffer_cap: usize,
    pub mouse_flush_count: usize,
    pub mouse_flush_interval_ms: i64,
    pub path_epsilon_px: f64,
    pub path_turn_threshold_deg: f64,
    pub path_erratic_changes_per_px: f64,
    pub path_min_distance_px: f64,

    pub fingerprint_interval_ms: i64,
    pub fingerprint_sample_target: usize,
    pub resize_debounce_ms: i64,
    pub orientation_defer_ms: i64,
    pub snapshot_max_attempts: u32,
    pub snapshot_backoff_base_ms: i64,

    pub recorder_flush_count: usize,
    pub recorder_flush_interval_ms: i64,

    pub debug_flush_interval_ms: i64,
}

impl Default for DetectorTunables {
    fn default() -> Self {
        Self {
            dead_click_window_ms: 300,
            mutation_attribute_allowlist: vec![
                "class".to_string(),
                "style".to_string(),
                "data-loading".to_string(),
                "aria-expanded".to_string(),
                "aria-hidden".to_string(),
            ],

            rage_window_ms: 1_000,
            rage_radius_px: 50.0,
            rage_min_clicks: 3,
            rage_history_cap: 100,

            scroll_debounce_ms: 50,
            scroll_min_delta_px: 50.0,
            scroll_window_ms: 2_000,
            scroll_window_cap: 20,
            scroll_change_threshold: 5,
            scroll_cooldown_ms: 5_000,
            scroll_score_divisor: 500.0,

            hover_sample_interval_ms: 50,
            hover_gap_reset_ms: 200,
            hover_flush_interval_ms: 30_000,
            hover_min_dwell_ms: 500,
            hover_top_n: 10,
            hover_map_cap: 100,
            hover_evict_count: 20,

            mouse_buffer_cap: 200,
            mouse_flush_count: 50,
            mouse_flush_interval_ms: 10_000,
            path_epsilon_px: 3.0,
            path_turn_threshold_deg: 45.0,
            path_erratic_changes_per_px: 0.05,
            path_min_distance_px: 300.0,

            fingerprint_interval_ms: 30 * 60 * 1_000,
            fingerprint_sample_target: 500,
            resize_debounce_ms: 1_000,
            orientation_defer_ms: 500,
            snapshot_max_attempts: 8,
            snapshot_backoff_base_ms: 500,

            recorder_flush_count: 50,
            recorder_flush_interval_ms: 5_000,

            debug_flush_interval_ms: 2_500,
        }
    }
}

/// Complete collector configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub attach: AttachConfig,
    pub tunables: DetectorTunables,
    pub delivery: DeliveryConfig,
    pub session_timeout_minutes: i64,
}

impl CollectorConfig {
    pub fn new(attach: AttachConfig) -> Self {
        Self {
            attach,
            tunables: DetectorTunables::default(),
            delivery: DeliveryConfig::default(),
            session_timeout_minutes: DEFAULT_SESSION_TIMEOUT_MINUTES,
        }
    }
}

/// Display and behavior toggles for the feedback widget, fetched per site.
/// A failed fetch falls back to these defaults and never blocks attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetConfig {
    pub enabled: bool,
    pub position: String,
    pub accent_color: String,
    pub trigger_after_confusion_events: u32,
    pub trigger_after_rage_clicks: u32,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            position: "bottom-right".to_string(),
            accent_color: "#4a5ac8".to_string(),
            trigger_after_confusion_events: 3,
            trigger_after_rage_clicks: 2,
        }
    }
}

impl WidgetConfig {
    /// Parse a config fetch response body, falling back to defaults on any
    /// parse failure.
    pub fn from_response(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|err| {
            log::debug!("widget config unparseable, using defaults: {err}");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MAX_RETRIES;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_attach_config_from_attributes() {
        let config = AttachConfig::from_attributes(&attrs(&[
            ("data-site-id", "site-1"),
            ("data-api-key", "pk_live_1"),
            ("data-api-host", "https://collect.internal"),
        ]))
        .unwrap();

        assert_eq!(config.site_id, "site-1");
        assert_eq!(config.ingest_url(), "https://collect.internal/ingest");
        assert_eq!(config.config_url(), "https://collect.internal/config/site-1");
    }

    #[test]
    fn test_missing_site_id_is_config_error() {
        let result = AttachConfig::from_attributes(&attrs(&[("data-api-key", "pk_live_1")]));
        assert!(matches!(result, Err(CollectorError::ConfigError(_))));
    }

    #[test]
    fn test_empty_api_key_is_config_error() {
        let result = AttachConfig::from_attributes(&attrs(&[
            ("data-site-id", "site-1"),
            ("data-api-key", ""),
        ]));
        assert!(matches!(result, Err(CollectorError::ConfigError(_))));
    }

    #[test]
    fn test_api_host_defaults() {
        let config = AttachConfig::from_attributes(&attrs(&[
            ("data-site-id", "site-1"),
            ("data-api-key", "pk_live_1"),
        ]))
        .unwrap();
        assert_eq!(config.api_host, default_api_host());
    }

    #[test]
    fn test_tunables_defaults_match_documented_policy() {
        let tunables = DetectorTunables::default();
        assert_eq!(tunables.dead_click_window_ms, 300);
        assert_eq!(tunables.rage_min_clicks, 3);
        assert_eq!(tunables.rage_radius_px, 50.0);
        assert_eq!(tunables.scroll_change_threshold, 5);
        assert_eq!(tunables.scroll_cooldown_ms, 5_000);
        assert_eq!(tunables.hover_map_cap, 100);
        assert_eq!(tunables.snapshot_max_attempts, 8);
    }

    #[test]
    fn test_tunables_partial_json_overrides() {
        let tunables: DetectorTunables =
            serde_json::from_str(r#"{"dead_click_window_ms": 500}"#).unwrap();
        assert_eq!(tunables.dead_click_window_ms, 500);
        // Everything else keeps its default
        assert_eq!(tunables.rage_min_clicks, 3);
    }

    #[test]
    fn test_widget_config_fallback_on_garbage() {
        let config = WidgetConfig::from_response(b"not json");
        assert!(!config.enabled);
        assert_eq!(config.position, "bottom-right");
    }

    #[test]
    fn test_widget_config_parses_partial_response() {
        let config = WidgetConfig::from_response(br#"{"enabled": true, "position": "top-left"}"#);
        assert!(config.enabled);
        assert_eq!(config.position, "top-left");
    }

    #[test]
    fn test_delivery_defaults() {
        let config = DeliveryConfig::default();
        assert_eq!(config.max_retries, MAX_RETRIES);
        assert_eq!(config.retry_interval_ms, 5_000);
        assert_eq!(config.retry_batch_size, 5);
    }
}
