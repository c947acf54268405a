//! Event envelopes
//!
//! Every raw signal the detectors produce is normalized into one wire shape
//! before delivery: a typed envelope with device context, page context, and
//! (for coordinate-bearing events) absolute, viewport, and relative
//! coordinates. Relative coordinates are the normalization key that lets the
//! backend re-project interactions onto arbitrary viewport sizes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Event types carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Click,
    DeadClick,
    RageClick,
    PageView,
    MouseMove,
    Hover,
    ConfusionScroll,
    Custom,
    Identify,
    VisibilityHidden,
    SessionEnd,
}

/// Device class derived from viewport width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

/// Viewport width below which a device is classified mobile
pub const MOBILE_MAX_WIDTH: u32 = 768;
/// Viewport width below which a device is classified tablet
pub const TABLET_MAX_WIDTH: u32 = 1024;

impl DeviceClass {
    pub fn from_viewport_width(width: u32) -> Self {
        if width < MOBILE_MAX_WIDTH {
            DeviceClass::Mobile
        } else if width < TABLET_MAX_WIDTH {
            DeviceClass::Tablet
        } else {
            DeviceClass::Desktop
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
        }
    }
}

/// Device descriptor attached to every envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Browser family from user-agent heuristics
    pub browser: String,
    pub device_class: DeviceClass,
    pub screen_width: u32,
    pub screen_height: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
    pub language: String,
}

/// Live page state, updated as the host reports scrolls and resizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    pub user_agent: String,
    #[serde(default = "default_language")]
    pub language: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub document_width: f64,
    pub document_height: f64,
    #[serde(default)]
    pub scroll_x: f64,
    #[serde(default)]
    pub scroll_y: f64,
}

fn default_language() -> String {
    "en-US".to_string()
}

impl PageContext {
    /// Origin portion of the page URL (scheme + host)
    pub fn origin(&self) -> String {
        match self.url.find("://").map(|i| i + 3) {
            Some(after_scheme) => match self.url[after_scheme..].find('/') {
                Some(slash) => self.url[..after_scheme + slash].to_string(),
                None => self.url.clone(),
            },
            None => self.url.clone(),
        }
    }

    pub fn device_class(&self) -> DeviceClass {
        DeviceClass::from_viewport_width(self.viewport_width)
    }
}

/// Absolute, viewport, and normalized coordinates for a point on the page
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Coordinates {
    /// Absolute page coordinates
    pub x: f64,
    pub y: f64,
    /// Coordinates relative to the current viewport
    pub viewport_x: f64,
    pub viewport_y: f64,
    /// Page coordinates divided by document dimensions, clamped to [0, 1]
    pub x_relative: f64,
    pub y_relative: f64,
}

/// Normalize one axis to [0, 1] against a document dimension
pub fn relative_coordinate(position: f64, dimension: f64) -> f64 {
    if dimension <= 0.0 {
        return 0.0;
    }
    (position / dimension).clamp(0.0, 1.0)
}

/// The single wire unit for all collected signals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub event_id: String,
    pub session_id: String,
    pub visitor_id: String,
    pub timestamp: DateTime<Utc>,
    pub page_url: String,
    pub page_path: String,
    pub device: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    /// Event-specific extras; null entries are pruned before serialization
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

/// Builds envelopes from raw signals, recomputing document dimensions per
/// call since layout can change between captures.
pub struct EnvelopeBuilder;

impl EnvelopeBuilder {
    /// Derive the device descriptor from the current page state
    pub fn device_info(page: &PageContext) -> DeviceInfo {
        DeviceInfo {
            browser: browser_family(&page.user_agent).to_string(),
            device_class: page.device_class(),
            screen_width: page.screen_width,
            screen_height: page.screen_height,
            viewport_width: page.viewport_width,
            viewport_height: page.viewport_height,
            user_agent: page.user_agent.clone(),
            language: page.language.clone(),
        }
    }

    /// Compute the coordinate triple for an absolute page position
    pub fn coordinates(page: &PageContext, x: f64, y: f64) -> Coordinates {
        Coordinates {
            x,
            y,
            viewport_x: x - page.scroll_x,
            viewport_y: y - page.scroll_y,
            x_relative: relative_coordinate(x, page.document_width),
            y_relative: relative_coordinate(y, page.document_height),
        }
    }

    /// Assemble a complete envelope. Null entries in `data` are pruned.
    pub fn build(
        event_type: EventType,
        page: &PageContext,
        session_id: &str,
        visitor_id: &str,
        timestamp: DateTime<Utc>,
        position: Option<(f64, f64)>,
        mut data: Map<String, Value>,
    ) -> EventEnvelope {
        data.retain(|_, value| !value.is_null());
        EventEnvelope {
            event_type,
            event_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            visitor_id: visitor_id.to_string(),
            timestamp,
            page_url: page.url.clone(),
            page_path: page.path.clone(),
            device: Self::device_info(page),
            coordinates: position.map(|(x, y)| Self::coordinates(page, x, y)),
            data,
        }
    }
}

/// Coarse browser family from the user-agent string. Order matters: every
/// Chromium UA also claims Safari, and Edge/Opera also claim Chrome.
pub fn browser_family(user_agent: &str) -> &'static str {
    if user_agent.contains("Edg/") {
        "edge"
    } else if user_agent.contains("OPR/") || user_agent.contains("Opera") {
        "opera"
    } else if user_agent.contains("Firefox/") {
        "firefox"
    } else if user_agent.contains("Chrome/") {
        "chrome"
    } else if user_agent.contains("Safari/") {
        "safari"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn test_page() -> PageContext {
        PageContext {
            url: "https://docs.example.com/guides/setup?step=2".to_string(),
            path: "/guides/setup".to_string(),
            title: Some("Setup".to_string()),
            referrer: None,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Chrome/120.0 Safari/537.36".to_string(),
            language: "en-US".to_string(),
            screen_width: 1920,
            screen_height: 1080,
            viewport_width: 1280,
            viewport_height: 720,
            document_width: 1280.0,
            document_height: 4000.0,
            scroll_x: 0.0,
            scroll_y: 300.0,
        }
    }

    #[test]
    fn test_relative_coordinate_clamps() {
        assert_eq!(relative_coordinate(640.0, 1280.0), 0.5);
        assert_eq!(relative_coordinate(-5.0, 1280.0), 0.0);
        assert_eq!(relative_coordinate(2000.0, 1280.0), 1.0);
        assert_eq!(relative_coordinate(100.0, 0.0), 0.0);
    }

    #[test]
    fn test_relative_coordinates_reproject_within_bounds() {
        // Round-tripping a relative coordinate onto a different width must
        // stay within [0, w'].
        let widths = [320.0, 768.0, 1280.0, 3840.0];
        let positions = [0.0, 17.0, 640.0, 1279.0, 5000.0];
        for &w in &widths {
            for &x in &positions {
                let relative = relative_coordinate(x, 1280.0);
                let projected = relative * w;
                assert!(projected >= 0.0 && projected <= w);
            }
        }
    }

    #[test]
    fn test_device_class_breakpoints() {
        assert_eq!(DeviceClass::from_viewport_width(375), DeviceClass::Mobile);
        assert_eq!(DeviceClass::from_viewport_width(767), DeviceClass::Mobile);
        assert_eq!(DeviceClass::from_viewport_width(768), DeviceClass::Tablet);
        assert_eq!(DeviceClass::from_viewport_width(1023), DeviceClass::Tablet);
        assert_eq!(DeviceClass::from_viewport_width(1024), DeviceClass::Desktop);
    }

    #[test]
    fn test_browser_family_ordering() {
        assert_eq!(
            browser_family("Mozilla/5.0 Chrome/120.0 Safari/537.36 Edg/120.0"),
            "edge"
        );
        assert_eq!(browser_family("Mozilla/5.0 Chrome/120.0 Safari/537.36"), "chrome");
        assert_eq!(browser_family("Mozilla/5.0 Version/17.0 Safari/605.1"), "safari");
        assert_eq!(browser_family("Mozilla/5.0 Gecko/20100101 Firefox/121.0"), "firefox");
        assert_eq!(browser_family("curl/8.0"), "unknown");
    }

    #[test]
    fn test_envelope_viewport_coordinates_subtract_scroll() {
        let page = test_page();
        let coords = EnvelopeBuilder::coordinates(&page, 640.0, 900.0);
        assert_eq!(coords.viewport_x, 640.0);
        assert_eq!(coords.viewport_y, 600.0);
        assert_eq!(coords.x_relative, 0.5);
        assert_eq!(coords.y_relative, 0.225);
    }

    #[test]
    fn test_envelope_prunes_null_data() {
        let page = test_page();
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut data = Map::new();
        data.insert("tag".to_string(), Value::String("div".to_string()));
        data.insert("text".to_string(), Value::Null);

        let envelope = EnvelopeBuilder::build(
            EventType::Click,
            &page,
            "sess-1",
            "vis-1",
            timestamp,
            Some((100.0, 200.0)),
            data,
        );

        assert!(envelope.data.contains_key("tag"));
        assert!(!envelope.data.contains_key("text"));
        assert!(envelope.coordinates.is_some());
    }

    #[test]
    fn test_envelope_serializes_snake_case_type() {
        let page = test_page();
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let envelope = EnvelopeBuilder::build(
            EventType::DeadClick,
            &page,
            "sess-1",
            "vis-1",
            timestamp,
            None,
            Map::new(),
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "dead_click");
        assert_eq!(json["page_path"], "/guides/setup");
        assert_eq!(json["device"]["browser"], "chrome");
        assert_eq!(json["device"]["device_class"], "desktop");
        assert!(json.get("coordinates").is_none());
    }

    #[test]
    fn test_page_origin() {
        let page = test_page();
        assert_eq!(page.origin(), "https://docs.example.com");
    }
}
