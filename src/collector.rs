//! Collector context and dispatch
//!
//! One [`Collector`] is constructed per attachment; all shared state lives
//! inside it, so independent instances can coexist in tests. Interaction
//! callbacks arrive as [`InputEvent`] values through [`Collector::dispatch`];
//! fixed-interval obligations are serviced by [`Collector::tick`]; deferred
//! work runs when the host grants an idle slice via
//! [`Collector::run_idle`].

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{Clock, Compressor, KeyValueStorage, Transport};
use crate::config::{CollectorConfig, WidgetConfig};
use crate::delivery::{DebugBatch, DeliveryPipeline, IngestBatch};
use crate::detectors::path::analyze_path;
use crate::detectors::{ClickDetector, ConfusionScrollDetector, HoverTracker, RageClickDetector};
use crate::document::{DocumentView, ElementInfo};
use crate::envelope::{EnvelopeBuilder, EventType, PageContext};
use crate::error::CollectorError;
use crate::fingerprint::{format_hash, CaptureRequest, FingerprintMonitor, SnapshotPayload};
use crate::recorder::{RecorderBridge, ReplayBatch};
use crate::scheduler::{Priority, Scheduler};
use crate::scrub::{scrub, scrub_value, truncate_chars};
use crate::session::SessionStore;

/// Maximum characters of element text carried on a click envelope
const CLICK_TEXT_MAX_CHARS: usize = 100;

/// Host interaction callbacks, normalized into one event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputEvent {
    PointerDown {
        x: f64,
        y: f64,
        element: ElementInfo,
    },
    Scroll {
        #[serde(default)]
        scroll_x: f64,
        scroll_y: f64,
    },
    MouseMove {
        x: f64,
        y: f64,
        #[serde(default)]
        element: Option<ElementInfo>,
    },
    Mutation {
        #[serde(default)]
        attribute: Option<String>,
    },
    Resize {
        viewport_width: u32,
        viewport_height: u32,
    },
    OrientationChange,
    VisibilityHidden,
    Custom {
        name: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
    Identify {
        user_id: String,
        #[serde(default)]
        traits: Map<String, Value>,
    },
    ReplayFrame {
        frame_type: String,
        data: Value,
    },
    PageUnload,
}

/// Host capabilities selected once at attach time
pub struct HostCapabilities {
    pub clock: Rc<dyn Clock>,
    pub storage: Rc<dyn KeyValueStorage>,
    pub transport: Rc<dyn Transport>,
    pub compressor: Box<dyn Compressor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendMode {
    Beacon,
    Awaited,
}

/// The in-page telemetry collector
pub struct Collector {
    config: CollectorConfig,
    enabled: bool,
    unloaded: bool,
    clock: Rc<dyn Clock>,
    scheduler: Rc<RefCell<Scheduler>>,
    delivery: Rc<RefCell<DeliveryPipeline>>,
    sessions: Rc<SessionStore>,
    document: Rc<dyn DocumentView>,
    page: PageContext,
    widget: WidgetConfig,
    click: ClickDetector,
    rage: RageClickDetector,
    scroll: ConfusionScrollDetector,
    hover: HoverTracker,
    fingerprint: Rc<RefCell<FingerprintMonitor>>,
    recorder: RecorderBridge,
    debug_events: Vec<Value>,
    form_events: Vec<Value>,
    next_hover_flush_at: DateTime<Utc>,
    next_mouse_flush_at: DateTime<Utc>,
    next_recorder_flush_at: DateTime<Utc>,
    next_debug_flush_at: DateTime<Utc>,
}

impl Collector {
    /// Attach the collector to a page. An invalid identity (empty site id
    /// or api key) leaves the tracker inert with a warning; it never
    /// panics and never returns an error to the host.
    pub fn attach(
        config: CollectorConfig,
        host: HostCapabilities,
        document: Rc<dyn DocumentView>,
        page: PageContext,
    ) -> Self {
        let enabled = if config.attach.site_id.is_empty() || config.attach.api_key.is_empty() {
            log::warn!("pagepulse disabled: missing site id or api key");
            false
        } else {
            true
        };

        let now = host.clock.now();
        let scheduler = Rc::new(RefCell::new(Scheduler::new(host.clock.clone())));
        let delivery = Rc::new(RefCell::new(DeliveryPipeline::new(
            host.transport,
            host.compressor,
            &config.attach.api_key,
            config.delivery.clone(),
        )));
        let sessions = Rc::new(SessionStore::with_timeout(
            host.storage,
            host.clock.clone(),
            config.session_timeout_minutes,
        ));

        let widget = if enabled {
            match delivery.borrow().get(&config.attach.config_url()) {
                Ok(body) => WidgetConfig::from_response(&body),
                Err(err) => {
                    log::debug!("widget config fetch failed, using defaults: {err}");
                    WidgetConfig::default()
                }
            }
        } else {
            WidgetConfig::default()
        };

        let tunables = &config.tunables;
        let mut collector = Self {
            click: ClickDetector::new(tunables),
            rage: RageClickDetector::new(tunables),
            scroll: ConfusionScrollDetector::new(tunables),
            hover: HoverTracker::new(tunables),
            fingerprint: Rc::new(RefCell::new(FingerprintMonitor::new(tunables))),
            recorder: RecorderBridge::new(tunables),
            debug_events: Vec::new(),
            form_events: Vec::new(),
            next_hover_flush_at: now + Duration::milliseconds(tunables.hover_flush_interval_ms),
            next_mouse_flush_at: now + Duration::milliseconds(tunables.mouse_flush_interval_ms),
            next_recorder_flush_at: now
                + Duration::milliseconds(tunables.recorder_flush_interval_ms),
            next_debug_flush_at: now + Duration::milliseconds(tunables.debug_flush_interval_ms),
            config,
            enabled,
            unloaded: false,
            clock: host.clock,
            scheduler,
            delivery,
            sessions,
            document,
            page,
            widget,
        };

        if collector.enabled {
            collector.fingerprint.borrow_mut().prime(collector.document.as_ref(), now);
            let mut data = Map::new();
            data.insert("title".to_string(), json_opt(collector.page.title.clone()));
            data.insert(
                "referrer".to_string(),
                json_opt(collector.page.referrer.clone()),
            );
            collector.emit(EventType::PageView, None, data, SendMode::Beacon);
        }
        collector
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn widget_config(&self) -> &WidgetConfig {
        &self.widget
    }

    /// Current session id (renews the activity window)
    pub fn session_id(&self) -> String {
        self.sessions.get_or_create_session().id
    }

    pub fn visitor_id(&self) -> String {
        self.sessions.get_or_create_visitor()
    }

    /// Forcibly mint a new session, e.g. after authentication
    pub fn refresh_session(&self) -> String {
        self.sessions.refresh_session().id
    }

    /// Number of tasks waiting for an idle slice
    pub fn scheduled_tasks(&self) -> usize {
        self.scheduler.borrow().len()
    }

    /// Service the deferred-work queue for one idle slice
    pub fn run_idle(&self) -> usize {
        Scheduler::drive_idle(&self.scheduler)
    }

    /// Degraded servicing for hosts without an idle primitive
    pub fn run_deferred(&self) -> usize {
        Scheduler::drive_deferred(&self.scheduler)
    }

    /// Parse and dispatch a JSON-encoded input event (FFI and CLI surface)
    pub fn dispatch_json(&mut self, json: &str) -> Result<(), CollectorError> {
        let event: InputEvent = serde_json::from_str(json)
            .map_err(|err| CollectorError::InvalidEvent(err.to_string()))?;
        self.dispatch(event);
        Ok(())
    }

    /// Route one interaction callback. Only constant-time work happens
    /// here; anything heavier is deferred onto the scheduler.
    pub fn dispatch(&mut self, event: InputEvent) {
        if !self.enabled || self.unloaded {
            return;
        }
        let now = self.clock.now();
        match event {
            InputEvent::PointerDown { x, y, element } => {
                self.sessions.update_activity();
                let click = self.click.on_click(&element, x, y, now);
                let data = element_data(&click.element);
                self.emit(EventType::Click, Some((x, y)), data, SendMode::Beacon);

                if let Some(burst) = self.rage.on_click(x, y, now) {
                    let mut data = element_data(&element);
                    data.insert("click_count".to_string(), Value::from(burst.click_count));
                    self.emit(
                        EventType::RageClick,
                        Some((burst.x, burst.y)),
                        data,
                        SendMode::Beacon,
                    );
                }
            }
            InputEvent::Scroll { scroll_x, scroll_y } => {
                self.sessions.update_activity();
                self.page.scroll_x = scroll_x;
                self.page.scroll_y = scroll_y;
                if let Some(signal) = self.scroll.on_scroll(scroll_y, now) {
                    let mut data = Map::new();
                    data.insert("score".to_string(), Value::from(signal.score));
                    data.insert(
                        "direction_changes".to_string(),
                        Value::from(signal.direction_changes),
                    );
                    data.insert("avg_delta_px".to_string(), Value::from(signal.avg_delta_px));
                    data.insert("scroll_depth".to_string(), Value::from(self.scroll_depth()));
                    self.emit(EventType::ConfusionScroll, None, data, SendMode::Beacon);
                }
            }
            InputEvent::MouseMove { x, y, element } => {
                self.hover.on_mouse_move(x, y, element.as_ref(), now);
                if self.hover.sample_count() >= self.config.tunables.mouse_flush_count {
                    self.flush_mouse_path(now);
                }
            }
            InputEvent::Mutation { attribute } => {
                self.click.on_mutation(attribute.as_deref());
            }
            InputEvent::Resize {
                viewport_width,
                viewport_height,
            } => {
                self.page.viewport_width = viewport_width;
                self.page.viewport_height = viewport_height;
                let (width, height) = self.document.content_size();
                self.page.document_width = width;
                self.page.document_height = height;
                self.fingerprint.borrow_mut().on_resize(now);
            }
            InputEvent::OrientationChange => {
                self.fingerprint.borrow_mut().on_orientation_change(now);
            }
            InputEvent::VisibilityHidden => {
                self.emit_now(EventType::VisibilityHidden, None, Map::new());
            }
            InputEvent::Custom { name, properties } => {
                self.sessions.update_activity();
                let mut properties = Value::Object(properties);
                scrub_value(&mut properties);
                let mut data = Map::new();
                data.insert("name".to_string(), Value::String(scrub(&name)));
                data.insert("properties".to_string(), properties);
                self.emit(EventType::Custom, None, data, SendMode::Beacon);
            }
            InputEvent::Identify { user_id, traits } => {
                self.sessions.update_activity();
                let mut traits = Value::Object(traits);
                scrub_value(&mut traits);
                let mut data = Map::new();
                data.insert("user_id".to_string(), Value::String(scrub(&user_id)));
                data.insert("traits".to_string(), traits);
                self.emit(EventType::Identify, None, data, SendMode::Awaited);
            }
            InputEvent::ReplayFrame { frame_type, data } => {
                self.recorder.push_frame(&frame_type, data, now);
                if self.recorder.buffered() >= self.config.tunables.recorder_flush_count {
                    self.flush_recorder(false);
                }
            }
            InputEvent::PageUnload => self.unload(),
        }
    }

    /// Service every fixed-interval obligation. The host calls this on a
    /// coarse timer; intervals are tracked internally so the call is cheap
    /// when nothing is due.
    pub fn tick(&mut self) {
        if !self.enabled || self.unloaded {
            return;
        }
        let now = self.clock.now();

        for dead in self.click.poll(now) {
            let data = element_data(&dead.element);
            self.emit(
                EventType::DeadClick,
                Some((dead.x, dead.y)),
                data,
                SendMode::Beacon,
            );
        }

        if now >= self.next_hover_flush_at {
            self.next_hover_flush_at =
                now + Duration::milliseconds(self.config.tunables.hover_flush_interval_ms);
            for signal in self.hover.flush_hovers() {
                let mut data = Map::new();
                data.insert("selector".to_string(), Value::String(signal.selector));
                data.insert(
                    "zone".to_string(),
                    Value::String(signal.zone.as_str().to_string()),
                );
                data.insert("dwell_ms".to_string(), Value::from(signal.dwell_ms));
                self.emit(EventType::Hover, None, data, SendMode::Beacon);
            }
        }

        if now >= self.next_mouse_flush_at {
            self.flush_mouse_path(now);
        }

        self.delivery.borrow_mut().process_retries(now);

        let capture = self
            .fingerprint
            .borrow_mut()
            .poll(self.document.as_ref(), now);
        if let Some(request) = capture {
            self.schedule_snapshot_capture(request);
        }

        if now >= self.next_recorder_flush_at {
            self.next_recorder_flush_at =
                now + Duration::milliseconds(self.config.tunables.recorder_flush_interval_ms);
            self.flush_recorder(true);
        }

        if now >= self.next_debug_flush_at {
            self.next_debug_flush_at =
                now + Duration::milliseconds(self.config.tunables.debug_flush_interval_ms);
            self.flush_debug_batches();
        }
    }

    /// Queue a console/network/web-vitals debug event for the next batch
    pub fn track_debug_event(&mut self, mut event: Value) {
        if !self.enabled || self.unloaded {
            return;
        }
        scrub_value(&mut event);
        self.debug_events.push(event);
    }

    /// Queue a form-interaction event for the next batch
    pub fn track_form_event(&mut self, mut event: Value) {
        if !self.enabled || self.unloaded {
            return;
        }
        scrub_value(&mut event);
        self.form_events.push(event);
    }

    fn scroll_depth(&self) -> f64 {
        if self.page.document_height <= 0.0 {
            return 0.0;
        }
        let seen = self.page.scroll_y + f64::from(self.page.viewport_height);
        (seen / self.page.document_height).clamp(0.0, 1.0)
    }

    /// Build an envelope and schedule its delivery on the idle queue
    fn emit(
        &mut self,
        event_type: EventType,
        position: Option<(f64, f64)>,
        data: Map<String, Value>,
        mode: SendMode,
    ) {
        let envelope = self.build_envelope(event_type, position, data);
        let url = self.config.attach.ingest_url();
        let site_id = self.config.attach.site_id.clone();
        let delivery = self.delivery.clone();

        self.scheduler
            .borrow_mut()
            .schedule(Priority::Normal, move || {
                let events = [envelope];
                let batch = IngestBatch {
                    events: &events,
                    site_id: &site_id,
                };
                match mode {
                    SendMode::Beacon => {
                        delivery.borrow().send_beacon(&url, &batch);
                        Ok(())
                    }
                    SendMode::Awaited => delivery.borrow_mut().send(&url, &batch),
                }
            });
    }

    /// Build an envelope and beacon it immediately, bypassing the
    /// scheduler. Used when the page may be going away.
    fn emit_now(
        &mut self,
        event_type: EventType,
        position: Option<(f64, f64)>,
        data: Map<String, Value>,
    ) {
        let envelope = self.build_envelope(event_type, position, data);
        let events = [envelope];
        let batch = IngestBatch {
            events: &events,
            site_id: &self.config.attach.site_id,
        };
        self.delivery
            .borrow()
            .send_beacon(&self.config.attach.ingest_url(), &batch);
    }

    fn build_envelope(
        &self,
        event_type: EventType,
        position: Option<(f64, f64)>,
        data: Map<String, Value>,
    ) -> crate::envelope::EventEnvelope {
        let session = self.sessions.get_or_create_session();
        let visitor = self.sessions.get_or_create_visitor();
        EnvelopeBuilder::build(
            event_type,
            &self.page,
            &session.id,
            &visitor,
            self.clock.now(),
            position,
            data,
        )
    }

    /// Splice out the raw mouse buffer and defer path analysis plus
    /// envelope assembly onto the scheduler.
    fn flush_mouse_path(&mut self, now: DateTime<Utc>) {
        self.next_mouse_flush_at =
            now + Duration::milliseconds(self.config.tunables.mouse_flush_interval_ms);
        let samples = self.hover.drain_samples();
        if samples.len() < 2 {
            return;
        }

        let session = self.sessions.get_or_create_session();
        let visitor = self.sessions.get_or_create_visitor();
        let page = self.page.clone();
        let tunables = self.config.tunables.clone();
        let url = self.config.attach.ingest_url();
        let site_id = self.config.attach.site_id.clone();
        let delivery = self.delivery.clone();

        self.scheduler
            .borrow_mut()
            .schedule(Priority::Normal, move || {
                let metrics = analyze_path(&samples, &tunables);
                let mut data = Map::new();
                data.insert("sample_count".to_string(), Value::from(metrics.sample_count));
                data.insert(
                    "simplified_points".to_string(),
                    Value::from(metrics.simplified_points),
                );
                data.insert(
                    "total_distance_px".to_string(),
                    Value::from(metrics.total_distance_px),
                );
                data.insert(
                    "direction_changes".to_string(),
                    Value::from(metrics.direction_changes),
                );
                data.insert(
                    "avg_velocity_px_per_sec".to_string(),
                    Value::from(metrics.avg_velocity_px_per_sec),
                );
                data.insert("erratic".to_string(), Value::from(metrics.erratic));
                data.insert("duration_ms".to_string(), Value::from(metrics.duration_ms));

                let envelope = EnvelopeBuilder::build(
                    EventType::MouseMove,
                    &page,
                    &session.id,
                    &visitor,
                    now,
                    None,
                    data,
                );
                let events = [envelope];
                delivery.borrow().send_beacon(
                    &url,
                    &IngestBatch {
                        events: &events,
                        site_id: &site_id,
                    },
                );
                Ok(())
            });
    }

    /// Schedule an idle-priority snapshot capture. The capture target may
    /// not be ready; the monitor re-arms with backoff on failure.
    fn schedule_snapshot_capture(&mut self, request: CaptureRequest) {
        let document = self.document.clone();
        let monitor = self.fingerprint.clone();
        let delivery = self.delivery.clone();
        let clock = self.clock.clone();
        let url = self.config.attach.snapshots_url();
        let site_id = self.config.attach.site_id.clone();
        let page_path = self.page.path.clone();
        let origin = self.page.origin();
        let device_type = self.page.device_class();
        let width = self.page.viewport_width;
        let height = self.page.viewport_height;

        self.scheduler.borrow_mut().schedule(Priority::Idle, move || {
            match document.serialize_snapshot() {
                Some(snapshot) => {
                    monitor.borrow_mut().capture_succeeded();
                    let payload = SnapshotPayload {
                        site_id,
                        page_path,
                        device_type,
                        snapshot,
                        width,
                        height,
                        origin,
                        hash: format_hash(request.hash),
                        previous_hash: request.previous_hash.map(format_hash),
                        timestamp: clock.now(),
                    };
                    if let Err(err) = delivery.borrow_mut().send(&url, &payload) {
                        // Queued for retry by the pipeline
                        log::debug!("snapshot upload failed, queued for retry: {err}");
                    }
                    Ok(())
                }
                None => {
                    log::debug!(
                        "snapshot target not ready (attempt {})",
                        request.attempt
                    );
                    monitor.borrow_mut().capture_failed(clock.now());
                    Ok(())
                }
            }
        });
    }

    /// Flush buffered replay frames through the pipeline
    fn flush_recorder(&mut self, force: bool) {
        let Some(frames) = self.recorder.take_batch(force) else {
            return;
        };
        let session = self.sessions.get_or_create_session();
        let visitor = self.sessions.get_or_create_visitor();
        let device = EnvelopeBuilder::device_info(&self.page);
        let batch = ReplayBatch {
            site_id: &self.config.attach.site_id,
            session_id: &session.id,
            visitor_id: &visitor,
            events: frames,
            device: &device,
            page_url: &self.page.url,
            page_path: &self.page.path,
        };
        if let Err(err) = self
            .delivery
            .borrow_mut()
            .send(&self.config.attach.replay_url(), &batch)
        {
            log::debug!("replay batch send failed, queued for retry: {err}");
        }
    }

    /// Flush debug and form batches with failure visibility
    fn flush_debug_batches(&mut self) {
        let session = self.sessions.get_or_create_session();
        if !self.debug_events.is_empty() {
            let events = std::mem::take(&mut self.debug_events);
            let batch = DebugBatch {
                events: &events,
                site_id: &self.config.attach.site_id,
                session_id: &session.id,
            };
            if let Err(err) = self
                .delivery
                .borrow_mut()
                .send(&self.config.attach.debug_url(), &batch)
            {
                log::debug!("debug batch send failed, queued for retry: {err}");
            }
        }
        if !self.form_events.is_empty() {
            let events = std::mem::take(&mut self.form_events);
            let batch = DebugBatch {
                events: &events,
                site_id: &self.config.attach.site_id,
                session_id: &session.id,
            };
            if let Err(err) = self
                .delivery
                .borrow_mut()
                .send(&self.config.attach.forms_url(), &batch)
            {
                log::debug!("form batch send failed, queued for retry: {err}");
            }
        }
    }

    /// Final best-effort flush as the page is torn down: one session-end
    /// envelope plus any buffered replay frames, all via beacon. Queued
    /// retries are abandoned.
    fn unload(&mut self) {
        let session = self.sessions.get_or_create_session();
        let visitor = self.sessions.get_or_create_visitor();

        self.emit_now(EventType::SessionEnd, None, Map::new());

        if let Some(frames) = self.recorder.take_batch(true) {
            let device = EnvelopeBuilder::device_info(&self.page);
            let batch = ReplayBatch {
                site_id: &self.config.attach.site_id,
                session_id: &session.id,
                visitor_id: &visitor,
                events: frames,
                device: &device,
                page_url: &self.page.url,
                page_path: &self.page.path,
            };
            self.delivery
                .borrow()
                .send_beacon(&self.config.attach.replay_url(), &batch);
        }

        self.delivery.borrow_mut().abandon_retries();
        self.unloaded = true;
    }
}

fn json_opt(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

/// Element descriptor fields shared by click, dead-click, and rage-click
/// envelopes. Inner text is scrubbed and truncated before it leaves.
fn element_data(element: &ElementInfo) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert(
        "selector".to_string(),
        Value::String(element.selector()),
    );
    data.insert("tag".to_string(), Value::String(element.tag.clone()));
    data.insert(
        "element_id".to_string(),
        json_opt(element.id.clone()),
    );
    let classes: Vec<Value> = element
        .classes
        .iter()
        .take(2)
        .map(|c| Value::String(c.clone()))
        .collect();
    if !classes.is_empty() {
        data.insert("classes".to_string(), Value::Array(classes));
    }
    data.insert(
        "text".to_string(),
        json_opt(
            element
                .text
                .as_deref()
                .map(|t| truncate_chars(&scrub(t), CLICK_TEXT_MAX_CHARS)),
        ),
    );
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ManualClock, MemoryStorage, MemoryTransport, NoCompressor};
    use crate::config::AttachConfig;
    use crate::document::{NodeDescriptor, StaticDocument};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    struct Harness {
        collector: Collector,
        clock: Rc<ManualClock>,
        transport: Rc<MemoryTransport>,
        document: Rc<StaticDocument>,
    }

    fn attach_config() -> AttachConfig {
        AttachConfig {
            site_id: "site-1".to_string(),
            api_key: "pk_test_1".to_string(),
            api_host: "https://collect.test".to_string(),
        }
    }

    fn page() -> PageContext {
        PageContext {
            url: "https://docs.example.com/guides/setup".to_string(),
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
            scroll_y: 0.0,
        }
    }

    fn harness() -> Harness {
        harness_with(attach_config())
    }

    fn harness_with(attach: AttachConfig) -> Harness {
        let clock = Rc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let transport = Rc::new(MemoryTransport::new());
        let document = StaticDocument::new(
            1280.0,
            4000.0,
            vec![
                NodeDescriptor::with_id("header", "top"),
                NodeDescriptor::new("main"),
                NodeDescriptor::new("p"),
                NodeDescriptor::new("footer"),
            ],
        );
        document.set_snapshot(Some("<body>…</body>".to_string()));

        let collector = Collector::attach(
            CollectorConfig::new(attach),
            HostCapabilities {
                clock: clock.clone(),
                storage: Rc::new(MemoryStorage::new()),
                transport: transport.clone(),
                compressor: Box::new(NoCompressor),
            },
            document.clone(),
            page(),
        );

        Harness {
            collector,
            clock,
            transport,
            document,
        }
    }

    impl Harness {
        /// Run timers and the idle queue until quiescent, then return the
        /// envelopes sent to the ingest endpoint since the last drain.
        fn settle(&mut self) -> Vec<Value> {
            self.collector.tick();
            while self.collector.run_idle() > 0 {}
            self.ingest_events()
        }

        fn ingest_events(&self) -> Vec<Value> {
            self.transport
                .drain()
                .into_iter()
                .filter(|r| r.url.ends_with("/ingest"))
                .flat_map(|r| {
                    let body: Value = serde_json::from_slice(&r.body).unwrap();
                    body["events"].as_array().cloned().unwrap_or_default()
                })
                .collect()
        }

        fn plain_div() -> ElementInfo {
            ElementInfo::new("div")
        }
    }

    #[test]
    fn test_attach_emits_page_view() {
        let mut harness = harness();
        let events = harness.settle();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "page_view");
        assert_eq!(events[0]["page_path"], "/guides/setup");
        assert_eq!(events[0]["data"]["title"], "Setup");
    }

    #[test]
    fn test_missing_api_key_leaves_tracker_inert() {
        let mut harness = harness_with(AttachConfig {
            api_key: String::new(),
            ..attach_config()
        });
        assert!(!harness.collector.is_enabled());

        harness
            .collector
            .dispatch(InputEvent::PointerDown {
                x: 10.0,
                y: 10.0,
                element: Harness::plain_div(),
            });
        assert!(harness.settle().is_empty());
        assert_eq!(harness.transport.request_count(), 0);
    }

    #[test]
    fn test_click_then_dead_click_within_400ms() {
        let mut harness = harness();
        harness.settle(); // discard page_view and initial snapshot

        harness.collector.dispatch(InputEvent::PointerDown {
            x: 100.0,
            y: 200.0,
            element: Harness::plain_div(),
        });
        let events = harness.settle();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "click");
        assert_eq!(events[0]["coordinates"]["x"], 100.0);
        assert_eq!(events[0]["coordinates"]["x_relative"], 100.0 / 1280.0);

        // No qualifying mutation within the window
        harness.clock.advance_ms(350);
        let events = harness.settle();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "dead_click");
        assert_eq!(events[0]["data"]["selector"], "div");
    }

    #[test]
    fn test_mutation_prevents_dead_click() {
        let mut harness = harness();
        harness.settle();

        harness.collector.dispatch(InputEvent::PointerDown {
            x: 100.0,
            y: 200.0,
            element: Harness::plain_div(),
        });
        harness.collector.dispatch(InputEvent::Mutation {
            attribute: Some("class".to_string()),
        });
        harness.clock.advance_ms(350);

        let events = harness.settle();
        // Only the click itself, no dead_click
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "click");
    }

    #[test]
    fn test_anchor_click_never_dead() {
        let mut harness = harness();
        harness.settle();

        let mut anchor = ElementInfo::new("a");
        anchor.href = Some("/pricing".to_string());
        harness.collector.dispatch(InputEvent::PointerDown {
            x: 10.0,
            y: 10.0,
            element: anchor,
        });
        harness.clock.advance_ms(350);

        let events = harness.settle();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "click");
    }

    #[test]
    fn test_rage_click_burst_emits_once() {
        let mut harness = harness();
        harness.settle();

        for (i, (x, y)) in [(100.0, 100.0), (105.0, 98.0), (98.0, 103.0)]
            .into_iter()
            .enumerate()
        {
            if i > 0 {
                harness.clock.advance_ms(400);
            }
            harness.collector.dispatch(InputEvent::PointerDown {
                x,
                y,
                element: Harness::plain_div(),
            });
        }

        let events = harness.settle();
        let rage: Vec<&Value> = events.iter().filter(|e| e["type"] == "rage_click").collect();
        assert_eq!(rage.len(), 1);
        assert_eq!(rage[0]["data"]["click_count"], 3);
        assert_eq!(rage[0]["coordinates"]["x"], 98.0);
    }

    #[test]
    fn test_click_text_is_scrubbed_and_truncated() {
        let mut harness = harness();
        harness.settle();

        let mut element = ElementInfo::new("button");
        element.text = Some(format!("email me at jane@example.com {}", "x".repeat(200)));
        harness.collector.dispatch(InputEvent::PointerDown {
            x: 10.0,
            y: 10.0,
            element,
        });

        let events = harness.settle();
        let text = events[0]["data"]["text"].as_str().unwrap();
        assert!(text.contains("[EMAIL]"));
        assert!(!text.contains("jane@example.com"));
        assert!(text.chars().count() <= 100);
    }

    #[test]
    fn test_confusion_scroll_end_to_end() {
        let mut harness = harness();
        harness.settle();

        let mut y = 1_000.0;
        harness.collector.dispatch(InputEvent::Scroll {
            scroll_x: 0.0,
            scroll_y: y,
        });
        for i in 0..8 {
            harness.clock.advance_ms(100);
            y += if i % 2 == 0 { 150.0 } else { -150.0 };
            harness.collector.dispatch(InputEvent::Scroll {
                scroll_x: 0.0,
                scroll_y: y,
            });
        }

        let events = harness.settle();
        let confusion: Vec<&Value> = events
            .iter()
            .filter(|e| e["type"] == "confusion_scroll")
            .collect();
        assert_eq!(confusion.len(), 1);
        assert_eq!(confusion[0]["data"]["direction_changes"], 5);
        let score = confusion[0]["data"]["score"].as_f64().unwrap();
        assert!(score > 0.0 && score <= 1.0);
    }

    #[test]
    fn test_hover_flush_after_interval() {
        let mut harness = harness();
        harness.settle();

        let mut button = ElementInfo::new("button");
        button.id = Some("cta".to_string());
        for i in 0..21 {
            if i > 0 {
                harness.clock.advance_ms(100);
            }
            harness.collector.dispatch(InputEvent::MouseMove {
                x: 10.0,
                y: 10.0,
                element: Some(button.clone()),
            });
        }

        // Not due yet
        assert!(harness.settle().iter().all(|e| e["type"] != "hover"));

        harness.clock.advance_ms(30_000);
        let events = harness.settle();
        let hovers: Vec<&Value> = events.iter().filter(|e| e["type"] == "hover").collect();
        assert_eq!(hovers.len(), 1);
        assert_eq!(hovers[0]["data"]["selector"], "button#cta");
        assert_eq!(hovers[0]["data"]["zone"], "interactive");
        assert_eq!(hovers[0]["data"]["dwell_ms"], 2_000);
    }

    #[test]
    fn test_mouse_path_flushes_at_buffer_threshold() {
        let mut harness = harness();
        harness.settle();

        for i in 0..50 {
            harness.collector.dispatch(InputEvent::MouseMove {
                x: i as f64 * 10.0,
                y: 0.0,
                element: None,
            });
            harness.clock.advance_ms(60);
        }

        let events = harness.settle();
        let moves: Vec<&Value> = events.iter().filter(|e| e["type"] == "mouse_move").collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0]["data"]["sample_count"], 50);
        assert_eq!(moves[0]["data"]["simplified_points"], 2);
        assert_eq!(moves[0]["data"]["direction_changes"], 0);
    }

    #[test]
    fn test_initial_snapshot_captured_on_attach() {
        let mut harness = harness();
        harness.collector.tick();
        while harness.collector.run_idle() > 0 {}

        let snapshots = harness.transport.requests_to("https://collect.test/snapshots");
        assert_eq!(snapshots.len(), 1);
        let body: Value = serde_json::from_slice(&snapshots[0].body).unwrap();
        assert_eq!(body["site_id"], "site-1");
        assert_eq!(body["device_type"], "desktop");
        assert!(body.get("previous_hash").is_none());
    }

    #[test]
    fn test_resize_triggers_fingerprint_recheck_and_snapshot() {
        let mut harness = harness();
        harness.collector.tick();
        while harness.collector.run_idle() > 0 {}
        harness.transport.drain();

        // The resize changes content dimensions, so the fingerprint differs
        harness.document.set_content_size(800.0, 4000.0);
        harness.collector.dispatch(InputEvent::Resize {
            viewport_width: 800,
            viewport_height: 600,
        });

        // Inside the debounce window nothing is captured
        harness.collector.tick();
        while harness.collector.run_idle() > 0 {}
        assert!(harness
            .transport
            .requests_to("https://collect.test/snapshots")
            .is_empty());

        harness.clock.advance_ms(1_000);
        harness.collector.tick();
        while harness.collector.run_idle() > 0 {}

        let snapshots = harness.transport.requests_to("https://collect.test/snapshots");
        assert_eq!(snapshots.len(), 1);
        let body: Value = serde_json::from_slice(&snapshots[0].body).unwrap();
        assert!(body["previous_hash"].is_string());
        assert_ne!(body["hash"], body["previous_hash"]);
        assert_eq!(body["device_type"], "tablet");
    }

    #[test]
    fn test_snapshot_retries_until_document_ready() {
        let mut harness = harness();
        harness.document.set_snapshot(None);

        harness.collector.tick();
        while harness.collector.run_idle() > 0 {}
        assert!(harness
            .transport
            .requests_to("https://collect.test/snapshots")
            .is_empty());

        // Document becomes serializable; the backoff retry picks it up
        harness.document.set_snapshot(Some("<body>ready</body>".to_string()));
        harness.clock.advance_ms(500);
        harness.collector.tick();
        while harness.collector.run_idle() > 0 {}

        assert_eq!(
            harness
                .transport
                .requests_to("https://collect.test/snapshots")
                .len(),
            1
        );
    }

    #[test]
    fn test_custom_event_properties_scrubbed() {
        let mut harness = harness();
        harness.settle();

        let mut properties = Map::new();
        properties.insert(
            "note".to_string(),
            Value::String("card 4111 1111 1111 1111".to_string()),
        );
        harness.collector.dispatch(InputEvent::Custom {
            name: "checkout_started".to_string(),
            properties,
        });

        let events = harness.settle();
        assert_eq!(events[0]["type"], "custom");
        assert_eq!(events[0]["data"]["name"], "checkout_started");
        assert_eq!(events[0]["data"]["properties"]["note"], "card [CARD]");
    }

    #[test]
    fn test_session_continuity_across_events() {
        let mut harness = harness();
        harness.settle();

        harness.collector.dispatch(InputEvent::PointerDown {
            x: 1.0,
            y: 1.0,
            element: Harness::plain_div(),
        });
        harness.clock.advance_ms(10 * 60 * 1000);
        harness.collector.dispatch(InputEvent::PointerDown {
            x: 2.0,
            y: 2.0,
            element: Harness::plain_div(),
        });

        let events = harness.settle();
        let clicks: Vec<&Value> = events.iter().filter(|e| e["type"] == "click").collect();
        assert_eq!(clicks.len(), 2);
        assert_eq!(clicks[0]["session_id"], clicks[1]["session_id"]);
        assert_ne!(clicks[0]["event_id"], clicks[1]["event_id"]);
    }

    #[test]
    fn test_refresh_session_mints_new_session() {
        let harness = harness();
        let first = harness.collector.session_id();
        let refreshed = harness.collector.refresh_session();
        assert_ne!(first, refreshed);
        assert_eq!(harness.collector.session_id(), refreshed);
        assert!(!harness.collector.visitor_id().is_empty());
    }

    #[test]
    fn test_unload_flushes_session_end_and_replay_frames() {
        let mut harness = harness();
        harness.settle();

        harness.collector.dispatch(InputEvent::ReplayFrame {
            frame_type: "dom".to_string(),
            data: serde_json::json!({ "seq": 1 }),
        });
        harness.collector.dispatch(InputEvent::PageUnload);

        // Both go out as immediate beacons, no idle servicing needed
        let requests = harness.transport.drain();
        let ingest: Vec<_> = requests.iter().filter(|r| r.url.ends_with("/ingest")).collect();
        let replay: Vec<_> = requests.iter().filter(|r| r.url.ends_with("/replay")).collect();

        let body: Value = serde_json::from_slice(&ingest[0].body).unwrap();
        assert_eq!(body["events"][0]["type"], "session_end");

        assert_eq!(replay.len(), 1);
        let body: Value = serde_json::from_slice(&replay[0].body).unwrap();
        assert_eq!(body["events"][0]["kind"], "dom");
        assert_eq!(body["site_id"], "site-1");

        // After unload the collector is inert
        harness.collector.dispatch(InputEvent::PointerDown {
            x: 1.0,
            y: 1.0,
            element: Harness::plain_div(),
        });
        assert!(harness.settle().is_empty());
    }

    #[test]
    fn test_visibility_hidden_beacons_immediately() {
        let mut harness = harness();
        harness.settle();

        harness.collector.dispatch(InputEvent::VisibilityHidden);
        // No run_idle: the beacon must already be out
        let events = harness.ingest_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "visibility_hidden");
    }

    #[test]
    fn test_debug_events_batched_on_interval() {
        let mut harness = harness();
        harness.settle();

        harness
            .collector
            .track_debug_event(serde_json::json!({ "level": "error", "message": "boom" }));
        harness.collector.tick();
        assert!(harness
            .transport
            .requests_to("https://collect.test/debug")
            .is_empty());

        harness.clock.advance_ms(2_500);
        harness.collector.tick();
        let debug = harness.transport.requests_to("https://collect.test/debug");
        assert_eq!(debug.len(), 1);
        let body: Value = serde_json::from_slice(&debug[0].body).unwrap();
        assert_eq!(body["events"][0]["message"], "boom");
        assert_eq!(body["site_id"], "site-1");
        assert!(body["session_id"].is_string());
    }

    #[test]
    fn test_widget_config_fetch_failure_falls_back() {
        let clock = Rc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let transport = Rc::new(MemoryTransport::new());
        transport.fail_next(1); // config GET fails
        let document = StaticDocument::new(1280.0, 4000.0, vec![NodeDescriptor::new("main")]);

        let collector = Collector::attach(
            CollectorConfig::new(attach_config()),
            HostCapabilities {
                clock,
                storage: Rc::new(MemoryStorage::new()),
                transport,
                compressor: Box::new(NoCompressor),
            },
            document,
            page(),
        );

        assert!(collector.is_enabled());
        assert_eq!(collector.widget_config().position, "bottom-right");
    }

    #[test]
    fn test_failed_ingest_send_retries_on_timer() {
        let mut harness = harness();
        harness.settle();

        // Identify uses the awaited path; fail its first attempt
        harness.transport.fail_next(1);
        harness.collector.dispatch(InputEvent::Identify {
            user_id: "user-1".to_string(),
            traits: Map::new(),
        });
        assert!(harness.settle().is_empty());

        // Retry processor resends after the fixed 5s delay
        harness.clock.advance_ms(5_000);
        harness.collector.tick();
        let events = harness.ingest_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "identify");
    }
}
