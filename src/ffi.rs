//! FFI bindings for Pagepulse
//!
//! C-compatible functions for embedding the collector from other runtimes.
//! The embedding host owns all network IO: the collector records outbound
//! requests into a queue the host drains with
//! `pagepulse_collector_poll_request`. Bodies are plain JSON (the FFI build
//! selects no compression so the host can apply its own). All functions use
//! null-terminated C strings; returned strings must be freed with
//! `pagepulse_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::rc::Rc;

use serde::Serialize;

use crate::capability::{MemoryStorage, MemoryTransport, NoCompressor, SystemClock, Transport};
use crate::collector::{Collector, HostCapabilities};
use crate::config::{AttachConfig, CollectorConfig, DetectorTunables};
use crate::document::{NodeDescriptor, StaticDocument};
use crate::envelope::PageContext;

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message
fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Clear the last error message
fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Opaque handle wrapping a collector and the host-drained request queue
pub struct CollectorHandle {
    collector: Collector,
    transport: Rc<MemoryTransport>,
    document: Rc<StaticDocument>,
}

#[derive(serde::Deserialize)]
struct FfiConfig {
    site_id: String,
    api_key: String,
    #[serde(default)]
    api_host: Option<String>,
    #[serde(default)]
    tunables: Option<DetectorTunables>,
    page: PageContext,
}

#[derive(Serialize)]
struct OutboundRequest<'a> {
    method: &'a str,
    url: &'a str,
    headers: &'a [(String, String)],
    body: String,
}

/// Create a collector from a JSON configuration:
/// `{"site_id", "api_key", "api_host"?, "tunables"?, "page": {...}}`.
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string.
/// - Returns NULL on error; call `pagepulse_last_error` for the message.
/// - The handle must be freed with `pagepulse_collector_free`.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_collector_new(
    config_json: *const c_char,
) -> *mut CollectorHandle {
    clear_last_error();

    let raw = match cstr_to_string(config_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid config string pointer");
            return ptr::null_mut();
        }
    };
    let ffi_config: FfiConfig = match serde_json::from_str(&raw) {
        Ok(config) => config,
        Err(err) => {
            set_last_error(&format!("Invalid config JSON: {err}"));
            return ptr::null_mut();
        }
    };

    let mut config = CollectorConfig::new(AttachConfig {
        site_id: ffi_config.site_id,
        api_key: ffi_config.api_key,
        api_host: ffi_config
            .api_host
            .unwrap_or_else(|| "https://in.pagepulse.dev".to_string()),
    });
    if let Some(tunables) = ffi_config.tunables {
        config.tunables = tunables;
    }

    let transport = Rc::new(MemoryTransport::new());
    let document = StaticDocument::new(
        ffi_config.page.document_width,
        ffi_config.page.document_height,
        Vec::new(),
    );
    let collector = Collector::attach(
        config,
        HostCapabilities {
            clock: Rc::new(SystemClock),
            storage: Rc::new(MemoryStorage::new()),
            transport: transport.clone(),
            compressor: Box::new(NoCompressor),
        },
        document.clone(),
        ffi_config.page,
    );

    Box::into_raw(Box::new(CollectorHandle {
        collector,
        transport,
        document,
    }))
}

/// Update the document view used for fingerprinting and snapshots:
/// `{"width", "height", "nodes": [{"tag","id"?,"classes"?}], "snapshot"?}`.
///
/// # Safety
/// - `handle` must be a live handle from `pagepulse_collector_new`.
/// - `document_json` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_collector_set_document(
    handle: *mut CollectorHandle,
    document_json: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(handle) = handle.as_mut() else {
        set_last_error("Null collector handle");
        return -1;
    };
    let raw = match cstr_to_string(document_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid document string pointer");
            return -1;
        }
    };

    #[derive(serde::Deserialize)]
    struct FfiDocument {
        width: f64,
        height: f64,
        #[serde(default)]
        nodes: Vec<NodeDescriptor>,
        #[serde(default)]
        snapshot: Option<String>,
    }

    match serde_json::from_str::<FfiDocument>(&raw) {
        Ok(doc) => {
            handle.document.set_content_size(doc.width, doc.height);
            handle.document.set_nodes(doc.nodes);
            handle.document.set_snapshot(doc.snapshot);
            0
        }
        Err(err) => {
            set_last_error(&format!("Invalid document JSON: {err}"));
            -1
        }
    }
}

/// Dispatch a JSON-encoded input event (see `InputEvent`).
///
/// # Safety
/// - `handle` must be a live handle from `pagepulse_collector_new`.
/// - `event_json` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_collector_dispatch(
    handle: *mut CollectorHandle,
    event_json: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(handle) = handle.as_mut() else {
        set_last_error("Null collector handle");
        return -1;
    };
    let raw = match cstr_to_string(event_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid event string pointer");
            return -1;
        }
    };
    match handle.collector.dispatch_json(&raw) {
        Ok(()) => 0,
        Err(err) => {
            set_last_error(&err.to_string());
            -1
        }
    }
}

/// Service fixed-interval obligations (timers, retries, captures).
///
/// # Safety
/// - `handle` must be a live handle from `pagepulse_collector_new`.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_collector_tick(handle: *mut CollectorHandle) {
    if let Some(handle) = handle.as_mut() {
        handle.collector.tick();
    }
}

/// Service the deferred-work queue for one idle slice. Returns the number
/// of tasks run, or -1 on a null handle.
///
/// # Safety
/// - `handle` must be a live handle from `pagepulse_collector_new`.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_collector_run_idle(handle: *mut CollectorHandle) -> i32 {
    match handle.as_mut() {
        Some(handle) => handle.collector.run_idle() as i32,
        None => -1,
    }
}

/// Pop the next outbound request as JSON
/// (`{"method","url","headers","body"}`), or NULL when the queue is empty.
///
/// # Safety
/// - `handle` must be a live handle from `pagepulse_collector_new`.
/// - The returned string must be freed with `pagepulse_free_string`.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_collector_poll_request(
    handle: *mut CollectorHandle,
) -> *mut c_char {
    clear_last_error();
    let Some(handle) = handle.as_mut() else {
        set_last_error("Null collector handle");
        return ptr::null_mut();
    };

    let mut requests = handle.transport.drain();
    if requests.is_empty() {
        return ptr::null_mut();
    }
    // Re-queue all but the first so the host drains one at a time
    let first = requests.remove(0);
    for request in requests {
        handle.transport.send_beacon(request);
    }

    let method = match first.method {
        crate::capability::HttpMethod::Get => "GET",
        crate::capability::HttpMethod::Post => "POST",
    };
    let outbound = OutboundRequest {
        method,
        url: &first.url,
        headers: &first.headers,
        body: String::from_utf8_lossy(&first.body).into_owned(),
    };
    match serde_json::to_string(&outbound) {
        Ok(json) => string_to_cstr(&json),
        Err(err) => {
            set_last_error(&format!("Failed to encode request: {err}"));
            ptr::null_mut()
        }
    }
}

/// Get the current session id.
///
/// # Safety
/// - `handle` must be a live handle from `pagepulse_collector_new`.
/// - The returned string must be freed with `pagepulse_free_string`.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_collector_session_id(
    handle: *mut CollectorHandle,
) -> *mut c_char {
    match handle.as_mut() {
        Some(handle) => string_to_cstr(&handle.collector.session_id()),
        None => ptr::null_mut(),
    }
}

/// Free a collector handle.
///
/// # Safety
/// - `handle` must be a handle from `pagepulse_collector_new`, not yet
///   freed. NULL is a no-op.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_collector_free(handle: *mut CollectorHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Free a string returned by this library.
///
/// # Safety
/// - `ptr` must be a string returned by a `pagepulse_*` function, not yet
///   freed. NULL is a no-op.
#[no_mangle]
pub unsafe extern "C" fn pagepulse_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// Get the last error message, or NULL if none. The returned pointer is
/// owned by the library and valid until the next FFI call on this thread.
#[no_mangle]
pub extern "C" fn pagepulse_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}
