//! Visitor identity and session lifecycle
//!
//! A visitor id is minted once and persisted indefinitely; a session id is
//! renewed on every tracked interaction and replaced after 30 minutes of
//! inactivity. When durable storage is unavailable (quota, private mode)
//! the store degrades to in-memory ids for the lifetime of the page load.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::{Clock, KeyValueStorage};

/// Inactivity timeout after which a session is replaced
pub const DEFAULT_SESSION_TIMEOUT_MINUTES: i64 = 30;

const SESSION_KEY: &str = "pagepulse_session";
const VISITOR_KEY: &str = "pagepulse_visitor";

/// Persisted session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Store for the visitor id and the renewable session record
pub struct SessionStore {
    storage: Rc<dyn KeyValueStorage>,
    clock: Rc<dyn Clock>,
    timeout_minutes: i64,
    /// In-memory state used once durable storage has failed
    memory_session: RefCell<Option<SessionRecord>>,
    memory_visitor: RefCell<Option<String>>,
    degraded: Cell<bool>,
}

impl SessionStore {
    pub fn new(storage: Rc<dyn KeyValueStorage>, clock: Rc<dyn Clock>) -> Self {
        Self::with_timeout(storage, clock, DEFAULT_SESSION_TIMEOUT_MINUTES)
    }

    pub fn with_timeout(
        storage: Rc<dyn KeyValueStorage>,
        clock: Rc<dyn Clock>,
        timeout_minutes: i64,
    ) -> Self {
        Self {
            storage,
            clock,
            timeout_minutes,
            memory_session: RefCell::new(None),
            memory_visitor: RefCell::new(None),
            degraded: Cell::new(false),
        }
    }

    /// Whether the store has fallen back to in-memory ids
    pub fn is_degraded(&self) -> bool {
        self.degraded.get()
    }

    /// Return the current session, renewing its activity window, or mint a
    /// new one if the record is missing or expired.
    pub fn get_or_create_session(&self) -> SessionRecord {
        let now = self.clock.now();
        let existing = self.read_session();

        let record = match existing {
            Some(mut record)
                if now - record.last_activity < Duration::minutes(self.timeout_minutes) =>
            {
                record.last_activity = now;
                record
            }
            _ => SessionRecord {
                id: Uuid::new_v4().to_string(),
                created_at: now,
                last_activity: now,
            },
        };

        self.write_session(&record);
        record
    }

    /// Return the permanent visitor id, minting it on first use
    pub fn get_or_create_visitor(&self) -> String {
        if let Some(id) = self.read_visitor() {
            return id;
        }
        let id = Uuid::new_v4().to_string();
        self.write_visitor(&id);
        id
    }

    /// Bump the session activity window; called on every tracked interaction
    pub fn update_activity(&self) {
        self.get_or_create_session();
    }

    /// Forcibly mint a new session id regardless of timeout state, e.g.
    /// after authentication.
    pub fn refresh_session(&self) -> SessionRecord {
        let now = self.clock.now();
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: now,
        };
        self.write_session(&record);
        record
    }

    fn read_session(&self) -> Option<SessionRecord> {
        if self.degraded.get() {
            return self.memory_session.borrow().clone();
        }
        self.storage
            .get(SESSION_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn write_session(&self, record: &SessionRecord) {
        if !self.degraded.get() {
            if let Ok(raw) = serde_json::to_string(record) {
                match self.storage.set(SESSION_KEY, &raw) {
                    Ok(()) => return,
                    Err(err) => {
                        log::warn!("session storage unavailable, using in-memory ids: {err}");
                        self.degraded.set(true);
                    }
                }
            }
        }
        *self.memory_session.borrow_mut() = Some(record.clone());
    }

    fn read_visitor(&self) -> Option<String> {
        if self.degraded.get() {
            return self.memory_visitor.borrow().clone();
        }
        self.storage.get(VISITOR_KEY)
    }

    fn write_visitor(&self, id: &str) {
        if !self.degraded.get() {
            match self.storage.set(VISITOR_KEY, id) {
                Ok(()) => return,
                Err(err) => {
                    log::warn!("visitor storage unavailable, using in-memory ids: {err}");
                    self.degraded.set(true);
                }
            }
        }
        *self.memory_visitor.borrow_mut() = Some(id.to_string());
    }
}
