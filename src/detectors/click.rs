//! Click and dead-click detection
//!
//! Every primary click is reported immediately. Independently, a pending
//! check fires 300ms later: if no qualifying document mutation was observed
//! since the click, and the target is not an anchor with an href or a
//! native form control, the click is classified dead. Anchors and form
//! controls are always presumed to do something, since navigation and
//! native UI do not mutate the observable tree.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};

use crate::config::DetectorTunables;
use crate::document::ElementInfo;

/// Shared "a qualifying mutation happened" flag. The dead-click detector
/// owns it exclusively: reset on click, set by the mutation handler, read
/// at the pending-check deadline. Handoff is flag-based so a mutation
/// callback firing mid-click-handler cannot interleave queue state.
#[derive(Debug, Clone, Default)]
pub struct MutationFlag(Rc<Cell<bool>>);

impl MutationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.set(true);
    }

    pub fn reset(&self) {
        self.0.set(false);
    }

    pub fn is_set(&self) -> bool {
        self.0.get()
    }
}

/// Immediate click report
#[derive(Debug, Clone)]
pub struct ClickSignal {
    pub element: ElementInfo,
    pub x: f64,
    pub y: f64,
}

/// A click that produced no observable effect
#[derive(Debug, Clone)]
pub struct DeadClickSignal {
    pub element: ElementInfo,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug)]
struct PendingCheck {
    element: ElementInfo,
    x: f64,
    y: f64,
    deadline: DateTime<Utc>,
    exempt: bool,
}

/// Detects clicks that do nothing
pub struct ClickDetector {
    flag: MutationFlag,
    pending: VecDeque<PendingCheck>,
    window_ms: i64,
    attribute_allowlist: Vec<String>,
}

impl ClickDetector {
    pub fn new(tunables: &DetectorTunables) -> Self {
        Self {
            flag: MutationFlag::new(),
            pending: VecDeque::new(),
            window_ms: tunables.dead_click_window_ms,
            attribute_allowlist: tunables.mutation_attribute_allowlist.clone(),
        }
    }

    /// Handle to the shared mutation flag, for wiring and tests
    pub fn mutation_flag(&self) -> MutationFlag {
        self.flag.clone()
    }

    /// Record a primary click. Returns the immediate click signal; the
    /// dead-click verdict arrives later via [`ClickDetector::poll`].
    pub fn on_click(&mut self, element: &ElementInfo, x: f64, y: f64, now: DateTime<Utc>) -> ClickSignal {
        self.flag.reset();
        let exempt = element.is_anchor_with_href() || element.is_form_control();
        self.pending.push_back(PendingCheck {
            element: element.clone(),
            x,
            y,
            deadline: now + Duration::milliseconds(self.window_ms),
            exempt,
        });
        ClickSignal {
            element: element.clone(),
            x,
            y,
        }
    }

    /// Record a document mutation. Subtree mutations (no attribute) always
    /// qualify; attribute mutations qualify only for the allow-list.
    pub fn on_mutation(&mut self, attribute: Option<&str>) {
        let qualifies = match attribute {
            None => true,
            Some(attr) => self.attribute_allowlist.iter().any(|a| a == attr),
        };
        if qualifies {
            self.flag.set();
        }
    }

    /// Evaluate pending checks whose deadline has passed
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<DeadClickSignal> {
        let mut dead = Vec::new();
        while let Some(front) = self.pending.front() {
            if front.deadline > now {
                break;
            }
            let check = match self.pending.pop_front() {
                Some(check) => check,
                None => break,
            };
            if check.element.tag.is_empty() {
                // Malformed target; skip classification rather than abort
                log::debug!("skipping dead-click check for tagless element");
                continue;
            }
            if !check.exempt && !self.flag.is_set() {
                dead.push(DeadClickSignal {
                    element: check.element,
                    x: check.x,
                    y: check.y,
                });
            }
        }
        dead
    }

    pub fn pending_checks(&self) -> usize {
        self.pending.len()
    }
}
