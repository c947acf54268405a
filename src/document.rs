//! Read-only views of the host document
//!
//! The collector never walks a live DOM directly; the host hands it element
//! descriptors on each interaction and a [`DocumentView`] for structural
//! sampling and snapshot serialization.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Tags treated as native form controls. Clicks on these are presumed to do
/// something even when no mutation is observable (native UI, form state).
const FORM_CONTROL_TAGS: &[&str] = &["input", "button", "select", "textarea", "option"];

/// Descriptor of a single element, as captured by the host at event time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementInfo {
    /// Lowercase tag name
    pub tag: String,
    /// Element id attribute, if present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Class tokens in document order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    /// Inner text (unscrubbed; scrubbed before it reaches the wire)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// href attribute for anchors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// ARIA role attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// type attribute for inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
}

impl ElementInfo {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    /// Stable selector string: tag, id, and the first two class tokens
    pub fn selector(&self) -> String {
        let mut selector = self.tag.clone();
        if let Some(id) = &self.id {
            selector.push('#');
            selector.push_str(id);
        }
        for class in self.classes.iter().take(2) {
            selector.push('.');
            selector.push_str(class);
        }
        selector
    }

    /// Anchors with an href navigate; exempt from dead-click classification
    pub fn is_anchor_with_href(&self) -> bool {
        self.tag == "a" && self.href.as_deref().is_some_and(|h| !h.is_empty())
    }

    pub fn is_form_control(&self) -> bool {
        FORM_CONTROL_TAGS.contains(&self.tag.as_str())
    }
}

/// Structural descriptor of a sampled document node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
}

impl NodeDescriptor {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            id: None,
            classes: Vec::new(),
        }
    }

    pub fn with_id(tag: &str, id: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            id: Some(id.to_string()),
            classes: Vec::new(),
        }
    }
}

/// Read-only view of the live document
pub trait DocumentView {
    /// Current content width and height in pixels
    fn content_size(&self) -> (f64, f64);

    /// Flat list of body nodes in document order, for structural sampling
    fn body_nodes(&self) -> Vec<NodeDescriptor>;

    /// Serialized replay snapshot of the tree. `None` while the document is
    /// still constructing; callers retry with backoff and then give up.
    fn serialize_snapshot(&self) -> Option<String>;
}

#[derive(Debug, Default)]
struct DocumentState {
    width: f64,
    height: f64,
    nodes: Vec<NodeDescriptor>,
    snapshot: Option<String>,
}

/// Host-fed document backed by plain data. The FFI embedding and the CLI
/// replay harness update it in place; tests mutate it to simulate layout and
/// structure changes.
#[derive(Debug, Default)]
pub struct StaticDocument {
    state: RefCell<DocumentState>,
}

impl StaticDocument {
    pub fn new(width: f64, height: f64, nodes: Vec<NodeDescriptor>) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(DocumentState {
                width,
                height,
                nodes,
                snapshot: None,
            }),
        })
    }

    pub fn set_content_size(&self, width: f64, height: f64) {
        let mut state = self.state.borrow_mut();
        state.width = width;
        state.height = height;
    }

    pub fn set_nodes(&self, nodes: Vec<NodeDescriptor>) {
        self.state.borrow_mut().nodes = nodes;
    }

    /// Install the serialized snapshot the view should hand out. `None`
    /// simulates a document that is not ready to serialize.
    pub fn set_snapshot(&self, snapshot: Option<String>) {
        self.state.borrow_mut().snapshot = snapshot;
    }
}

impl DocumentView for StaticDocument {
    fn content_size(&self) -> (f64, f64) {
        let state = self.state.borrow();
        (state.width, state.height)
    }

    fn body_nodes(&self) -> Vec<NodeDescriptor> {
        self.state.borrow().nodes.clone()
    }

    fn serialize_snapshot(&self) -> Option<String> {
        self.state.borrow().snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_includes_first_two_classes() {
        let element = ElementInfo {
            tag: "div".to_string(),
            id: Some("hero".to_string()),
            classes: vec![
                "card".to_string(),
                "card--wide".to_string(),
                "visible".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(element.selector(), "div#hero.card.card--wide");
    }

    #[test]
    fn test_anchor_exemption_requires_href() {
        let mut anchor = ElementInfo::new("a");
        assert!(!anchor.is_anchor_with_href());

        anchor.href = Some(String::new());
        assert!(!anchor.is_anchor_with_href());

        anchor.href = Some("/pricing".to_string());
        assert!(anchor.is_anchor_with_href());
    }

    #[test]
    fn test_form_control_tags() {
        assert!(ElementInfo::new("button").is_form_control());
        assert!(ElementInfo::new("SELECT").is_form_control());
        assert!(!ElementInfo::new("div").is_form_control());
    }

    #[test]
    fn test_static_document_updates() {
        let document = StaticDocument::new(1200.0, 3000.0, vec![NodeDescriptor::new("div")]);
        assert_eq!(document.content_size(), (1200.0, 3000.0));
        assert!(document.serialize_snapshot().is_none());

        document.set_snapshot(Some("<body/>".to_string()));
        assert_eq!(document.serialize_snapshot().as_deref(), Some("<body/>"));

        document.set_content_size(800.0, 3000.0);
        assert_eq!(document.content_size().0, 800.0);
    }
}
