//! Interaction detectors
//!
//! Each detector is a small state machine fed by the dispatcher. Detectors
//! do only constant-time work inline (buffer pushes, threshold checks) and
//! return signal structs; envelope assembly and delivery happen in the
//! collector, off the input-handling path.

pub mod click;
pub mod hover;
pub mod path;
pub mod rage;
pub mod scroll;

pub use click::{ClickDetector, ClickSignal, DeadClickSignal, MutationFlag};
pub use hover::{AttentionZone, HoverSignal, HoverTracker};
pub use path::{simplify_path, PathMetrics, PathPoint};
pub use rage::{RageClickDetector, RageSignal};
pub use scroll::{ConfusionScrollDetector, ConfusionSignal};
