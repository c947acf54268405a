//! PII scrubbing
//!
//! Every string destined for the wire passes through [`scrub`] before it
//! enters an event envelope: click text, custom properties, identify traits,
//! feedback free text. Rules are plain regex substitutions with fixed
//! redaction tokens; the tokens contain no digits or `@`, so scrubbing is
//! idempotent.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Recursion limit for [`scrub_value`]. Cycles are not detected; the depth
/// cap is the only defense against adversarial nesting.
const MAX_SCRUB_DEPTH: usize = 10;

/// A single redaction rule
struct ScrubRule {
    regex: &'static LazyLock<Option<Regex>>,
    token: &'static str,
}

macro_rules! scrub_pattern {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($pattern).ok());
    };
}

// Card first: its digit runs would otherwise partially match the phone rule.
scrub_pattern!(
    RE_CARD,
    r"\b(?:4\d{3}|5[1-5]\d{2}|3[47]\d{2}|6(?:011|5\d{2}))[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{3,4}\b"
);
scrub_pattern!(RE_SSN, r"\b\d{3}-\d{2}-\d{4}\b");
scrub_pattern!(
    RE_EMAIL,
    r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}"
);
scrub_pattern!(
    RE_IPV4,
    r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\b"
);
scrub_pattern!(
    RE_PHONE,
    r"(?:\+?\d{1,2}[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b"
);

fn rules() -> [ScrubRule; 5] {
    [
        ScrubRule {
            regex: &RE_CARD,
            token: "[CARD]",
        },
        ScrubRule {
            regex: &RE_SSN,
            token: "[SSN]",
        },
        ScrubRule {
            regex: &RE_EMAIL,
            token: "[EMAIL]",
        },
        ScrubRule {
            regex: &RE_IPV4,
            token: "[IP]",
        },
        ScrubRule {
            regex: &RE_PHONE,
            token: "[PHONE]",
        },
    ]
}

/// Redact PII from a string
pub fn scrub(text: &str) -> String {
    let mut scrubbed = text.to_string();
    for rule in rules() {
        if let Some(regex) = rule.regex.as_ref() {
            scrubbed = regex.replace_all(&scrubbed, rule.token).into_owned();
        }
    }
    scrubbed
}

/// Recursively redact PII from a JSON value, descending through arrays and
/// objects up to [`MAX_SCRUB_DEPTH`] levels. Deeper values are left as-is.
pub fn scrub_value(value: &mut Value) {
    scrub_value_at(value, 0);
}

fn scrub_value_at(value: &mut Value, depth: usize) {
    if depth >= MAX_SCRUB_DEPTH {
        return;
    }
    match value {
        Value::String(s) => {
            let scrubbed = scrub(s);
            if scrubbed != *s {
                *s = scrubbed;
            }
        }
        Value::Array(items) => {
            for item in items {
                scrub_value_at(item, depth + 1);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                scrub_value_at(item, depth + 1);
            }
        }
        _ => {}
    }
}

/// Truncate to at most `max_chars` characters on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
