//! Turns inbound broker messages into window transitions or raw values.
//!
//! Topics are expected as `<prefix>/<prefix>/<prefix>/<item>`; the fourth
//! segment names the item. Window-like items only produce an event for the
//! payloads `OPEN` and `CLOSED`, every other item is passed through verbatim.

use crate::config::TopicMap;
use crate::models::{Classified, RawValue, StateEvent, StateKind};
use std::collections::HashSet;

const ITEM_SEGMENT: usize = 3;

/// Fourth slash-delimited segment of `topic`, if present.
pub fn item_description(topic: &str) -> Option<&str> {
    topic.split('/').nth(ITEM_SEGMENT)
}

pub fn classify(topic: &str, payload: &str, windows: &HashSet<String>) -> Option<Classified> {
    // Short topics carry no item segment; keep the whole topic as the item.
    let item = item_description(topic).unwrap_or(topic);

    if windows.contains(item) {
        let kind = match payload {
            "OPEN" => StateKind::Opened,
            "CLOSED" => StateKind::Closed,
            _ => return None,
        };
        return Some(Classified::State(StateEvent {
            kind,
            subject: item.to_string(),
        }));
    }

    Some(Classified::Raw(RawValue {
        item: item.to_string(),
        value: payload.to_string(),
    }))
}

#[derive(Debug, Clone, Default)]
pub struct EventClassifier {
    windows: HashSet<String>,
}

impl EventClassifier {
    pub fn new(windows: HashSet<String>) -> Self {
        Self { windows }
    }

    pub fn from_topics(topics: &TopicMap) -> Self {
        Self::new(topics.window_items())
    }

    pub fn classify(&self, topic: &str, payload: &str) -> Option<Classified> {
        classify(topic, payload, &self.windows)
    }
}
