//! Rolling per-session event history.
//!
//! Sessions keep their most recent events so header lookups can see
//! the freshest value of any channel variable without the model layer
//! having to know every header name up front.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use crate::protocol::Event;

// ============================================================================
// Constants
// ============================================================================

/// Events retained per session. Channel lifecycles produce a handful
/// of events; the bound only matters for chatty CUSTOM subscriptions.
const MAX_EVENTS: usize = 32;

// ============================================================================
// EventHistory
// ============================================================================

/// Bounded deque of events, most recent first.
#[derive(Debug, Default)]
pub struct EventHistory {
    events: VecDeque<Event>,
}

impl EventHistory {
    /// Creates a history seeded with one event.
    #[must_use]
    pub fn new(event: Event) -> Self {
        let mut history = Self {
            events: VecDeque::with_capacity(8),
        };
        history.update(event);
        history
    }

    /// Prepends the newest event, dropping the oldest at capacity.
    pub fn update(&mut self, event: Event) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_back();
        }
        self.events.push_front(event);
    }

    /// Returns the most recent event.
    #[inline]
    #[must_use]
    pub fn latest(&self) -> Option<&Event> {
        self.events.front()
    }

    /// Looks a header up, newest event first.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.events.iter().find_map(|e| e.header(key))
    }

    /// Looks a channel variable up by the prefix convention
    /// (`variable_<name>` first, then the bare name), newest first.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.events.iter().find_map(|e| e.variable(name))
    }

    /// Returns the number of retained events.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` when no events are retained.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EslMessage, Headers};

    fn event(pairs: &[(&str, &str)]) -> Event {
        let mut body = String::new();
        for (k, v) in pairs {
            body.push_str(&format!("{k}: {v}\n"));
        }
        let clen = body.len().to_string();
        let headers: Headers = [
            ("Content-Type", "text/event-plain"),
            ("Content-Length", clen.as_str()),
        ]
        .into_iter()
        .collect();
        Event::from_message(&EslMessage::new(headers, Some(body.into_bytes()))).expect("event")
    }

    #[test]
    fn test_newest_value_wins() {
        let mut history = EventHistory::new(event(&[
            ("Event-Name", "CHANNEL_CREATE"),
            ("Channel-State", "CS_INIT"),
        ]));
        history.update(event(&[
            ("Event-Name", "CHANNEL_ANSWER"),
            ("Channel-State", "CS_EXECUTE"),
        ]));

        assert_eq!(history.get("Channel-State"), Some("CS_EXECUTE"));
        assert_eq!(history.latest().unwrap().name(), "CHANNEL_ANSWER");
    }

    #[test]
    fn test_falls_back_to_older_events() {
        let mut history = EventHistory::new(event(&[
            ("Event-Name", "CHANNEL_CREATE"),
            ("variable_sofia_profile_name", "external"),
        ]));
        history.update(event(&[("Event-Name", "CHANNEL_ANSWER")]));

        assert_eq!(history.variable("sofia_profile_name"), Some("external"));
    }

    #[test]
    fn test_bounded() {
        let mut history = EventHistory::new(event(&[("Event-Name", "CHANNEL_CREATE")]));
        for _ in 0..(MAX_EVENTS * 2) {
            history.update(event(&[("Event-Name", "CUSTOM")]));
        }
        assert_eq!(history.len(), MAX_EVENTS);
    }
}
