//! Typed view over event messages.
//!
//! An [`Event`] is an [`EslMessage`](super::EslMessage) whose
//! `Content-Type` is one of the event encodings. For
//! `text/event-plain` the outer body is itself a nested headers block
//! (optionally carrying its own `Content-Length` payload, e.g. the
//! result of a background job); for `text/event-json` it is a JSON
//! object. Both decode into the same flat header map.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{JobUuid, SessionUuid};

use super::frame::parse_header_block;
use super::message::{ContentType, EslMessage, Headers};

// ============================================================================
// Event name constants
// ============================================================================

/// Well-known `Event-Name` values used by the built-in handlers.
pub mod names {
    /// New channel allocated.
    pub const CHANNEL_CREATE: &str = "CHANNEL_CREATE";
    /// Outbound leg requested by an originate.
    pub const CHANNEL_ORIGINATE: &str = "CHANNEL_ORIGINATE";
    /// Channel answered.
    pub const CHANNEL_ANSWER: &str = "CHANNEL_ANSWER";
    /// Channel parked.
    pub const CHANNEL_PARK: &str = "CHANNEL_PARK";
    /// Two channels bridged.
    pub const CHANNEL_BRIDGE: &str = "CHANNEL_BRIDGE";
    /// Hangup initiated.
    pub const CHANNEL_HANGUP: &str = "CHANNEL_HANGUP";
    /// Channel fully torn down.
    pub const CHANNEL_HANGUP_COMPLETE: &str = "CHANNEL_HANGUP_COMPLETE";
    /// `bgapi` result delivery.
    pub const BACKGROUND_JOB: &str = "BACKGROUND_JOB";
    /// Subclassed module event.
    pub const CUSTOM: &str = "CUSTOM";
    /// Synthetic event emitted when the engine disconnects.
    pub const SERVER_DISCONNECTED: &str = "SERVER_DISCONNECTED";
}

// ============================================================================
// Event
// ============================================================================

/// One decoded asynchronous engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    headers: Headers,
    body: Option<String>,
}

impl Event {
    /// Decodes an event from a framed message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the message is not an event
    /// encoding this crate subscribes with (`plain` or `json`), or
    /// the body fails to parse.
    pub fn from_message(msg: &EslMessage) -> Result<Self> {
        match msg.content_type()? {
            ContentType::EventPlain => Self::from_plain_body(msg.body.as_deref().unwrap_or(&[])),
            ContentType::EventJson => Self::from_json_body(msg.body.as_deref().unwrap_or(&[])),
            other => Err(Error::protocol(format!(
                "cannot decode event from {other}"
            ))),
        }
    }

    /// Builds the synthetic `SERVER_DISCONNECTED` event delivered when
    /// the engine closes the socket or sends a disconnect notice.
    #[must_use]
    pub fn server_disconnected() -> Self {
        let headers: Headers = [("Event-Name", names::SERVER_DISCONNECTED)]
            .into_iter()
            .collect();
        Self {
            headers,
            body: None,
        }
    }

    /// Decodes a `text/event-plain` body: a nested headers block,
    /// optionally followed by a blank line and `Content-Length` bytes
    /// of event payload.
    fn from_plain_body(body: &[u8]) -> Result<Self> {
        let (header_block, rest) = match body.windows(2).position(|w| w == b"\n\n") {
            Some(idx) => (&body[..idx], &body[idx + 2..]),
            None => (body, &[][..]),
        };
        let headers = parse_header_block(header_block)?;

        let body = match headers.get("Content-Length") {
            Some(len) => {
                let len = len
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Error::protocol(format!("invalid event Content-Length: {len:?}")))?;
                if rest.len() < len {
                    return Err(Error::protocol("event body shorter than Content-Length"));
                }
                let text = std::str::from_utf8(&rest[..len])
                    .map_err(|_| Error::protocol("event body is not valid UTF-8"))?;
                Some(text.to_string())
            }
            None => None,
        };

        Ok(Self { headers, body })
    }

    /// Decodes a `text/event-json` body.
    fn from_json_body(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::protocol("event-json body is not an object"))?;

        let mut headers = Headers::new();
        let mut event_body = None;
        for (key, value) in object {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if key == "_body" {
                event_body = Some(text);
            } else {
                headers.push(key, text);
            }
        }

        Ok(Self {
            headers,
            body: event_body,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the `Event-Name`.
    #[must_use]
    pub fn name(&self) -> &str {
        self.headers.get("Event-Name").unwrap_or_default()
    }

    /// Returns the `Event-Subclass` of a `CUSTOM` event.
    #[inline]
    #[must_use]
    pub fn subclass(&self) -> Option<&str> {
        self.headers.get("Event-Subclass")
    }

    /// Returns a raw header value.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the channel UUID (`Unique-ID`) for channel events.
    #[must_use]
    pub fn session_uuid(&self) -> Option<SessionUuid> {
        self.headers.get("Unique-ID").and_then(SessionUuid::parse)
    }

    /// Returns the `Job-UUID` for background-job events.
    #[must_use]
    pub fn job_uuid(&self) -> Option<JobUuid> {
        self.headers.get("Job-UUID").and_then(JobUuid::parse)
    }

    /// Looks up a channel variable by name.
    ///
    /// Follows the wire prefix convention: `variable_<name>` is tried
    /// first, then the bare name (standard headers).
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&format!("variable_{name}"))
            .or_else(|| self.headers.get(name))
    }

    /// Returns the engine timestamp in seconds since the epoch.
    ///
    /// Parsed from `Event-Date-Timestamp` (microseconds).
    #[must_use]
    pub fn timestamp(&self) -> Option<f64> {
        self.headers
            .get("Event-Date-Timestamp")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|micros| micros as f64 / 1_000_000.0)
    }

    /// Returns the `Hangup-Cause` header.
    #[inline]
    #[must_use]
    pub fn hangup_cause(&self) -> Option<&str> {
        self.headers.get("Hangup-Cause")
    }

    /// Returns the `Call-Direction` header.
    #[inline]
    #[must_use]
    pub fn call_direction(&self) -> Option<&str> {
        self.headers.get("Call-Direction")
    }

    /// Returns the event payload body, if any.
    #[inline]
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Returns the full header map.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

// ============================================================================
// Tests
// ============================================================================
