//! ESL message and header types.
//!
//! One [`EslMessage`] is one wire unit: a block of `Name: value`
//! headers terminated by a blank line, optionally followed by exactly
//! `Content-Length` bytes of body. Classification happens through the
//! `Content-Type` header.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};

// ============================================================================
// ContentType
// ============================================================================

/// Classification of an inbound ESL message.
///
/// | Wire value | Variant |
/// |------------|---------|
/// | `auth/request` | [`ContentType::AuthRequest`] |
/// | `command/reply` | [`ContentType::CommandReply`] |
/// | `api/response` | [`ContentType::ApiResponse`] |
/// | `text/event-plain` | [`ContentType::EventPlain`] |
/// | `text/event-json` | [`ContentType::EventJson`] |
/// | `text/event-xml` | [`ContentType::EventXml`] |
/// | `text/disconnect-notice` | [`ContentType::DisconnectNotice`] |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Engine is requesting authentication.
    AuthRequest,
    /// Direct response to a command; success/failure in `Reply-Text`.
    CommandReply,
    /// Response body to a synchronous `api` call.
    ApiResponse,
    /// Asynchronous event, body is a nested headers block.
    EventPlain,
    /// Asynchronous event, body is a JSON object.
    EventJson,
    /// Asynchronous event, body is XML.
    EventXml,
    /// Server is closing the connection.
    DisconnectNotice,
}

impl ContentType {
    /// Classifies a `Content-Type` header value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for unknown content types; the
    /// connection treats this as fatal.
    pub fn from_header(value: &str) -> Result<Self> {
        match value {
            "auth/request" => Ok(Self::AuthRequest),
            "command/reply" => Ok(Self::CommandReply),
            "api/response" => Ok(Self::ApiResponse),
            "text/event-plain" => Ok(Self::EventPlain),
            "text/event-json" => Ok(Self::EventJson),
            "text/event-xml" => Ok(Self::EventXml),
            "text/disconnect-notice" => Ok(Self::DisconnectNotice),
            other => Err(Error::protocol(format!("unknown content type: {other}"))),
        }
    }

    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequest => "auth/request",
            Self::CommandReply => "command/reply",
            Self::ApiResponse => "api/response",
            Self::EventPlain => "text/event-plain",
            Self::EventJson => "text/event-json",
            Self::EventXml => "text/event-xml",
            Self::DisconnectNotice => "text/disconnect-notice",
        }
    }

    /// Returns `true` if this is one of the event encodings.
    #[inline]
    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(self, Self::EventPlain | Self::EventJson | Self::EventXml)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Headers
// ============================================================================

/// Ordered header collection.
///
/// Insertion order is preserved (the wire order matters for
/// serialization round-trips); lookups are linear, which is fine for
/// the handful of headers a control message carries. Event payloads
/// with large header sets are only scanned for a few known keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header collection.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping wire order.
    #[inline]
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Returns the first value for `name`, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the number of headers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no headers are present.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ============================================================================
// EslMessage
// ============================================================================

/// One framed ESL wire unit.
///
/// Produced by the framer on parse, consumed exactly once by the
/// connection's dispatch (either resolving a pending waiter or
/// flowing into the event channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EslMessage {
    /// Ordered header block.
    pub headers: Headers,
    /// Raw body bytes; empty `Vec` and `None` are equivalent on the
    /// wire (`Content-Length: 0` vs. absent).
    pub body: Option<Vec<u8>>,
}

impl EslMessage {
    /// Creates a message from parts.
    #[inline]
    #[must_use]
    pub fn new(headers: Headers, body: Option<Vec<u8>>) -> Self {
        Self { headers, body }
    }

    /// Classifies this message by its `Content-Type` header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the header is missing or
    /// unknown.
    pub fn content_type(&self) -> Result<ContentType> {
        let value = self
            .headers
            .get("Content-Type")
            .ok_or_else(|| Error::protocol("message without Content-Type"))?;
        ContentType::from_header(value)
    }

    /// Returns a header value.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the `Reply-Text` header, if present.
    #[inline]
    #[must_use]
    pub fn reply_text(&self) -> Option<&str> {
        self.headers.get("Reply-Text")
    }

    /// Returns `true` if `Reply-Text` starts with `+OK`.
    #[must_use]
    pub fn is_reply_ok(&self) -> bool {
        self.reply_text().is_some_and(|t| t.starts_with("+OK"))
    }

    /// Returns the body as UTF-8 text.
    ///
    /// Invalid UTF-8 yields `None`; ESL control payloads are ASCII in
    /// practice.
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        self.body
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Checks an `api/response` body for engine-reported failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] when the body's first line starts with
    /// `-ERR`.
    pub fn check_api_body(&self) -> Result<&str> {
        let body = self.body_str().unwrap_or_default();
        match body.lines().next() {
            Some(first) if first.starts_with("-ERR") => Err(Error::api(body.trim_end())),
            _ => Ok(body),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
