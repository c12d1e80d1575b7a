//! Incremental framer for the ESL wire format.
//!
//! Inbound messages are a headers block terminated by a blank line
//! (two consecutive `\n`), followed by exactly `Content-Length` bytes
//! of body (zero when absent). Header values may be percent-encoded by
//! the engine; `%HH` sequences are decoded on ingress.
//!
//! The framer is the only stateful piece of the protocol layer: it
//! buffers partial reads until a complete frame is available. All
//! other protocol state lives in the connection.

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

use super::message::{EslMessage, Headers};

// ============================================================================
// Constants
// ============================================================================

/// Initial read buffer capacity.
const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Upper bound on a single header block, to fail fast on garbage
/// streams instead of buffering without limit.
const MAX_HEADER_BLOCK: usize = 64 * 1024;

// ============================================================================
// EslFramer
// ============================================================================

/// Stateful decoder accumulating socket bytes into [`EslMessage`]s.
///
/// Feed raw bytes with [`EslFramer::extend`], then drain complete
/// frames with [`EslFramer::next_message`] until it returns
/// `Ok(None)`. A frame split at any byte boundary across reads is
/// reassembled transparently.
#[derive(Debug, Default)]
pub struct EslFramer {
    buf: BytesMut,
}

impl EslFramer {
    /// Creates an empty framer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Appends raw socket bytes to the internal buffer.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the number of buffered, not-yet-framed bytes.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode the next complete message.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on malformed header lines, invalid
    /// percent-encoding, a non-numeric `Content-Length`, or an
    /// oversized header block.
    pub fn next_message(&mut self) -> Result<Option<EslMessage>> {
        // Locate the blank line terminating the header block without
        // consuming anything yet.
        let Some(header_end) = find_blank_line(&self.buf) else {
            if self.buf.len() > MAX_HEADER_BLOCK {
                return Err(Error::protocol("header block exceeds 64KiB"));
            }
            return Ok(None);
        };

        let headers = parse_header_block(&self.buf[..header_end])?;

        let body_len = match headers.get("Content-Length") {
            Some(len) => len
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::protocol(format!("invalid Content-Length: {len:?}")))?,
            None => 0,
        };

        let frame_end = header_end + 2 + body_len;
        if self.buf.len() < frame_end {
            // Body bytes still in flight.
            return Ok(None);
        }

        self.buf.advance(header_end + 2);
        let body = if body_len > 0 {
            Some(self.buf.split_to(body_len).to_vec())
        } else {
            None
        };

        Ok(Some(EslMessage::new(headers, body)))
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Finds the offset of the first `\n\n`, i.e. the end of the header
/// block (exclusive of the terminator).
fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Parses a `Name: value` header block, percent-decoding values.
pub(crate) fn parse_header_block(block: &[u8]) -> Result<Headers> {
    let text = std::str::from_utf8(block)
        .map_err(|_| Error::protocol("header block is not valid UTF-8"))?;

    let mut headers = Headers::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed header line: {line:?}")))?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        headers.push(name, percent_decode(value)?);
    }
    Ok(headers)
}

/// Decodes `%HH` escapes in a header value.
///
/// The engine encodes `%`, `:`, CR and LF in header values; this is
/// the inverse. Values without `%` pass through untouched.
pub(crate) fn percent_decode(value: &str) -> Result<String> {
    if !value.contains('%') {
        return Ok(value.to_string());
    }

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::protocol(format!("truncated percent-escape in {value:?}")))?;
            let hex = std::str::from_utf8(hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::protocol(format!("invalid percent-escape in {value:?}")))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| Error::protocol("percent-decoded value is not UTF-8"))
}

/// Percent-encodes the characters the engine escapes in header values.
#[must_use]
pub(crate) fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' | ':' | '\r' | '\n' => {
                out.push('%');
                out.push_str(&format!("{:02X}", ch as u32));
            }
            _ => out.push(ch),
        }
    }
    out
}

// ============================================================================
// Serialization
// ============================================================================

/// Serializes a message back to wire bytes.
///
/// Inverse of parsing for every well-formed message: header lines in
/// order, a blank line, then the body verbatim.
#[must_use]
pub fn serialize(msg: &EslMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    for (name, value) in msg.headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(percent_encode(value).as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    if let Some(body) = &msg.body {
        out.extend_from_slice(body);
    }
    out
}

/// Serializes an outbound command line: the command followed by the
/// blank-line terminator.
#[must_use]
pub fn serialize_command(cmd: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(cmd.len() + 2);
    out.extend_from_slice(cmd.as_bytes());
    out.extend_from_slice(b"\n\n");
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut EslFramer, data: &str) -> Option<EslMessage> {
        framer.extend(data.as_bytes());
        framer.next_message().expect("decode")
    }

    #[test]
    fn test_simple_frame() {
        let mut framer = EslFramer::new();
        let msg = feed(&mut framer, "Content-Type: auth/request\n\n").expect("frame");
        assert_eq!(msg.header("Content-Type"), Some("auth/request"));
        assert!(msg.body.is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_frame_with_body() {
        let mut framer = EslFramer::new();
        let msg = feed(
            &mut framer,
            "Content-Type: api/response\nContent-Length: 14\n\nUP 0 years, 0d",
        )
        .expect("frame");
        assert_eq!(msg.body_str(), Some("UP 0 years, 0d"));
    }

    #[test]
    fn test_zero_length_body() {
        let mut framer = EslFramer::new();
        let msg = feed(
            &mut framer,
            "Content-Type: command/reply\nContent-Length: 0\n\n",
        )
        .expect("frame");
        assert!(msg.body.is_none());
    }

    #[test]
    fn test_partial_reads_any_split() {
        let wire = "Content-Type: api/response\nContent-Length: 5\n\nhello";
        for split in 1..wire.len() {
            let mut framer = EslFramer::new();
            framer.extend(wire[..split].as_bytes());
            assert!(framer.next_message().expect("decode").is_none());
            framer.extend(wire[split..].as_bytes());
            let msg = framer.next_message().expect("decode").expect("frame");
            assert_eq!(msg.body_str(), Some("hello"));
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut framer = EslFramer::new();
        framer.extend(
            b"Content-Type: command/reply\nReply-Text: +OK\n\n\
              Content-Type: auth/request\n\n",
        );
        let first = framer.next_message().unwrap().expect("first");
        let second = framer.next_message().unwrap().expect("second");
        assert_eq!(first.header("Reply-Text"), Some("+OK"));
        assert_eq!(second.header("Content-Type"), Some("auth/request"));
        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn test_percent_decode_inverse_of_encode() {
        for raw in ["a%b", "line\nbreak", "colon: here", "cr\rlf\n", "plain"] {
            let encoded = percent_encode(raw);
            assert_eq!(percent_decode(&encoded).expect("decode"), raw);
        }
    }

    #[test]
    fn test_percent_decode_invalid() {
        assert!(percent_decode("bad%zz").is_err());
        assert!(percent_decode("trunc%2").is_err());
    }

    #[test]
    fn test_malformed_header_line() {
        let mut framer = EslFramer::new();
        framer.extend(b"NoColonHere\n\n");
        assert!(matches!(
            framer.next_message(),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_invalid_content_length() {
        let mut framer = EslFramer::new();
        framer.extend(b"Content-Type: api/response\nContent-Length: abc\n\n");
        assert!(matches!(
            framer.next_message(),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let headers: Headers = [
            ("Content-Type", "text/event-plain"),
            ("Some-Header", "with:colon and\nnewline"),
            ("Content-Length", "4"),
        ]
        .into_iter()
        .collect();
        let msg = EslMessage::new(headers, Some(b"body".to_vec()));

        let mut framer = EslFramer::new();
        framer.extend(&serialize(&msg));
        let parsed = framer.next_message().unwrap().expect("frame");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_serialize_command() {
        assert_eq!(serialize_command("auth secret"), b"auth secret\n\n");
    }
}
