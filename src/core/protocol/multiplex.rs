//! Framing of the multiplexer stream.
//!
//! A multiplexer response carries the bytes of many virtual responses. Each
//! piece is announced by a text line:
//!
//! | Line | Meaning |
//! |------|---------|
//! | `start response <id>` | A virtual response opened |
//! | `<n> bytes for response <id>` | The next `n` bytes belong to `<id>` |
//! | `close response <id>` | The virtual response finished |
//!
//! Bare CRLFs between frames are keep-alive probes and carry no data.
//!
//! ```
//! use braid_http::protocol::{MultiplexEvent, MultiplexParser};
//!
//! let frame = MultiplexEvent::data("r1", &b"hello"[..]).encode();
//! assert_eq!(&frame[..], b"5 bytes for response r1\r\nhello");
//!
//! let mut parser = MultiplexParser::new();
//! let events = parser.feed(&frame).unwrap();
//! assert_eq!(events, vec![MultiplexEvent::data("r1", &b"hello"[..])]);
//! ```

use crate::core::error::{BraidError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;

static DATA_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) bytes for response (.+)$").expect("static regex"));
static START_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^start response (.+)$").expect("static regex"));
static CLOSE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^close response (.+)$").expect("static regex"));

/// One frame of a multiplexer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplexEvent {
    /// A virtual response opened.
    StartResponse(String),
    /// Bytes written to a virtual response.
    Data {
        /// Request id the bytes belong to.
        id: String,
        /// The payload.
        data: Bytes,
    },
    /// A virtual response finished.
    CloseResponse(String),
}

impl MultiplexEvent {
    /// Shorthand for [`MultiplexEvent::Data`].
    #[must_use]
    pub fn data(id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        MultiplexEvent::Data {
            id: id.into(),
            data: data.into(),
        }
    }

    /// Request id this frame refers to.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            MultiplexEvent::StartResponse(id) | MultiplexEvent::CloseResponse(id) => id,
            MultiplexEvent::Data { id, .. } => id,
        }
    }

    /// Encode the frame for the physical stream.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            MultiplexEvent::StartResponse(id) => {
                Bytes::from(format!("start response {}\r\n", id))
            }
            MultiplexEvent::CloseResponse(id) => {
                Bytes::from(format!("close response {}\r\n", id))
            }
            MultiplexEvent::Data { id, data } => {
                let line = format!("{} bytes for response {}\r\n", data.len(), id);
                let mut buf = BytesMut::with_capacity(line.len() + data.len());
                buf.put_slice(line.as_bytes());
                buf.put_slice(data);
                buf.freeze()
            }
        }
    }
}

/// Incremental decoder for a multiplexer stream.
#[derive(Debug, Default)]
pub struct MultiplexParser {
    buffer: BytesMut,
}

impl MultiplexParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every frame completed by them.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::Protocol`] on a line that is not a known frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<MultiplexEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let skip = self
                .buffer
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            self.buffer.advance(skip);

            let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line = String::from_utf8_lossy(&self.buffer[..newline])
                .trim_end_matches('\r')
                .to_string();
            let header_len = newline + 1;

            if let Some(caps) = DATA_LINE.captures(&line) {
                let len: usize = caps[1].parse().map_err(|_| {
                    BraidError::Protocol(format!("Bad multiplex length in {:?}", line))
                })?;
                if self.buffer.len() - header_len < len {
                    break;
                }
                self.buffer.advance(header_len);
                let data = self.buffer.split_to(len).freeze();
                events.push(MultiplexEvent::data(&caps[2], data));
            } else if let Some(caps) = START_LINE.captures(&line) {
                self.buffer.advance(header_len);
                events.push(MultiplexEvent::StartResponse(caps[1].to_string()));
            } else if let Some(caps) = CLOSE_LINE.captures(&line) {
                self.buffer.advance(header_len);
                events.push(MultiplexEvent::CloseResponse(caps[1].to_string()));
            } else {
                return Err(BraidError::Protocol(format!(
                    "Unknown multiplex frame: {:?}",
                    line
                )));
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_lines() {
        assert_eq!(
            &MultiplexEvent::StartResponse("abc".into()).encode()[..],
            b"start response abc\r\n"
        );
        assert_eq!(
            &MultiplexEvent::CloseResponse("abc".into()).encode()[..],
            b"close response abc\r\n"
        );
    }

    #[test]
    fn test_parse_full_stream_with_keepalive() {
        let mut wire = BytesMut::new();
        wire.put_slice(b"\r\n");
        wire.put_slice(&MultiplexEvent::StartResponse("r".into()).encode());
        wire.put_slice(&MultiplexEvent::data("r", &b"\r\n\r\nbody"[..]).encode());
        wire.put_slice(b"\r\n");
        wire.put_slice(&MultiplexEvent::CloseResponse("r".into()).encode());

        let mut parser = MultiplexParser::new();
        let events = parser.feed(&wire).unwrap();
        assert_eq!(
            events,
            vec![
                MultiplexEvent::StartResponse("r".into()),
                MultiplexEvent::data("r", &b"\r\n\r\nbody"[..]),
                MultiplexEvent::CloseResponse("r".into()),
            ]
        );
    }

    #[test]
    fn test_parse_waits_for_whole_data_frame() {
        let frame = MultiplexEvent::data("x", &b"0123456789"[..]).encode();
        let mut parser = MultiplexParser::new();
        assert!(parser.feed(&frame[..frame.len() - 3]).unwrap().is_empty());
        let events = parser.feed(&frame[frame.len() - 3..]).unwrap();
        assert_eq!(events[0].id(), "x");
    }

    #[test]
    fn test_parse_rejects_unknown_line() {
        let mut parser = MultiplexParser::new();
        assert!(parser.feed(b"hello there\r\n").is_err());
    }
}
