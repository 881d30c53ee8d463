//! Incremental scanner for `Patches: N` bodies.
//!
//! The body of a multi-patch message arrives in chunks whose boundaries can
//! fall anywhere: inside a header line, between the header block and the
//! content, or in the middle of the content. [`PatchScanner`] buffers what it
//! has seen and emits patches as soon as each one is complete.
//!
//! # Scanning Flow
//!
//! 1. Skip CR/LF bytes left over from the previous separator
//! 2. Find the end of the header block (`\n\n` or `\n\r\n`)
//! 3. Read `content-length` (required) and `content-range`
//! 4. Wait until `content-length` bytes of content are buffered
//! 5. Slice the content, emit the patch, repeat until `N` patches are out
//!
//! ```
//! use braid_http::protocol::{PatchScanner, ScanStatus};
//!
//! let mut scanner = PatchScanner::new(1);
//! assert_eq!(scanner.feed(b"Content-Length: 2\r\nContent-Ra").unwrap(), ScanStatus::NeedMore);
//! assert_eq!(scanner.feed(b"nge: json .a\r\n\r\n22").unwrap(), ScanStatus::Complete);
//! assert_eq!(scanner.into_patches()[0].content_str(), Some("22"));
//! ```

use crate::core::error::{BraidError, Result};
use crate::core::types::{ContentRange, Patch};
use bytes::{Buf, BytesMut};
use std::collections::BTreeMap;

/// Result of feeding a chunk into a [`PatchScanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Fewer than the expected number of patches have been parsed.
    NeedMore,
    /// Every expected patch has been parsed.
    Complete,
}

/// Incremental parser for the patch blocks following a `Patches: N` header.
#[derive(Debug)]
pub struct PatchScanner {
    expected: usize,
    buffer: BytesMut,
    patches: Vec<Patch>,
}

impl PatchScanner {
    /// Create a scanner expecting `expected` patches.
    #[must_use]
    pub fn new(expected: usize) -> Self {
        PatchScanner {
            expected,
            buffer: BytesMut::new(),
            patches: Vec::with_capacity(expected.min(64)),
        }
    }

    /// Number of patches the `Patches` header announced.
    #[inline]
    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Number of patches parsed so far.
    #[inline]
    #[must_use]
    pub fn received(&self) -> usize {
        self.patches.len()
    }

    /// True once every expected patch has been parsed.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.patches.len() >= self.expected
    }

    /// Bytes buffered but not yet consumed.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed the next chunk of the body.
    ///
    /// Bytes arriving after the last expected patch stay buffered and are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::MissingContentLength`] if a patch header block
    /// lacks `Content-Length`, and [`BraidError::Protocol`] or
    /// [`BraidError::HeaderParse`] for any other malformed header block.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<ScanStatus> {
        self.buffer.extend_from_slice(chunk);

        while !self.is_complete() {
            let skip = self
                .buffer
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            self.buffer.advance(skip);

            let Some(body_start) = find_header_end(&self.buffer) else {
                return Ok(ScanStatus::NeedMore);
            };

            let headers = parse_header_block(&self.buffer[..body_start]);
            let length = match headers.get("content-length") {
                Some(v) => v.trim().parse::<usize>().map_err(|_| {
                    BraidError::Protocol(format!("Invalid content-length in patch: {:?}", v))
                })?,
                None => {
                    return Err(BraidError::MissingContentLength(
                        String::from_utf8_lossy(&self.buffer[..body_start]).into_owned(),
                    ))
                }
            };

            if self.buffer.len() - body_start < length {
                return Ok(ScanStatus::NeedMore);
            }

            let range = headers
                .get("content-range")
                .ok_or_else(|| BraidError::Protocol("Patch without content-range".to_string()))
                .and_then(|v| ContentRange::from_header_value(v))?;

            let mut block = self.buffer.split_to(body_start + length);
            let content = block.split_off(body_start).freeze();

            let extra_headers = headers
                .into_iter()
                .filter(|(k, _)| k != "content-length" && k != "content-range")
                .collect();

            self.patches.push(Patch {
                unit: range.unit,
                range: range.range,
                content,
                extra_headers,
            });
        }

        Ok(ScanStatus::Complete)
    }

    /// Patches parsed so far, in wire order.
    #[inline]
    #[must_use]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Take the parsed patches.
    #[must_use]
    pub fn into_patches(self) -> Vec<Patch> {
        self.patches
    }
}

/// Offset just past the blank line ending the header block, if buffered.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    (1..buf.len()).find_map(|i| {
        if buf[i] != b'\n' {
            return None;
        }
        if buf[i - 1] == b'\n' || (i >= 2 && buf[i - 1] == b'\r' && buf[i - 2] == b'\n') {
            Some(i + 1)
        } else {
            None
        }
    })
}

/// Lowercased `name: value` pairs. Lines without a colon are ignored.
fn parse_header_block(block: &[u8]) -> BTreeMap<String, String> {
    String::from_utf8_lossy(block)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim_start().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::encode_patches;

    const TWO: &[u8] = b"Content-Length: 1\r\nContent-Range: json .a\r\n\r\n1\r\n\r\n\
                         Content-Length: 2\r\nContent-Range: json .b\r\n\r\n22";

    fn expected_two() -> Vec<Patch> {
        vec![Patch::json(".a", "1"), Patch::json(".b", "22")]
    }

    #[test]
    fn test_scan_whole_buffer() {
        let mut scanner = PatchScanner::new(2);
        assert_eq!(scanner.feed(TWO).unwrap(), ScanStatus::Complete);
        assert_eq!(scanner.into_patches(), expected_two());
    }

    #[test]
    fn test_every_split_point_gives_same_patches() {
        for split in 0..=TWO.len() {
            let mut scanner = PatchScanner::new(2);
            let first = scanner.feed(&TWO[..split]).unwrap();
            if split < TWO.len() {
                assert_eq!(first, ScanStatus::NeedMore, "split at {}", split);
            }
            assert_eq!(scanner.feed(&TWO[split..]).unwrap(), ScanStatus::Complete);
            assert_eq!(scanner.into_patches(), expected_two(), "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut scanner = PatchScanner::new(2);
        let mut status = ScanStatus::NeedMore;
        for b in TWO {
            status = scanner.feed(std::slice::from_ref(b)).unwrap();
        }
        assert_eq!(status, ScanStatus::Complete);
        assert_eq!(scanner.received(), 2);
    }

    #[test]
    fn test_written_patches_scan_back() {
        let patches = vec![
            Patch::json(".a", "1"),
            Patch::bytes("0:3", &b"\r\n\n"[..]),
            Patch::text("[0:0] x", "").with_header("x-author", "alice"),
        ];
        let body = encode_patches(&patches);
        let mut scanner = PatchScanner::new(3);
        assert_eq!(scanner.feed(&body).unwrap(), ScanStatus::Complete);
        assert_eq!(scanner.into_patches(), patches);
    }

    #[test]
    fn test_range_keeps_trailing_whitespace() {
        let patches = vec![Patch::text("[1:2] ", "x"), Patch::json(".a", "1")];
        let mut scanner = PatchScanner::new(2);
        assert_eq!(
            scanner.feed(&encode_patches(&patches)).unwrap(),
            ScanStatus::Complete
        );
        assert_eq!(scanner.patches()[0].range, "[1:2] ");
        assert_eq!(scanner.into_patches(), patches);
    }

    #[test]
    fn test_bare_newlines_accepted() {
        let mut scanner = PatchScanner::new(1);
        let status = scanner
            .feed(b"\n\ncontent-length: 3\ncontent-range: text [0:0]\n\nabc")
            .unwrap();
        assert_eq!(status, ScanStatus::Complete);
        assert_eq!(scanner.patches()[0], Patch::text("[0:0]", "abc"));
    }

    #[test]
    fn test_missing_content_length_is_error() {
        let mut scanner = PatchScanner::new(1);
        let err = scanner
            .feed(b"Content-Range: json .a\r\n\r\n1")
            .unwrap_err();
        assert!(matches!(err, BraidError::MissingContentLength(_)));
    }

    #[test]
    fn test_missing_content_range_is_error() {
        let mut scanner = PatchScanner::new(1);
        let err = scanner.feed(b"Content-Length: 1\r\n\r\n1").unwrap_err();
        assert!(matches!(err, BraidError::Protocol(_)));
    }

    #[test]
    fn test_zero_expected_is_complete() {
        let mut scanner = PatchScanner::new(0);
        assert!(scanner.is_complete());
        assert_eq!(scanner.feed(b"garbage").unwrap(), ScanStatus::Complete);
        assert!(scanner.into_patches().is_empty());
    }

    #[test]
    fn test_partial_progress_is_visible() {
        let mut scanner = PatchScanner::new(2);
        let cut = TWO.len() - 1;
        assert_eq!(scanner.feed(&TWO[..cut]).unwrap(), ScanStatus::NeedMore);
        assert_eq!(scanner.received(), 1);
        assert_eq!(scanner.expected(), 2);
    }
}
