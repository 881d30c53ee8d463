//! Protocol message formatter.
//!
//! Converts patches and updates into Braid wire bytes. This is the write
//! half of the patch codec; [`PatchScanner`](super::PatchScanner) is the
//! read half.
//!
//! A list of patches is written as a `Patches: N` preamble followed by the
//! patch blocks, separated by a blank line:
//!
//! ```text
//! Patches: 2\r\n
//! \r\n
//! Content-Length: 1\r\n
//! Content-Range: json .a\r\n
//! \r\n
//! 1\r\n
//! \r\n
//! Content-Length: 2\r\n
//! Content-Range: json .b\r\n
//! \r\n
//! 22
//! ```
//!
//! A single patch is written as one block with no preamble.

use super::headers::format_version_header;
use crate::core::types::{Patch, Update, UpdateContent};
use bytes::{BufMut, Bytes, BytesMut};

/// Append a `key: value\r\n` line.
pub fn write_header(buffer: &mut BytesMut, key: &str, value: &str) {
    buffer.put_slice(key.as_bytes());
    buffer.put_slice(b": ");
    buffer.put_slice(value.as_bytes());
    buffer.put_slice(b"\r\n");
}

fn write_patch_block(buffer: &mut BytesMut, patch: &Patch) {
    write_header(buffer, "Content-Length", &patch.content.len().to_string());
    write_header(buffer, "Content-Range", &patch.content_range().to_header_value());
    for (name, value) in &patch.extra_headers {
        write_header(buffer, name, value);
    }
    buffer.put_slice(b"\r\n");
    buffer.put_slice(&patch.content);
}

/// Write a single patch without a `Patches` preamble.
pub fn write_patch(buffer: &mut BytesMut, patch: &Patch) {
    write_patch_block(buffer, patch);
}

/// Write the patch blocks of a list, without the preamble.
pub fn write_patch_blocks(buffer: &mut BytesMut, patches: &[Patch]) {
    for (i, patch) in patches.iter().enumerate() {
        if i > 0 {
            buffer.put_slice(b"\r\n\r\n");
        }
        write_patch_block(buffer, patch);
    }
}

/// Write `Patches: N` followed by every patch block.
pub fn write_patches(buffer: &mut BytesMut, patches: &[Patch]) {
    buffer.put_slice(format!("Patches: {}\r\n\r\n", patches.len()).as_bytes());
    write_patch_blocks(buffer, patches);
}

/// Encode a list of patches as an HTTP message body.
///
/// The count travels in the message's own `Patches` header, so the body
/// holds only the patch blocks. This is what `server::parse_update` reads
/// back.
///
/// ```
/// use braid_http::protocol::encode_patches;
/// use braid_http::Patch;
///
/// let patches = [Patch::json(".a", "1"), Patch::json(".b", "22")];
/// let body = encode_patches(&patches);
/// assert!(body.starts_with(b"Content-Length: 1\r\nContent-Range: json .a\r\n"));
/// ```
#[must_use]
pub fn encode_patches(patches: &[Patch]) -> Bytes {
    let mut buffer = BytesMut::new();
    write_patch_blocks(&mut buffer, patches);
    buffer.freeze()
}

/// Format one update as it is written into an open subscription stream.
///
/// The status line and headers are written as literal lines, followed by the
/// framed content and `1 + extra_newlines` CRLF separators. Patch content
/// is always a `Patches: N` block, even for a single patch.
#[must_use]
pub fn format_subscription_update(update: &Update, extra_newlines: usize) -> Bytes {
    let mut buffer = BytesMut::new();
    let status = update.status_or_default();
    buffer.put_slice(format!("HTTP {} {}\r\n", status, reason_phrase(status)).as_bytes());

    if !update.version.is_empty() {
        write_header(&mut buffer, "Version", &format_version_header(&update.version));
    }
    if !update.parents.is_empty() {
        write_header(&mut buffer, "Parents", &format_version_header(&update.parents));
    }
    for (k, v) in &update.extra_headers {
        write_header(&mut buffer, k, v);
    }

    match &update.content {
        UpdateContent::Body(body) => {
            write_header(&mut buffer, "Content-Length", &body.len().to_string());
            buffer.put_slice(b"\r\n");
            buffer.put_slice(body);
        }
        UpdateContent::Patches(patches) => write_patches(&mut buffer, patches),
    }

    for _ in 0..=extra_newlines {
        buffer.put_slice(b"\r\n");
    }
    buffer.freeze()
}

/// Reason phrase for a status line.
///
/// Knows the two Braid-specific codes and falls back to the standard phrase.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        209 => "Subscription",
        293 => "Responded via multiplexer",
        _ => http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown"),
    }
}

/// Escape everything outside printable ASCII as `\uXXXX`.
///
/// Characters outside the Basic Multilingual Plane become a UTF-16
/// surrogate pair, matching what JSON parsers expect.
///
/// ```
/// use braid_http::protocol::ascii_ify;
///
/// assert_eq!(ascii_ify("Hello 🎉"), "Hello \\ud83c\\udf89");
/// ```
#[must_use]
pub fn ascii_ify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if (' '..='~').contains(&c) {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Version;

    fn text(bytes: &[u8]) -> &str {
        std::str::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_write_patches_two() {
        let mut buf = BytesMut::new();
        write_patches(&mut buf, &[Patch::json(".a", "1"), Patch::json(".b", "22")]);
        assert_eq!(
            text(&buf),
            "Patches: 2\r\n\r\n\
             Content-Length: 1\r\nContent-Range: json .a\r\n\r\n1\
             \r\n\r\n\
             Content-Length: 2\r\nContent-Range: json .b\r\n\r\n22"
        );
    }

    #[test]
    fn test_write_single_patch_has_no_preamble() {
        let mut buf = BytesMut::new();
        write_patch(&mut buf, &Patch::json(".a", "1"));
        assert_eq!(text(&buf), "Content-Length: 1\r\nContent-Range: json .a\r\n\r\n1");
    }

    #[test]
    fn test_single_patch_matches_one_element_list() {
        let patch = Patch::json(".a", "1").with_header("X-Author", "bob");
        let mut single = BytesMut::new();
        write_patch(&mut single, &patch);
        let mut list = BytesMut::new();
        write_patches(&mut list, std::slice::from_ref(&patch));

        assert_eq!(&list[..b"Patches: 1\r\n\r\n".len()], b"Patches: 1\r\n\r\n");
        assert_eq!(&list[b"Patches: 1\r\n\r\n".len()..], &single[..]);
    }

    #[test]
    fn test_encoded_body_has_no_preamble() {
        let patches = [Patch::json(".a", "1"), Patch::json(".b", "22")];
        let mut framed = BytesMut::new();
        write_patches(&mut framed, &patches);
        let body = encode_patches(&patches);
        assert_eq!(&framed[b"Patches: 2\r\n\r\n".len()..], &body[..]);
    }

    #[test]
    fn test_empty_range_has_no_trailing_space() {
        let mut buf = BytesMut::new();
        write_patch(&mut buf, &Patch::new("everything", "", "x"));
        assert_eq!(text(&buf), "Content-Length: 1\r\nContent-Range: everything\r\n\r\nx");
    }

    #[test]
    fn test_content_length_counts_bytes() {
        let mut buf = BytesMut::new();
        write_patch(&mut buf, &Patch::text("[0:0]", "é"));
        assert!(text(&buf).starts_with("Content-Length: 2\r\n"));
    }

    #[test]
    fn test_extra_patch_headers_follow_content_range() {
        let mut buf = BytesMut::new();
        write_patch(&mut buf, &Patch::json(".a", "1").with_header("X-Author", "bob"));
        assert_eq!(
            text(&buf),
            "Content-Length: 1\r\nContent-Range: json .a\r\nx-author: bob\r\n\r\n1"
        );
    }

    #[test]
    fn test_format_subscription_body_update() {
        let update = Update::body("hi").with_version(Version::new("v1"));
        let bytes = format_subscription_update(&update, 1);
        assert_eq!(
            text(&bytes),
            "HTTP 200 OK\r\nVersion: \"v1\"\r\nContent-Length: 2\r\n\r\nhi\r\n\r\n"
        );
    }

    #[test]
    fn test_format_subscription_patches_update() {
        let update = Update::patches(vec![Patch::json(".a", "1"), Patch::json(".b", "2")])
            .with_parent(Version::Integer(1))
            .with_status(206);
        let s = format_subscription_update(&update, 0);
        let s = text(&s);
        assert!(s.starts_with("HTTP 206 Partial Content\r\nParents: 1\r\nPatches: 2\r\n\r\n"));
        assert!(s.ends_with("Content-Range: json .b\r\n\r\n2\r\n"));
    }

    #[test]
    fn test_format_subscription_single_patch_update() {
        let update = Update::patch(Patch::json(".a", "1"));
        let bytes = format_subscription_update(&update, 1);
        assert_eq!(
            text(&bytes),
            "HTTP 200 OK\r\nPatches: 1\r\n\r\n\
             Content-Length: 1\r\nContent-Range: json .a\r\n\r\n1\r\n\r\n"
        );
    }

    #[test]
    fn test_firefox_separators() {
        let bytes = format_subscription_update(&Update::empty(), 240);
        assert!(bytes.ends_with(&b"\r\n".repeat(241)));
        assert!(text(&bytes).starts_with("HTTP 200 OK\r\nContent-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_reason_phrase() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(209), "Subscription");
        assert_eq!(reason_phrase(293), "Responded via multiplexer");
        assert_eq!(reason_phrase(599), "Unknown");
    }

    #[test]
    fn test_ascii_ify_basic() {
        assert_eq!(ascii_ify("hello"), "hello");
        assert_eq!(ascii_ify("Test: 你好"), "Test: \\u4f60\\u597d");
        assert_eq!(ascii_ify("a\nb"), "a\\u000ab");
    }
}
