//! A single patch in a Braid update.
//!
//! On the wire a patch is a small header block followed by its content:
//!
//! ```text
//! Content-Length: 3
//! Content-Range: json .name
//!
//! "x"
//! ```
//!
//! Headers other than `Content-Length` and `Content-Range` are kept in
//! [`Patch::extra_headers`] with lowercased names and written back after
//! `Content-Range`.

use super::ContentRange;
use bytes::Bytes;
use std::collections::BTreeMap;

/// One contiguous edit to a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    /// Addressing unit, e.g. `"json"` or `"text"`.
    pub unit: String,
    /// Range inside the unit. Opaque to this crate.
    pub range: String,
    /// Replacement bytes. Binary content is allowed.
    pub content: Bytes,
    /// Additional per-patch headers, keyed by lowercase name.
    pub extra_headers: BTreeMap<String, String>,
}

impl Patch {
    /// Create a patch with any unit.
    ///
    /// ```
    /// use braid_http::Patch;
    ///
    /// let patch = Patch::new("text", "[0:0]", "hi");
    /// assert_eq!(patch.content_length(), 2);
    /// assert_eq!(patch.content_str(), Some("hi"));
    /// ```
    #[must_use]
    pub fn new(unit: impl Into<String>, range: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Patch {
            unit: unit.into(),
            range: range.into(),
            content: content.into(),
            extra_headers: BTreeMap::new(),
        }
    }

    /// Create a JSON patch.
    #[inline]
    #[must_use]
    pub fn json(range: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self::new("json", range, content)
    }

    /// Create a text patch.
    #[inline]
    #[must_use]
    pub fn text(range: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self::new("text", range, content)
    }

    /// Create a bytes patch.
    #[inline]
    #[must_use]
    pub fn bytes(range: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self::new("bytes", range, content)
    }

    /// Add an extra header. The name is lowercased.
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.extra_headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Byte length of the content.
    #[inline]
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.content.len()
    }

    /// Content as UTF-8, if it is valid UTF-8.
    #[inline]
    #[must_use]
    pub fn content_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    /// Unit and range as a [`ContentRange`].
    #[must_use]
    pub fn content_range(&self) -> ContentRange {
        ContentRange::new(self.unit.clone(), self.range.clone())
    }

    /// Decode the content as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::Json`](crate::BraidError::Json) if the content
    /// is not valid JSON.
    pub fn content_json(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.content)?)
    }
}
