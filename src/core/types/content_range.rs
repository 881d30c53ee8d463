//! Content-Range specification for patches.
//!
//! Every patch on the wire names the region it replaces with a
//! `Content-Range` header made of a *unit* and a *range*:
//!
//! ```text
//! Content-Range: json .messages[1:1]
//!                ^^^^ ^^^^^^^^^^^^^^
//!                unit range
//! ```
//!
//! | Unit | Range syntax | Example |
//! |------|--------------|---------|
//! | `json` | JSON path | `.users[0].name` |
//! | `text` | `[start:end]` | `[5:10]` |
//! | `bytes` | `start:end` | `0:100` |
//! | `everything` | (empty) | |
//!
//! The range is opaque to this crate. A value with no space has an empty
//! range, which is how the legacy whole-body patch is expressed.

use crate::core::error::{BraidError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

static CONTENT_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\S+)(?: (.*))?$").expect("static regex"));

/// Unit and range of a patch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentRange {
    /// The addressing unit (`"json"`, `"text"`, `"bytes"`, ...).
    pub unit: String,
    /// The range inside that unit. May be empty.
    pub range: String,
}

impl ContentRange {
    /// Create a new content range.
    ///
    /// ```
    /// use braid_http::ContentRange;
    ///
    /// let range = ContentRange::new("json", ".users[0].name");
    /// assert_eq!(range.to_header_value(), "json .users[0].name");
    /// ```
    #[inline]
    #[must_use]
    pub fn new(unit: impl Into<String>, range: impl Into<String>) -> Self {
        ContentRange {
            unit: unit.into(),
            range: range.into(),
        }
    }

    /// Create a JSON content range.
    #[inline]
    #[must_use]
    pub fn json(range: impl Into<String>) -> Self {
        Self::new("json", range)
    }

    /// Create a text content range.
    #[inline]
    #[must_use]
    pub fn text(range: impl Into<String>) -> Self {
        Self::new("text", range)
    }

    /// Format as a `Content-Range` header value.
    ///
    /// The separating space is left out when the range is empty.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        if self.range.is_empty() {
            self.unit.clone()
        } else {
            format!("{} {}", self.unit, self.range)
        }
    }

    /// Parse a `Content-Range` header value.
    ///
    /// The first whitespace-free token is the unit and everything after the
    /// following single space is the range.
    ///
    /// ```
    /// use braid_http::ContentRange;
    ///
    /// let range = ContentRange::from_header_value("json .a b c").unwrap();
    /// assert_eq!(range.unit, "json");
    /// assert_eq!(range.range, ".a b c");
    ///
    /// assert_eq!(ContentRange::from_header_value("everything").unwrap().range, "");
    /// assert!(ContentRange::from_header_value("   ").is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::HeaderParse`] when the value has no unit at all.
    pub fn from_header_value(value: &str) -> Result<Self> {
        let caps = CONTENT_RANGE.captures(value).ok_or_else(|| {
            BraidError::HeaderParse(format!("Invalid Content-Range: {:?}", value))
        })?;
        Ok(ContentRange {
            unit: caps[1].to_string(),
            range: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header_value())
    }
}

impl FromStr for ContentRange {
    type Err = BraidError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_header_value(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_to_header_value() {
        assert_eq!(ContentRange::text("[0:5]").to_header_value(), "text [0:5]");
        assert_eq!(ContentRange::new("everything", "").to_header_value(), "everything");
    }

    #[test]
    fn test_content_range_from_header_value_complex() {
        let range: ContentRange = "json .users[0].name".parse().unwrap();
        assert_eq!(range, ContentRange::json(".users[0].name"));
    }

    #[test]
    fn test_content_range_keeps_inner_spaces() {
        let range = ContentRange::from_header_value("text  [1:2]").unwrap();
        assert_eq!(range.unit, "text");
        assert_eq!(range.range, " [1:2]");
    }

    #[test]
    fn test_content_range_without_range() {
        let range = ContentRange::from_header_value("bytes").unwrap();
        assert_eq!(range.unit, "bytes");
        assert!(range.range.is_empty());
    }

    #[test]
    fn test_content_range_from_header_value_invalid() {
        assert!(ContentRange::from_header_value("").is_err());
        assert!(matches!(
            ContentRange::from_header_value(" "),
            Err(BraidError::HeaderParse(_))
        ));
    }
}
