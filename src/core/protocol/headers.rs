//! Shared header parsing and formatting for Braid-HTTP.
//!
//! # Header Formats
//!
//! | Header | Format | Example |
//! |--------|--------|---------|
//! | Version | JSON values, comma-separated | `"v1", "v2"` |
//! | Parents | JSON values, comma-separated | `"v0"` |
//! | Subscribe | `true` or a descriptor | `true` |
//! | Heartbeats | Seconds, optional unit | `30`, `0.5`, `500ms` |
//! | Patches | Integer | `2` |
//!
//! Version lists are read as the inside of a JSON array. Values that are not
//! valid JSON (bare tokens such as `v1, v2`) fall back to a Structured
//! Headers list.
//!
//! ```
//! use braid_http::protocol::{format_version_header, parse_version_header};
//! use braid_http::Version;
//!
//! let versions = parse_version_header(r#""v1", 2"#).unwrap();
//! assert_eq!(versions, vec![Version::new("v1"), Version::Integer(2)]);
//! assert_eq!(format_version_header(&versions), r#""v1", 2"#);
//! ```

use super::formatter::ascii_ify;
use crate::core::error::{BraidError, Result};
use crate::core::types::{SubscribeMode, Version};
use std::time::Duration;

/// Parse a `Version` or `Parents` header value.
///
/// # Errors
///
/// Returns [`BraidError::HeaderParse`] if the value is neither a JSON list
/// body nor a Structured Headers list of strings, tokens or integers.
pub fn parse_version_header(value: &str) -> Result<Vec<Version>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Vec<serde_json::Value>>(&format!("[{}]", trimmed)) {
        Ok(values) => Ok(values.into_iter().map(Version::from_json).collect()),
        Err(_) => parse_structured_versions(trimmed),
    }
}

fn parse_structured_versions(value: &str) -> Result<Vec<Version>> {
    use sfv::{BareItem, ListEntry, Parser};

    let list = Parser::new(value)
        .parse_list()
        .map_err(|e| BraidError::HeaderParse(format!("Invalid version list {:?}: {}", value, e)))?;

    let mut versions = Vec::with_capacity(list.len());
    for member in list {
        match member {
            ListEntry::Item(item) => match item.bare_item {
                BareItem::String(s) => versions.push(Version::String(s.as_str().to_owned())),
                BareItem::Token(t) => versions.push(Version::String(t.as_str().to_owned())),
                BareItem::Integer(i) => versions.push(Version::Integer(i64::from(i))),
                _ => {
                    return Err(BraidError::HeaderParse(
                        "Unsupported item type in version list".to_string(),
                    ))
                }
            },
            ListEntry::InnerList(_) => {
                return Err(BraidError::HeaderParse(
                    "Inner lists not supported for versions".to_string(),
                ))
            }
        }
    }
    Ok(versions)
}

/// Format a `Version` or `Parents` header value.
///
/// Each ID is JSON-encoded with non-ASCII characters escaped as `\uXXXX`,
/// then joined with `", "`.
#[must_use]
pub fn format_version_header(versions: &[Version]) -> String {
    versions
        .iter()
        .map(|v| ascii_ify(&v.to_json().to_string()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a `Heartbeats` header value into an interval.
///
/// Returns `None` for anything that is not a finite, positive number of
/// seconds. A trailing `s` or `ms` unit is accepted.
///
/// ```
/// use braid_http::protocol::parse_heartbeat;
/// use std::time::Duration;
///
/// assert_eq!(parse_heartbeat("5"), Some(Duration::from_secs(5)));
/// assert_eq!(parse_heartbeat("0.5s"), Some(Duration::from_millis(500)));
/// assert_eq!(parse_heartbeat("250ms"), Some(Duration::from_millis(250)));
/// assert_eq!(parse_heartbeat("soon"), None);
/// ```
#[must_use]
pub fn parse_heartbeat(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    let (number, scale) = if let Some(ms) = trimmed.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(s) = trimmed.strip_suffix('s') {
        (s, 1.0)
    } else {
        (trimmed, 1.0)
    };
    let seconds = number.trim().parse::<f64>().ok()? * scale;
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}

/// Parse a `Subscribe` header value.
#[inline]
#[must_use]
pub fn parse_subscribe(value: &str) -> SubscribeMode {
    SubscribeMode::parse(value)
}

/// Parse a `Patches` header value.
///
/// # Errors
///
/// Returns [`BraidError::HeaderParse`] if the value is not a non-negative integer.
pub fn parse_patches_count(value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| BraidError::HeaderParse(format!("Invalid Patches header: {:?}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_header() {
        let result = parse_version_header(r#""v1", "v2", "v3""#).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], Version::new("v1"));
    }

    #[test]
    fn test_parse_version_header_integers() {
        let result = parse_version_header("11, 12, \"v1\"").unwrap();
        assert_eq!(
            result,
            vec![Version::Integer(11), Version::Integer(12), Version::new("v1")]
        );
    }

    #[test]
    fn test_parse_version_header_unquoted() {
        let result = parse_version_header("v1, v2").unwrap();
        assert_eq!(result, vec![Version::new("v1"), Version::new("v2")]);
    }

    #[test]
    fn test_parse_version_header_structured_tokens_and_integers() {
        let result = parse_version_header("v1, 7, \"v 2\"").unwrap();
        assert_eq!(
            result,
            vec![Version::new("v1"), Version::Integer(7), Version::new("v 2")]
        );
        assert!(parse_version_header("v1, (a b)").is_err());
    }

    #[test]
    fn test_parse_version_header_empty() {
        assert!(parse_version_header("").unwrap().is_empty());
        assert!(parse_version_header("  ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_version_header_rejects_garbage() {
        assert!(parse_version_header("\"unterminated").is_err());
    }

    #[test]
    fn test_format_version_header_escapes_non_ascii() {
        let header = format_version_header(&[Version::new("café"), Version::Integer(3)]);
        assert_eq!(header, "\"caf\\u00e9\", 3");
        assert!(header.is_ascii());
    }

    #[test]
    fn test_format_then_parse_keeps_ids() {
        let versions = vec![Version::new("a,b"), Version::new("ü"), Version::Integer(-1)];
        let parsed = parse_version_header(&format_version_header(&versions)).unwrap();
        assert_eq!(parsed, versions);
    }

    #[test]
    fn test_parse_heartbeat_rejects_non_positive() {
        assert_eq!(parse_heartbeat("0"), None);
        assert_eq!(parse_heartbeat("-3"), None);
        assert_eq!(parse_heartbeat("inf"), None);
        assert_eq!(parse_heartbeat("NaN"), None);
        assert_eq!(parse_heartbeat(""), None);
    }

    #[test]
    fn test_parse_patches_count() {
        assert_eq!(parse_patches_count(" 2 ").unwrap(), 2);
        assert!(parse_patches_count("-1").is_err());
        assert!(parse_patches_count("two").is_err());
    }
}
