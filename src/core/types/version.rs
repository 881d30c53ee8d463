//! Version identifier for the Braid-HTTP protocol.
//!
//! Version IDs are opaque to this crate: they are carried in the `Version` and
//! `Parents` headers and echoed back on updates. On the wire each ID is a JSON
//! value, most often a string:
//!
//! ```text
//! Version: "abc123"
//! Parents: "v1", "v2"
//! ```
//!
//! # Examples
//!
//! ```
//! use braid_http::Version;
//!
//! let v1 = Version::new("dkn7ov2vwg");
//! let v2: Version = 42i64.into();
//!
//! assert_eq!(v1.to_string(), "dkn7ov2vwg");
//! assert_eq!(v2.to_json(), serde_json::json!(42));
//! ```

use std::hash::Hash;

/// A version identifier in the Braid protocol.
///
/// Serializes to JSON as its underlying value, so a list of versions can be
/// written straight into a `Version` header.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Version {
    /// String-based version ID (UUIDs, hashes, `"alice-12"`, ...).
    String(String),

    /// Integer-based version ID.
    Integer(i64),
}

impl Version {
    /// Create a new string-based version.
    #[inline]
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Version::String(s.into())
    }

    /// Create a new integer-based version.
    #[inline]
    #[must_use]
    pub fn integer(n: i64) -> Self {
        Version::Integer(n)
    }

    /// Get the string value if this is a string version.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Version::String(s) => Some(s),
            Version::Integer(_) => None,
        }
    }

    /// Get the integer value if this is an integer version.
    #[inline]
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Version::Integer(i) => Some(*i),
            Version::String(_) => None,
        }
    }

    /// Convert to a JSON value.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Version::String(s) => serde_json::json!(s),
            Version::Integer(i) => serde_json::json!(i),
        }
    }

    /// Build a version from an arbitrary JSON value.
    ///
    /// Strings and integral numbers map to their variants; anything else is
    /// kept as its JSON text so that no header value is silently dropped.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Version::String(s),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Version::Integer(i),
                None => Version::String(n.to_string()),
            },
            v => Version::String(v.to_string()),
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Version::String(s) => write!(f, "{}", s),
            Version::Integer(i) => write!(f, "{}", i),
        }
    }
}

impl From<String> for Version {
    #[inline]
    fn from(s: String) -> Self {
        Version::String(s)
    }
}

impl From<&str> for Version {
    #[inline]
    fn from(s: &str) -> Self {
        Version::String(s.to_string())
    }
}

impl From<i64> for Version {
    #[inline]
    fn from(n: i64) -> Self {
        Version::Integer(n)
    }
}
