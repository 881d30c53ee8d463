//! Value of the `Subscribe` header.

use std::fmt;

/// What a client asked for with `Subscribe`.
///
/// The literal `true` becomes [`SubscribeMode::Enabled`]; any other value is
/// an application-defined descriptor kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubscribeMode {
    /// `Subscribe: true`.
    Enabled,
    /// Any other `Subscribe` value.
    Descriptor(String),
}

impl SubscribeMode {
    /// Parse a header value.
    ///
    /// ```
    /// use braid_http::SubscribeMode;
    ///
    /// assert_eq!(SubscribeMode::parse("true"), SubscribeMode::Enabled);
    /// assert_eq!(
    ///     SubscribeMode::parse("keep-alive"),
    ///     SubscribeMode::Descriptor("keep-alive".into())
    /// );
    /// ```
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value == "true" {
            SubscribeMode::Enabled
        } else {
            SubscribeMode::Descriptor(value.to_string())
        }
    }

    /// The value echoed back in the response `Subscribe` header.
    #[must_use]
    pub fn as_header_value(&self) -> &str {
        match self {
            SubscribeMode::Enabled => "true",
            SubscribeMode::Descriptor(s) => s,
        }
    }
}

impl fmt::Display for SubscribeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_header_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_header_value() {
        assert_eq!(SubscribeMode::parse(" true ").as_header_value(), "true");
        assert_eq!(SubscribeMode::parse("sse").to_string(), "sse");
    }
}
