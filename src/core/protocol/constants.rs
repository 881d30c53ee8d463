//! Header names, status codes and framing constants used on the wire.

use http::HeaderName;

/// Braid header names, lowercase as `http` requires.
pub mod headers {
    use super::HeaderName;

    pub const VERSION: HeaderName = HeaderName::from_static("version");
    pub const PARENTS: HeaderName = HeaderName::from_static("parents");
    pub const PEER: HeaderName = HeaderName::from_static("peer");
    pub const SUBSCRIBE: HeaderName = HeaderName::from_static("subscribe");
    pub const HEARTBEATS: HeaderName = HeaderName::from_static("heartbeats");
    pub const PATCHES: HeaderName = HeaderName::from_static("patches");
    pub const CONTENT_RANGE: HeaderName = HeaderName::from_static("content-range");
    pub const MULTIPLEX_VERSION: HeaderName = HeaderName::from_static("multiplex-version");
    pub const MULTIPLEX_THROUGH: HeaderName = HeaderName::from_static("multiplex-through");
    pub const RANGE_REQUEST_ALLOW_METHODS: HeaderName =
        HeaderName::from_static("range-request-allow-methods");
    pub const RANGE_REQUEST_ALLOW_UNITS: HeaderName =
        HeaderName::from_static("range-request-allow-units");
    pub const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");
    pub const INCREMENTAL: HeaderName = HeaderName::from_static("incremental");
    pub const BAD_MULTIPLEXER: HeaderName = HeaderName::from_static("bad-multiplexer");
    pub const BAD_REQUEST: HeaderName = HeaderName::from_static("bad-request");
}

/// Non-standard status codes.
pub mod status {
    /// Subscription accepted, updates follow.
    pub const SUBSCRIPTION: u16 = 209;
    /// The real response was sent through a multiplexer.
    pub const RESPONDED_VIA_MULTIPLEXER: u16 = 293;
}

/// The only multiplexing protocol version spoken.
pub const MULTIPLEX_PROTOCOL_VERSION: &str = "1.0";

/// Path prefix of the multiplexer endpoints when not using the `MULTIPLEX` method.
pub const WELL_KNOWN_MULTIPLEXER_PREFIX: &str = "/.well-known/multiplexer/";

/// Custom method used to create and tear down multiplexers.
pub const MULTIPLEX_METHOD: &str = "MULTIPLEX";

/// Frame separator written between updates and as heartbeat.
pub const CRLF: &[u8] = b"\r\n";

/// Value of `Cache-Control` on subscription responses.
pub const SUBSCRIPTION_CACHE_CONTROL: &str = "no-cache, no-transform, no-store";

/// Extra blank lines written after each subscription update for Firefox.
pub const FIREFOX_EXTRA_NEWLINES: usize = 240;
