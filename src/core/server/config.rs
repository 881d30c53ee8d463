//! Server configuration for [`BraidLayer`](super::BraidLayer).

use crate::core::protocol::constants::FIREFOX_EXTRA_NEWLINES;
use std::time::Duration;

/// Options controlling the `braidify` middleware.
///
/// ```
/// use braid_http::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig {
///     enable_multiplex: false,
///     idle_timeout: Some(Duration::from_secs(30)),
///     ..Default::default()
/// };
/// assert_eq!(config.firefox_extra_newlines, 240);
/// ```
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Serve the multiplexer endpoints and honor `Multiplex-Through`.
    pub enable_multiplex: bool,

    /// Close a streamed response that sees no traffic for this long.
    /// Subscriptions and multiplexers are exempt.
    pub idle_timeout: Option<Duration>,

    /// Extra CRLFs written after each subscription update to Firefox.
    pub firefox_extra_newlines: usize,

    /// How long entries live in a
    /// [`MemorySubscriptionStore`](super::MemorySubscriptionStore) built
    /// from this config.
    pub subscription_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            enable_multiplex: true,
            idle_timeout: None,
            firefox_extra_newlines: FIREFOX_EXTRA_NEWLINES,
            subscription_ttl: Duration::from_secs(3 * 60 * 60),
        }
    }
}

impl ServerConfig {
    /// Extra separators to write after a subscription update.
    #[inline]
    #[must_use]
    pub fn extra_newlines(&self, is_firefox: bool) -> usize {
        if is_firefox {
            self.firefox_extra_newlines
        } else {
            1
        }
    }
}
