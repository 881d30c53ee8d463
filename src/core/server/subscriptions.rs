//! Live subscriptions by peer and resource.

use super::response::BraidResponse;
use crate::core::types::Update;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Open subscription responses, keyed by `(peer, url)`.
///
/// Cheap to clone; clones share the same map. A peer has at most one
/// subscription per resource: inserting again replaces the old one.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<HashMap<(String, String), BraidResponse>>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription, returning the one it replaced.
    pub fn insert(&self, peer: &str, url: &str, res: BraidResponse) -> Option<BraidResponse> {
        self.inner
            .lock()
            .insert((peer.to_string(), url.to_string()), res)
    }

    /// Remove `res` if it is still the subscription registered for
    /// `(peer, url)`.
    pub fn remove(&self, peer: &str, url: &str, res: &BraidResponse) -> bool {
        let mut map = self.inner.lock();
        let key = (peer.to_string(), url.to_string());
        if map.get(&key).is_some_and(|current| current.ptr_eq(res)) {
            map.remove(&key);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Number of subscriptions to `url`.
    #[must_use]
    pub fn subscribers(&self, url: &str) -> usize {
        self.inner.lock().keys().filter(|(_, u)| u == url).count()
    }

    /// Send `update` to every subscriber of `url` except `except_peer`.
    ///
    /// Subscribers that can no longer be written to are dropped. Returns the
    /// number of subscribers the update reached.
    pub fn broadcast(&self, url: &str, except_peer: Option<&str>, update: &Update) -> usize {
        let targets: Vec<((String, String), BraidResponse)> = self
            .inner
            .lock()
            .iter()
            .filter(|((peer, u), _)| u == url && Some(peer.as_str()) != except_peer)
            .map(|(k, res)| (k.clone(), res.clone()))
            .collect();

        let mut sent = 0;
        for ((peer, u), res) in targets {
            match res.send_update(update) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::debug!("Dropping subscription of {} to {}: {}", peer, u, e);
                    self.remove(&peer, &u, &res);
                }
            }
        }
        sent
    }
}
