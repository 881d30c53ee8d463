//! Cookie-scoped subscription store.
//!
//! Records which resources a client (identified by a cookie) is subscribed
//! to, so the information survives the response that created it. Entries
//! expire after a TTL.

use super::config::ServerConfig;
use crate::core::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Storage for subscription records, scoped by client cookie.
#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Store `value` under `key` for `cookie`, replacing any previous value.
    async fn set(&self, cookie: &str, key: &str, value: &str) -> Result<()>;

    /// Value stored under `key` for `cookie`, if present and not expired.
    async fn get(&self, cookie: &str, key: &str) -> Result<Option<String>>;

    /// Remove an entry. Returns true if a live entry was removed.
    async fn delete(&self, cookie: &str, key: &str) -> Result<bool>;
}

struct Entry {
    value: String,
    expires: Instant,
}

/// In-memory [`SubscriptionStore`] with a per-entry TTL.
///
/// Expired entries are invisible to `get` and removed on the next access.
#[derive(Clone)]
pub struct MemorySubscriptionStore {
    entries: Arc<Mutex<HashMap<(String, String), Entry>>>,
    ttl: Duration,
}

impl MemorySubscriptionStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// A store using [`ServerConfig::subscription_ttl`].
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.subscription_ttl)
    }

    #[inline]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        purge(&mut entries);
        entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySubscriptionStore {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl std::fmt::Debug for MemorySubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySubscriptionStore")
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn purge(entries: &mut HashMap<(String, String), Entry>) {
    let now = Instant::now();
    entries.retain(|_, entry| entry.expires > now);
}

fn key(cookie: &str, key: &str) -> (String, String) {
    (cookie.to_string(), key.to_string())
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn set(&self, cookie: &str, k: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        purge(&mut entries);
        entries.insert(
            key(cookie, k),
            Entry {
                value: value.to_string(),
                expires: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, cookie: &str, k: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        purge(&mut entries);
        Ok(entries.get(&key(cookie, k)).map(|e| e.value.clone()))
    }

    async fn delete(&self, cookie: &str, k: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        purge(&mut entries);
        Ok(entries.remove(&key(cookie, k)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemorySubscriptionStore::default();
        store.set("c1", "/doc", "true").await.unwrap();
        assert_eq!(store.get("c1", "/doc").await.unwrap().as_deref(), Some("true"));
        assert_eq!(store.get("c2", "/doc").await.unwrap(), None);

        assert!(store.delete("c1", "/doc").await.unwrap());
        assert!(!store.delete("c1", "/doc").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemorySubscriptionStore::new(Duration::from_secs(60));
        store.set("c1", "/doc", "true").await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.get("c1", "/doc").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.get("c1", "/doc").await.unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_ttl_from_config() {
        let config = ServerConfig {
            subscription_ttl: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(
            MemorySubscriptionStore::from_config(&config).ttl(),
            Duration::from_secs(5)
        );
    }
}
