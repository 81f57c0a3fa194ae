//! In-process shared state backed by a sharded concurrent map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{SharedState, Versioned};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreResult;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    version: u64,
    expires_at: u64,
}

impl StoredValue {
    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// In-memory [`SharedState`] for single-process deployments and tests.
///
/// Compare-and-swap holds the shard lock of the key for the duration of the
/// version check and write, so it is atomic with respect to every other
/// operation on the same key. Expired entries are evicted lazily: they read
/// as absent but stay listed by [`SharedState::keys`] until deleted.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
    next_version: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create an empty store using the system clock for TTLs.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that evaluates TTLs against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            next_version: AtomicU64::new(1),
            clock,
        }
    }

    /// Number of held entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn stored(&self, value: Vec<u8>, ttl: Duration) -> StoredValue {
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        StoredValue {
            value,
            // Versions are never reused, even across delete and re-create.
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
            expires_at: self.clock.now_millis().saturating_add(ttl_millis),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedState for InMemoryStore {
    async fn get_versioned(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| Versioned {
                value: entry.value.clone(),
                version: entry.version,
            }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        let stored = self.stored(value, ttl);
        self.entries.insert(key.to_string(), stored);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied
                    .get()
                    .is_live(now)
                    .then(|| occupied.get().version);
                if current != expected {
                    trace!(key = %key, ?expected, ?current, "Compare-and-swap conflict");
                    return Ok(false);
                }
                occupied.insert(self.stored(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    trace!(key = %key, ?expected, "Compare-and-swap on vanished key");
                    return Ok(false);
                }
                vacant.insert(self.stored(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: Option<u64>) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let removed = self.entries.remove_if(key, |_, stored| {
            stored.is_live(now).then_some(stored.version) == expected
        });
        Ok(removed.is_some())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const TTL: Duration = Duration::from_secs(10);

    fn store_with_clock() -> (Arc<ManualClock>, InMemoryStore) {
        let clock = Arc::new(ManualClock::new(0));
        let store = InMemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStore::new();
        store.set("a", b"one".to_vec(), TTL).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let (clock, store) = store_with_clock();
        store.set("a", b"one".to_vec(), TTL).await.unwrap();

        clock.advance_secs(10);
        assert_eq!(store.get("a").await.unwrap(), None);
        // Still held until something deletes it
        assert_eq!(store.keys("a").await.unwrap(), vec!["a".to_string()]);
        assert!(store.delete("a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_swap_on_absent_key() {
        let store = InMemoryStore::new();
        assert!(store.compare_and_swap("a", None, b"1".to_vec(), TTL).await.unwrap());
        // A second create-only write loses
        assert!(!store.compare_and_swap("a", None, b"2".to_vec(), TTL).await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_swap_detects_stale_version() {
        let store = InMemoryStore::new();
        store.set("a", b"1".to_vec(), TTL).await.unwrap();
        let read = store.get_versioned("a").await.unwrap().unwrap();

        assert!(store
            .compare_and_swap("a", Some(read.version), b"2".to_vec(), TTL)
            .await
            .unwrap());
        // Same token again is now stale
        assert!(!store
            .compare_and_swap("a", Some(read.version), b"3".to_vec(), TTL)
            .await
            .unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_swap_treats_expired_as_absent() {
        let (clock, store) = store_with_clock();
        store.set("a", b"1".to_vec(), TTL).await.unwrap();
        clock.advance_secs(11);

        assert!(store.compare_and_swap("a", None, b"2".to_vec(), TTL).await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_versions_not_reused_after_delete() {
        let store = InMemoryStore::new();
        store.set("a", b"1".to_vec(), TTL).await.unwrap();
        let first = store.get_versioned("a").await.unwrap().unwrap();
        store.delete("a").await.unwrap();
        store.set("a", b"1".to_vec(), TTL).await.unwrap();
        let second = store.get_versioned("a").await.unwrap().unwrap();
        assert_ne!(first.version, second.version);
    }

    #[tokio::test]
    async fn test_compare_and_delete_spares_rewritten_key() {
        let (clock, store) = store_with_clock();
        store.set("a", b"1".to_vec(), TTL).await.unwrap();
        clock.advance_secs(11);

        // Recreated after the expiry was observed
        store.set("a", b"2".to_vec(), TTL).await.unwrap();
        assert!(!store.compare_and_delete("a", None).await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));

        clock.advance_secs(11);
        assert!(store.compare_and_delete("a", None).await.unwrap());
        assert!(store.is_empty());
        assert!(!store.compare_and_delete("a", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_checks_version() {
        let store = InMemoryStore::new();
        store.set("a", b"1".to_vec(), TTL).await.unwrap();
        let read = store.get_versioned("a").await.unwrap().unwrap();
        store.set("a", b"2".to_vec(), TTL).await.unwrap();

        assert!(!store.compare_and_delete("a", Some(read.version)).await.unwrap());
        let current = store.get_versioned("a").await.unwrap().unwrap();
        assert!(store.compare_and_delete("a", Some(current.version)).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = InMemoryStore::new();
        store.set("ratelimit:x", vec![], TTL).await.unwrap();
        store.set("ratelimit:y", vec![], TTL).await.unwrap();
        store.set("session:z", vec![], TTL).await.unwrap();

        let mut keys = store.keys("ratelimit:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ratelimit:x", "ratelimit:y"]);
    }
}
