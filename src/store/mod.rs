//! Shared state abstraction.
//!
//! Every service instance talks to the same key-value store through the
//! [`SharedState`] trait. Beyond plain get/set/delete with per-key TTL, the
//! trait requires an atomic compare-and-swap on a version token, which the
//! rate limiter uses to make its read-modify-write cycle safe when several
//! instances race on the same key.

mod memory;

pub use memory::InMemoryStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// A stored value together with the version token it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Raw stored bytes
    pub value: Vec<u8>,
    /// Opaque token; changes on every write to the key
    pub version: u64,
}

/// Trait for shared key-value stores reachable by all instances.
#[async_trait]
pub trait SharedState: Send + Sync {
    /// Read a value and its version token. Expired keys read as `None`.
    async fn get_versioned(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Read a value.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get_versioned(key).await?.map(|v| v.value))
    }

    /// Unconditionally write a value with a TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()>;

    /// Write `value` only if the key is still at `expected`.
    ///
    /// `expected == None` means the key must be absent (or expired).
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Delete a key. Returns whether anything was held under it.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete a key only if it is still at `expected`.
    ///
    /// `expected == None` deletes a key that is held but already expired,
    /// and leaves a live one alone. Returns whether the key was removed.
    async fn compare_and_delete(&self, key: &str, expected: Option<u64>) -> StoreResult<bool>;

    /// List held keys starting with `prefix`.
    ///
    /// Stores that evict lazily may include keys whose TTL has already passed.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}
