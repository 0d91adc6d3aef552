//! Shared volatile store
//!
//! A thin key-value contract over the cache that holds token liveness records
//! and per-subject token indexes. Implementations know nothing about tokens:
//! they store strings with a TTL and manage string sets.
//!
//! - `RedisStore` talks to a (possibly clustered) Redis deployment shared by
//!   every service instance.
//! - `MemoryStore` keeps everything in process, for tests and local runs.

pub mod breaker;
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, StoreConfig};

/// Store errors
///
/// Every variant except `Protocol` means the store could not be reached in
/// time and the caller should answer "service unavailable".
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Store operation timed out")]
    Timeout,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store circuit breaker is open")]
    CircuitOpen,

    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

impl StoreError {
    /// True when the failure is a reachability problem rather than a bad reply
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, StoreError::Protocol(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value substrate with per-key expiry and set membership.
///
/// All operations are remote calls that may fail; none of them interpret the
/// values they store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl_secs`. Overwrites.
    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Idempotent delete; returns whether a key was actually removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn add_to_set(&self, set_key: &str, members: &[String]) -> StoreResult<bool>;

    /// Members of a set, empty when the set does not exist.
    async fn members_of(&self, set_key: &str) -> StoreResult<Vec<String>>;

    /// Reset the expiry of an existing key; false when the key is absent.
    async fn set_ttl(&self, key: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// Liveness probe for health reporting. Never errors.
    async fn ping(&self) -> bool;
}
