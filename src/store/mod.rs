//! Shared counter store.
//!
//! The admission algorithm only needs a handful of primitives from the
//! backing store, each a single round trip. Any Redis-compatible service
//! satisfies the contract; an in-process implementation is provided for
//! single-node deployments and tests.

mod memory;
mod valkey;

use async_trait::async_trait;

use crate::error::Result;

pub use self::memory::MemoryCounterStore;
pub use self::valkey::RedisCounterStore;

/// TTL reported for a key that does not exist.
pub const TTL_MISSING: i64 = -2;
/// TTL reported for a key that exists without an expiry.
pub const TTL_PERSISTENT: i64 = -1;

/// Primitive operations over a shared, network-accessible counter service.
///
/// Failures of the service itself are reported as
/// [`TollgateError::Infrastructure`](crate::error::TollgateError::Infrastructure)
/// and must never be interpreted as an admission decision.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key`, creating it at 1 if absent.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Remaining seconds before `key` expires.
    ///
    /// Returns [`TTL_MISSING`] for an absent key and [`TTL_PERSISTENT`] for a
    /// key without an expiry.
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// Set an expiry on `key`. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool>;

    /// Read a raw value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a raw value, clearing any expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}
