//! Key-value cache tier.
//!
//! The cache is an optimization, never a source of truth: every caller treats
//! a [`KeyValueStore`] failure as a miss and falls through to the next tier.

pub mod memory;
pub mod redis;

use std::time::Duration;

use crate::error::Result;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

/// Distributed cache with per-key TTL.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, expiring after `ttl`.
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`. Returns the number removed.
    fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    fn ping(&self) -> Result<()>;
}
