//! Cache-aside collections.
//!
//! A [`CacheAsideCollection`] owns the keys `"<name>:all"` and `"<name>:<id>"`
//! in the key-value tier. Reads go cache → loader (single-flight) → populate;
//! writers call [`CacheAsideCollection::invalidate_member`] before reporting
//! success so the next read observes the persistent store.

pub mod single_flight;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{CoreError, Result};
use crate::kv::KeyValueStore;

pub use self::single_flight::SingleFlight;

/// How strictly a collection guards against caching a load that raced a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Plain cache-aside: a load that overlapped a write may repopulate stale
    /// data until the TTL expires.
    Eventual,
    /// Loads that overlapped an invalidation in this process are returned to
    /// their caller but never written to the cache.
    Strict,
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub consistency: Consistency,
    /// Bounded page size for list loaders.
    pub page_size: usize,
    pub invalidation_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            consistency: Consistency::Strict,
            page_size: 100,
            invalidation_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Something holding cached state derived from the persistent store.
pub trait Invalidate: Send + Sync {
    fn collection(&self) -> &str;

    /// Drop the cached list. Must not return `Ok` unless the key is gone.
    fn invalidate(&self) -> Result<()>;
}

type Loader<T> = Box<dyn Fn() -> Result<Vec<T>> + Send + Sync>;
type Fallback<T> = Box<dyn Fn() -> Vec<T> + Send + Sync>;

pub struct CacheAsideCollection<T> {
    name: String,
    kv: Arc<dyn KeyValueStore>,
    policy: CachePolicy,
    loader: Loader<T>,
    fallback: Option<Fallback<T>>,
    list_flights: SingleFlight<Vec<T>>,
    member_flights: SingleFlight<Option<T>>,
    generation: AtomicU64,
    populate: Mutex<()>,
}

impl<T> CacheAsideCollection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        kv: Arc<dyn KeyValueStore>,
        policy: CachePolicy,
        loader: impl Fn() -> Result<Vec<T>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kv,
            policy,
            loader: Box::new(loader),
            fallback: None,
            list_flights: SingleFlight::new(),
            member_flights: SingleFlight::new(),
            generation: AtomicU64::new(0),
            populate: Mutex::new(()),
        }
    }

    /// Serve `compute()` (uncached) when the loader fails.
    pub fn with_fallback(mut self, compute: impl Fn() -> Vec<T> + Send + Sync + 'static) -> Self {
        self.fallback = Some(Box::new(compute));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn list_key(&self) -> String {
        format!("{}:all", self.name)
    }

    pub fn member_key(&self, id: &str) -> String {
        format!("{}:{}", self.name, id)
    }

    /// The whole collection (first page), from cache when possible.
    pub fn get(&self) -> Result<Vec<T>> {
        let key = self.list_key();
        if let Some(items) = self.read_cached::<Vec<T>>(&key) {
            debug!(collection = %self.name, "cache hit");
            return Ok(items);
        }

        let loaded = self.list_flights.run(&key, || {
            let generation = self.generation.load(Ordering::SeqCst);
            let items = (self.loader)()?;
            self.populate(&key, &items, generation);
            Ok(items)
        });

        match loaded {
            Ok(items) => Ok(items),
            Err(e) => match &self.fallback {
                Some(compute) => {
                    warn!(collection = %self.name, error = %e, "loader failed, serving computed fallback");
                    Ok(compute())
                }
                None => Err(e),
            },
        }
    }

    /// A single member. Absent members are not cached.
    pub fn get_member(
        &self,
        id: &str,
        load: impl FnOnce() -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let key = self.member_key(id);
        if let Some(item) = self.read_cached::<T>(&key) {
            return Ok(Some(item));
        }
        self.member_flights.run(&key, || {
            let generation = self.generation.load(Ordering::SeqCst);
            let item = load()?;
            if let Some(item) = &item {
                self.populate(&key, item, generation);
            }
            Ok(item)
        })
    }

    /// Drop the list key. Retries, then surfaces the failure.
    pub fn invalidate(&self) -> Result<()> {
        self.bump();
        self.delete_with_retry(&self.list_key())
    }

    /// Drop a member key and the list key.
    pub fn invalidate_member(&self, id: &str) -> Result<()> {
        self.bump();
        self.delete_with_retry(&self.member_key(id))?;
        self.delete_with_retry(&self.list_key())
    }

    fn bump(&self) {
        let _guard = self.populate.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn read_cached<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        match self.kv.get(key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(%key, error = %e, "undecodable cache entry, treating as miss");
                    if let Err(e) = self.kv.delete(key) {
                        warn!(%key, error = %e, "failed to drop undecodable cache entry");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "cache read failed, falling through");
                None
            }
        }
    }

    fn populate<V: Serialize>(&self, key: &str, value: &V, generation: u64) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(%key, error = %e, "value not cacheable");
                return;
            }
        };
        let _guard = self.populate.lock();
        if self.policy.consistency == Consistency::Strict
            && self.generation.load(Ordering::SeqCst) != generation
        {
            debug!(%key, "load raced an invalidation, not caching");
            return;
        }
        if let Err(e) = self.kv.set_ex(key, &raw, self.policy.ttl) {
            warn!(%key, error = %e, "cache populate failed");
        }
    }

    fn delete_with_retry(&self, key: &str) -> Result<()> {
        delete_with_retry(self.kv.as_ref(), key, &self.policy)
    }
}

/// Delete `key`, retrying up to `policy.invalidation_attempts` times with a
/// linear backoff. The last error is returned once attempts run out.
pub fn delete_with_retry(kv: &dyn KeyValueStore, key: &str, policy: &CachePolicy) -> Result<()> {
    let attempts = policy.invalidation_attempts.max(1);
    let mut last: Option<CoreError> = None;
    for attempt in 1..=attempts {
        match kv.delete(key) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(%key, attempt, error = %e, "cache invalidation failed");
                last = Some(e);
                if attempt < attempts {
                    std::thread::sleep(policy.retry_backoff * attempt);
                }
            }
        }
    }
    error!(%key, attempts, "cache invalidation exhausted retries, entry may be stale");
    Err(last.unwrap_or_else(|| CoreError::kv("invalidation failed")))
}

impl<T> Invalidate for CacheAsideCollection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn collection(&self) -> &str {
        &self.name
    }

    fn invalidate(&self) -> Result<()> {
        CacheAsideCollection::invalidate(self)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Key-value doubles for exercising failure paths.

    use super::*;
    use crate::kv::MemoryKv;
    use std::sync::atomic::AtomicUsize;

    /// Wraps a [`MemoryKv`]; individual operations can be made to fail.
    #[derive(Default)]
    pub struct FlakyKv {
        pub inner: MemoryKv,
        pub fail_reads: std::sync::atomic::AtomicBool,
        pub fail_writes: std::sync::atomic::AtomicBool,
        /// Number of upcoming deletes that fail.
        pub failing_deletes: AtomicUsize,
        pub sets: AtomicUsize,
    }

    impl KeyValueStore for FlakyKv {
        fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(CoreError::kv("read refused"));
            }
            self.inner.get(key)
        }

        fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CoreError::kv("write refused"));
            }
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set_ex(key, value, ttl)
        }

        fn delete(&self, key: &str) -> Result<()> {
            let pending = self.failing_deletes.load(Ordering::SeqCst);
            if pending > 0 {
                self.failing_deletes.store(pending - 1, Ordering::SeqCst);
                return Err(CoreError::kv("delete refused"));
            }
            self.inner.delete(key)
        }

        fn delete_prefix(&self, prefix: &str) -> Result<usize> {
            self.inner.delete_prefix(prefix)
        }

        fn ping(&self) -> Result<()> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(CoreError::kv("ping refused"));
            }
            Ok(())
        }
    }
}
