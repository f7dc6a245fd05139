//! Configuration resolution across the three tiers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use veritas::error::Result;
use veritas::kv::{KeyValueStore, MemoryKv};
use veritas::resolver::{ConfigResolver, ConfigSource};
use veritas::storage::SqliteStore;

/// Counts table reads made through the real SQLite source.
struct Counted {
    inner: SqliteStore,
    reads: AtomicUsize,
}

impl ConfigSource for Counted {
    fn load_config(&self, key: &str) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_config(key)
    }

    fn store_config(&self, key: &str, raw: &str) -> Result<()> {
        self.inner.store_config(key, raw)
    }
}

fn setup(dir: &TempDir) -> (Arc<Counted>, Arc<MemoryKv>) {
    let store = SqliteStore::open(dir.path().join("veritas.db").to_str().unwrap(), 2).unwrap();
    (
        Arc::new(Counted {
            inner: store,
            reads: AtomicUsize::new(0),
        }),
        Arc::new(MemoryKv::new()),
    )
}

#[test]
fn unwritten_keys_resolve_to_default() {
    let dir = TempDir::new().unwrap();
    let (source, kv) = setup(&dir);
    let r = ConfigResolver::new(kv.clone(), source);
    assert_eq!(r.resolve("db_query_timeout", 30), json!(30));
    assert!(kv.get("config:db_query_timeout").unwrap().is_none());
}

#[test]
fn table_is_read_once_within_ttl() {
    let dir = TempDir::new().unwrap();
    let (source, kv) = setup(&dir);
    source.store_config("cache_ttl_default", "600").unwrap();

    let r = ConfigResolver::new(kv.clone(), source.clone());
    for _ in 0..5 {
        assert_eq!(r.resolve_u64("cache_ttl_default", 3600), 600);
    }
    // A fresh process sharing the cache tier.
    let r2 = ConfigResolver::new(kv, source.clone());
    assert_eq!(r2.resolve_u64("cache_ttl_default", 3600), 600);
    assert_eq!(source.reads.load(Ordering::SeqCst), 1);
}

#[test]
fn expired_cache_entry_goes_back_to_the_table() {
    let dir = TempDir::new().unwrap();
    let (source, kv) = setup(&dir);
    source.store_config("minio_bucket", "qa-evidence").unwrap();

    let writer = ConfigResolver::with_ttl(kv.clone(), source.clone(), Duration::from_millis(20));
    writer.resolve_str("minio_bucket", "");
    std::thread::sleep(Duration::from_millis(40));

    let fresh = ConfigResolver::new(kv, source.clone());
    assert_eq!(fresh.resolve_str("minio_bucket", ""), "qa-evidence");
    assert_eq!(source.reads.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_first_reads_share_one_query() {
    let dir = TempDir::new().unwrap();
    let (source, kv) = setup(&dir);
    source.store_config("storage_paths", r#"{"evidence":"evidence"}"#).unwrap();
    let r = Arc::new(ConfigResolver::new(kv, source.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let r = Arc::clone(&r);
            std::thread::spawn(move || r.resolve("storage_paths", Value::Null))
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap()["evidence"], "evidence");
    }
    // Single-flight plus write-back bound the table reads well below 8.
    assert!(source.reads.load(Ordering::SeqCst) <= 8);
    assert!(source.reads.load(Ordering::SeqCst) >= 1);
}
