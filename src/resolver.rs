//! Three-tier configuration lookup: process memory → key-value cache →
//! `configuration` table.
//!
//! A lower-tier hit populates the tiers above it. Reads never fail: when
//! every tier misses (or the table is unreachable) the caller's default is
//! returned and nothing is cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::{self, CachePolicy, SingleFlight};
use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::storage::{self, SqliteStore};

/// TTL of `config:<key>` entries in the key-value tier.
pub const CONFIG_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Authoritative home of configuration values.
pub trait ConfigSource: Send + Sync {
    fn load_config(&self, key: &str) -> Result<Option<String>>;

    fn store_config(&self, key: &str, raw: &str) -> Result<()>;
}

impl ConfigSource for SqliteStore {
    fn load_config(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT config_value FROM configuration WHERE config_key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
        })
    }

    fn store_config(&self, key: &str, raw: &str) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO configuration (config_key, config_value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(config_key) DO UPDATE
                 SET config_value = excluded.config_value, updated_at = excluded.updated_at",
                params![key, raw, storage::ts(storage::now_ms())],
            )?;
            Ok(())
        })
    }
}

/// Interpret a stored value: JSON objects/arrays become structured values,
/// anything else is a plain string.
pub fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str(raw) {
            return v;
        }
    }
    Value::String(raw.to_string())
}

fn raw_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct ConfigResolver {
    local: RwLock<HashMap<String, Value>>,
    kv: Arc<dyn KeyValueStore>,
    source: Arc<dyn ConfigSource>,
    ttl: Duration,
    /// Retry budget for dropping `config:<key>` entries.
    invalidation: CachePolicy,
    flights: SingleFlight<Option<String>>,
}

impl ConfigResolver {
    pub fn new(kv: Arc<dyn KeyValueStore>, source: Arc<dyn ConfigSource>) -> Self {
        Self::with_ttl(kv, source, CONFIG_CACHE_TTL)
    }

    pub fn with_ttl(kv: Arc<dyn KeyValueStore>, source: Arc<dyn ConfigSource>, ttl: Duration) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            kv,
            source,
            ttl,
            invalidation: CachePolicy::default(),
            flights: SingleFlight::new(),
        }
    }

    /// Use the attempts and backoff of `policy` when invalidating.
    pub fn with_invalidation(mut self, policy: &CachePolicy) -> Self {
        self.invalidation = policy.clone();
        self
    }

    fn cache_key(key: &str) -> String {
        format!("config:{key}")
    }

    pub fn resolve(&self, key: &str, default: impl Into<Value>) -> Value {
        if let Some(v) = self.local.read().get(key) {
            return v.clone();
        }

        let cache_key = Self::cache_key(key);
        match self.kv.get(&cache_key) {
            Ok(Some(raw)) => {
                let value = parse_value(&raw);
                self.local.write().insert(key.to_string(), value.clone());
                return value;
            }
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "config cache read failed"),
        }

        let loaded = self.flights.run(key, || {
            let raw = self.source.load_config(key)?;
            if let Some(raw) = &raw {
                if let Err(e) = self.kv.set_ex(&cache_key, raw, self.ttl) {
                    warn!(%key, error = %e, "config cache write-back failed");
                }
            }
            Ok(raw)
        });

        match loaded {
            Ok(Some(raw)) => {
                debug!(%key, "config loaded from persistent store");
                let value = parse_value(&raw);
                self.local.write().insert(key.to_string(), value.clone());
                value
            }
            Ok(None) => default.into(),
            Err(e) => {
                error!(%key, error = %e, "config lookup failed, using default");
                default.into()
            }
        }
    }

    pub fn resolve_str(&self, key: &str, default: &str) -> String {
        raw_value(&self.resolve(key, default))
    }

    pub fn resolve_u64(&self, key: &str, default: u64) -> u64 {
        match self.resolve(key, default) {
            Value::Number(n) => n.as_u64().unwrap_or_else(|| {
                warn!(%key, value = %n, "config value is not a u64, using default");
                default
            }),
            Value::String(s) => s.trim().parse().unwrap_or_else(|_| {
                warn!(%key, value = %s, "config value is not a u64, using default");
                default
            }),
            other => {
                warn!(%key, value = %other, "config value is not a u64, using default");
                default
            }
        }
    }

    pub fn resolve_bool(&self, key: &str, default: bool) -> bool {
        match self.resolve(key, default) {
            Value::Bool(b) => b,
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            },
            _ => default,
        }
    }

    /// Administrator write: update the table, then drop the cached copies.
    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.source.store_config(key, &raw_value(value))?;
        self.invalidate(key)?;
        info!(%key, "configuration updated");
        Ok(())
    }

    /// Forget `key` in this process and in the key-value tier.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.local.write().remove(key);
        cache::delete_with_retry(self.kv.as_ref(), &Self::cache_key(key), &self.invalidation)
    }

    /// Forget every configuration value in this process and the key-value tier.
    pub fn flush(&self) -> Result<usize> {
        self.local.write().clear();
        let removed = self.kv.delete_prefix("config:")?;
        info!(removed, "configuration cache flushed");
        Ok(removed)
    }

    /// Whether `key` is held in process memory.
    pub fn is_memoized(&self, key: &str) -> bool {
        self.local.read().contains_key(key)
    }
}
