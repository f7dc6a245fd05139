//! Bootstrap settings loaded from TOML.
//!
//! These are the values needed before the database is reachable. Anything
//! that can change at runtime (bucket, endpoint, cache TTL, query timeout) is
//! resolved through the `configuration` table with these as defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CachePolicy, Consistency};

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV: &str = "VERITAS_CONFIG";
/// Settings file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "veritas.toml";

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub objects: ObjectSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse settings file: {}", path.display()))?;
        info!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Load from, in order:
    /// 1. `explicit` (the `--config` flag), which must load if given.
    /// 2. The path in `VERITAS_CONFIG`.
    /// 3. `./veritas.toml`.
    /// 4. Compiled-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(s) => return Ok(s),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "VERITAS_CONFIG set but file could not be loaded, trying fallback"
                ),
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(s) => return Ok(s),
                Err(e) => warn!(
                    path = %local.display(),
                    error = %e,
                    "settings file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no settings file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    /// Default for `db_connection_pool_size`.
    pub pool_size: u32,
    /// Default for `db_query_timeout` (seconds).
    pub query_timeout_sec: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/veritas.db"),
            pool_size: 10,
            query_timeout_sec: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: KvBackend,
    /// Default for `redis_host`.
    pub redis_host: String,
    /// Default for `redis_port`.
    pub redis_port: u16,
    pub pool_size: u32,
    pub io_timeout_ms: u64,
    /// Default for `cache_ttl_default` (seconds).
    pub ttl_sec: u64,
    pub consistency: Consistency,
    pub page_size: usize,
    pub invalidation_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: KvBackend::Memory,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            pool_size: 8,
            io_timeout_ms: 2000,
            ttl_sec: 300,
            consistency: Consistency::Strict,
            page_size: 100,
            invalidation_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl CacheSettings {
    /// Collection policy with `ttl` taking the place of `ttl_sec`.
    pub fn policy(&self, ttl: Duration) -> CachePolicy {
        CachePolicy {
            ttl,
            consistency: self.consistency,
            page_size: self.page_size.max(1),
            invalidation_attempts: self.invalidation_attempts.max(1),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectBackend {
    Memory,
    Filesystem,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectSettings {
    pub backend: ObjectBackend,
    /// Root directory of the filesystem backend.
    pub root: PathBuf,
    /// Default for `minio_bucket`.
    pub bucket: String,
    /// Default for `minio_endpoint`; also the base of public URLs.
    pub endpoint: String,
    /// Default for `minio_access_key`.
    pub access_key: String,
    /// Default for `minio_secret_key`.
    pub secret_key: String,
    /// Default for `minio_secure`: use https when the endpoint has no scheme.
    pub secure: bool,
    pub region: String,
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for ObjectSettings {
    fn default() -> Self {
        Self {
            backend: ObjectBackend::Filesystem,
            root: PathBuf::from("data/objects"),
            bucket: "veritas-storage".to_string(),
            endpoint: "localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin123".to_string(),
            secure: false,
            region: "us-east-1".to_string(),
            timeout_ms: 10_000,
            max_attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    /// Task service endpoint. Notifications are off when unset.
    pub task_service_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            task_service_url: None,
            timeout_ms: 5000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.server.listen_address, "127.0.0.1:8000");
        assert_eq!(s.database.path, PathBuf::from("data/veritas.db"));
        assert_eq!(s.database.pool_size, 10);
        assert_eq!(s.database.query_timeout_sec, 30);
        assert_eq!(s.cache.backend, KvBackend::Memory);
        assert_eq!(s.cache.redis_port, 6379);
        assert_eq!(s.cache.consistency, Consistency::Strict);
        assert_eq!(s.objects.bucket, "veritas-storage");
        assert_eq!(s.objects.backend, ObjectBackend::Filesystem);
        assert!(s.notify.task_service_url.is_none());
        assert_eq!(s.logging.level, "info");
        assert_eq!(s.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[server]
listen_address = "0.0.0.0:9100"

[database]
path = "/var/lib/veritas/veritas.db"
pool_size = 4
query_timeout_sec = 5

[cache]
backend = "redis"
redis_host = "cache.internal"
redis_port = 6380
ttl_sec = 60
consistency = "eventual"
page_size = 50

[objects]
backend = "s3"
bucket = "qa-evidence"
endpoint = "https://minio.internal:9000"
access_key = "qa"
secret_key = "qa-secret"

[notify]
task_service_url = "http://tasks.internal/api/tasks"
timeout_ms = 1500

[logging]
level = "debug"
format = "json"
"#;
        let s: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(s.server.listen_address, "0.0.0.0:9100");
        assert_eq!(s.database.pool_size, 4);
        assert_eq!(s.cache.backend, KvBackend::Redis);
        assert_eq!(s.cache.redis_host, "cache.internal");
        assert_eq!(s.cache.consistency, Consistency::Eventual);
        assert_eq!(s.objects.backend, ObjectBackend::S3);
        assert_eq!(s.objects.bucket, "qa-evidence");
        assert_eq!(s.objects.access_key, "qa");
        assert_eq!(s.objects.region, "us-east-1");
        assert_eq!(
            s.notify.task_service_url.as_deref(),
            Some("http://tasks.internal/api/tasks")
        );
        assert_eq!(s.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let s: Settings = toml::from_str("[cache]\nttl_sec = 10\n").unwrap();
        assert_eq!(s.cache.ttl_sec, 10);
        assert_eq!(s.cache.redis_port, 6379);
        assert_eq!(s.database.pool_size, 10);
    }

    #[test]
    fn test_policy_clamps_zeroes() {
        let cache = CacheSettings {
            page_size: 0,
            invalidation_attempts: 0,
            ..CacheSettings::default()
        };
        let p = cache.policy(Duration::from_secs(7));
        assert_eq!(p.ttl, Duration::from_secs(7));
        assert_eq!(p.page_size, 1);
        assert_eq!(p.invalidation_attempts, 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veritas.toml");
        std::fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();
        let s = Settings::discover(Some(&path)).unwrap();
        assert_eq!(s.logging.level, "warn");

        assert!(Settings::discover(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
