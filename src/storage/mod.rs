//! SQLite storage layer -- connection pool, schema, row helpers.

pub mod schema;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{CoreError, Result};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str, max_size: u32) -> AnyResult<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory for {path}"))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder()
        .max_size(max_size.max(1))
        .build(manager)
        .with_context(|| format!("failed to open database pool at {path}"))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Handle to the authoritative relational store.
///
/// Cloning is cheap; all clones share the pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
    busy_timeout_ms: Arc<AtomicU64>,
}

impl SqliteStore {
    pub fn open(path: &str, pool_size: u32) -> AnyResult<Self> {
        Ok(Self::from_pool(open_pool(path, pool_size)?))
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            busy_timeout_ms: Arc::new(AtomicU64::new(DEFAULT_BUSY_TIMEOUT_MS)),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// How long a statement waits on a locked database before failing.
    pub fn set_query_timeout(&self, timeout: Duration) {
        self.busy_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn checkout(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        let conn = self.pool.get()?;
        conn.busy_timeout(Duration::from_millis(
            self.busy_timeout_ms.load(Ordering::Relaxed),
        ))?;
        Ok(conn)
    }

    /// Run `f` with a pooled connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.checkout()?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on `Ok`.
    ///
    /// The write lock is taken up front, so concurrent transactions on the same
    /// rows are serialized rather than failing at commit.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.checkout()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|c| {
            c.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }
}

/// Canonical timestamp encoding: RFC 3339, UTC, millisecond precision.
///
/// Fixed width, so lexical order in SQL equals chronological order.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time truncated to the stored resolution.
pub fn now_ms() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Parse a stored timestamp column.
pub fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

/// Decode a JSON text column.
pub fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CoreError::validation(format!("unserializable value: {e}")))
}

#[cfg(test)]
pub(crate) fn temp_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("veritas.db");
    let store = SqliteStore::open(path.to_str().unwrap(), 4).unwrap();
    (dir, store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ts_roundtrip_keeps_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let s = ts(at);
        assert_eq!(s, "2023-11-14T22:13:20.123Z");
        assert_eq!(parse_ts(0, &s).unwrap(), at);
    }

    #[test]
    fn test_now_ms_has_no_sub_millisecond_part() {
        let now = now_ms();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_open_and_ping() {
        let (_dir, store) = temp_store();
        store.ping().unwrap();
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (_dir, store) = temp_store();
        let res: Result<()> = store.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO configuration (config_key, config_value, updated_at) VALUES ('a', '1', '2024-01-01T00:00:00.000Z')",
                [],
            )?;
            Err(CoreError::validation("abort"))
        });
        assert!(res.is_err());
        let count: i64 = store
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM configuration", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
