//! Durable artifacts: an object in the object store plus the `artifacts` row
//! that references it.
//!
//! The object is always written first. A row therefore never points at a
//! missing object; the reverse (an object with no row) is reported as
//! [`CoreError::OrphanArtifact`] and can be found later with
//! [`DurableArtifactWriter::find_orphans`].

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheAsideCollection, CachePolicy, Invalidate};
use crate::error::{CoreError, Result};
use crate::kv::KeyValueStore;
use crate::objects::{self, ObjectInfo, ObjectStore};
use crate::storage::{self, SqliteStore};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Where a durable artifact lives and what it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub bucket: String,
    pub path: String,
    pub size: u64,
    /// SHA-256, lowercase hex.
    pub content_hash: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

/// An indexed artifact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: i64,
    pub category: String,
    pub execution_id: Option<i64>,
    #[serde(flatten)]
    pub artifact: ArtifactRef,
}

/// Insert the row for an object that has already been written.
pub fn insert_row(
    conn: &Connection,
    category: &str,
    execution_id: Option<i64>,
    artifact: &ArtifactRef,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO artifacts
            (category, execution_id, bucket, object_path, size, content_hash, content_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            category,
            execution_id,
            artifact.bucket,
            artifact.path,
            artifact.size as i64,
            artifact.content_hash,
            artifact.content_type,
            storage::ts(artifact.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    let created: String = row.get(8)?;
    Ok(ArtifactRecord {
        id: row.get(0)?,
        category: row.get(1)?,
        execution_id: row.get(2)?,
        artifact: ArtifactRef {
            bucket: row.get(3)?,
            path: row.get(4)?,
            size: row.get::<_, i64>(5)? as u64,
            content_hash: row.get(6)?,
            content_type: row.get(7)?,
            created_at: storage::parse_ts(8, &created)?,
        },
    })
}

const RECORD_COLUMNS: &str =
    "id, category, execution_id, bucket, object_path, size, content_hash, content_type, created_at";

/// Most recent rows, newest first, optionally restricted to one category.
pub fn list_rows(conn: &Connection, category: Option<&str>, limit: usize) -> Result<Vec<ArtifactRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM artifacts
         WHERE (?1 IS NULL OR category = ?1)
         ORDER BY created_at DESC, id DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![category, limit as i64], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn rows_for_execution(conn: &Connection, execution_id: i64) -> Result<Vec<ArtifactRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM artifacts WHERE execution_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![execution_id], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn indexed_paths(conn: &Connection, bucket: &str, prefix: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT object_path FROM artifacts WHERE bucket = ?1 AND substr(object_path, 1, ?3) = ?2",
    )?;
    let paths = stmt
        .query_map(params![bucket, prefix, prefix.len() as i64], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(paths)
}

/// `<category>_<yyyymmdd>_<hhmmss>_<8 hex>.json`
fn unique_name(category: &str, at: DateTime<Utc>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}.json", category, at.format("%Y%m%d_%H%M%S"), &id[..8])
}

pub struct DurableArtifactWriter {
    objects: Arc<dyn ObjectStore>,
    store: SqliteStore,
    bucket: String,
    ensured: Mutex<HashSet<String>>,
    linked: RwLock<Vec<Arc<dyn Invalidate>>>,
    recent: CacheAsideCollection<ArtifactRecord>,
}

impl DurableArtifactWriter {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        store: SqliteStore,
        kv: Arc<dyn KeyValueStore>,
        policy: CachePolicy,
        bucket: impl Into<String>,
    ) -> Result<Self> {
        let bucket = bucket.into();
        objects::validate_bucket(&bucket)?;
        let page = policy.page_size;
        let loader_store = store.clone();
        let recent = CacheAsideCollection::new("artifacts", kv, policy, move || {
            loader_store.with_conn(|c| list_rows(c, None, page))
        });
        Ok(Self {
            objects,
            store,
            bucket,
            ensured: Mutex::new(HashSet::new()),
            linked: RwLock::new(Vec::new()),
            recent,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Invalidate `target` whenever an artifact linked to an execution is
    /// indexed, whatever its category.
    pub fn register_invalidation(&self, target: Arc<dyn Invalidate>) {
        debug!(collection = target.collection(), "registered artifact invalidation");
        self.linked.write().push(target);
    }

    /// Create the bucket once per process. Failures are not remembered.
    fn ensure_bucket(&self) -> Result<()> {
        if self.ensured.lock().contains(&self.bucket) {
            return Ok(());
        }
        self.objects.ensure_bucket(&self.bucket)?;
        self.ensured.lock().insert(self.bucket.clone());
        info!(bucket = %self.bucket, "bucket ready");
        Ok(())
    }

    /// Serialize `payload`, store it, and index it.
    pub fn write<P: Serialize + ?Sized>(&self, category: &str, payload: &P) -> Result<ArtifactRef> {
        let (artifact, _id) = self.write_with(category, payload, |r| {
            self.store.with_conn(|c| insert_row(c, category, None, r))
        })?;
        self.invalidate_recent()?;
        Ok(artifact)
    }

    /// Store an artifact that belongs to an existing execution.
    ///
    /// Unknown executions are rejected before anything is written.
    pub fn write_for_execution<P: Serialize + ?Sized>(
        &self,
        category: &str,
        execution_id: i64,
        payload: &P,
    ) -> Result<ArtifactRef> {
        let exists = self.store.with_conn(|c| {
            Ok(c.query_row(
                "SELECT 1 FROM executions WHERE id = ?1",
                params![execution_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
        })?;
        if !exists {
            return Err(CoreError::not_found("execution", execution_id));
        }

        let (artifact, _id) = self.write_with(category, payload, |r| {
            self.store.with_transaction(|tx| {
                let id = insert_row(tx, category, Some(execution_id), r)?;
                let evidence: Option<String> = tx
                    .query_row(
                        "SELECT evidence_json FROM executions WHERE id = ?1",
                        params![execution_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(evidence) = evidence else {
                    return Err(CoreError::not_found("execution", execution_id));
                };
                let mut paths: Vec<String> = storage::parse_json(0, &evidence)?;
                paths.push(r.path.clone());
                tx.execute(
                    "UPDATE executions SET evidence_json = ?1 WHERE id = ?2",
                    params![storage::to_json(&paths)?, execution_id],
                )?;
                Ok(id)
            })
        })?;
        info!(execution_id, %category, path = %artifact.path, "evidence stored");
        self.invalidate_linked()?;
        Ok(artifact)
    }

    /// Steps 1-3 of a durable write, then `record` to index the object.
    ///
    /// `record` runs only after the object store acknowledged the put. If it
    /// fails the error becomes [`CoreError::OrphanArtifact`]. Cache
    /// invalidation is left to the caller, which knows when the row commits.
    pub fn write_with<P, T>(
        &self,
        category: &str,
        payload: &P,
        record: impl FnOnce(&ArtifactRef) -> Result<T>,
    ) -> Result<(ArtifactRef, T)>
    where
        P: Serialize + ?Sized,
    {
        if category.is_empty() || category.contains('/') {
            return Err(CoreError::validation(format!("invalid artifact category: {category:?}")));
        }
        let body = serde_json::to_vec_pretty(payload)
            .map_err(|e| CoreError::validation(format!("unserializable payload: {e}")))?;

        self.ensure_bucket()?;

        let created_at = storage::now_ms();
        let path = objects::object_path(category, created_at, &unique_name(category, created_at));
        let artifact = ArtifactRef {
            bucket: self.bucket.clone(),
            path,
            size: body.len() as u64,
            content_hash: format!("{:x}", Sha256::digest(&body)),
            content_type: JSON_CONTENT_TYPE.to_string(),
            created_at,
        };

        if let Err(e) = self.objects.put(
            &artifact.bucket,
            &artifact.path,
            Bytes::from(body),
            &artifact.content_type,
        ) {
            warn!(bucket = %artifact.bucket, path = %artifact.path, error = %e, "artifact put failed");
            return Err(e);
        }

        match record(&artifact) {
            Ok(out) => {
                debug!(%category, path = %artifact.path, size = artifact.size, "artifact indexed");
                Ok((artifact, out))
            }
            Err(e) => {
                error!(bucket = %artifact.bucket, path = %artifact.path, error = %e, "artifact stored but not indexed");
                Err(CoreError::OrphanArtifact {
                    bucket: artifact.bucket,
                    path: artifact.path,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Drop the cached `artifacts` listing.
    pub fn invalidate_recent(&self) -> Result<()> {
        self.recent.invalidate()
    }

    /// Drop the `artifacts` listing and every collection that embeds
    /// execution-linked artifacts.
    fn invalidate_linked(&self) -> Result<()> {
        self.recent.invalidate()?;
        let hooks = self.linked.read().clone();
        for hook in hooks {
            hook.invalidate()?;
        }
        Ok(())
    }

    /// Where clients can download `artifact`. `None` unless the object
    /// store serves its objects over HTTP.
    pub fn public_url(&self, artifact: &ArtifactRef) -> Option<String> {
        self.objects.public_url(&artifact.bucket, &artifact.path)
    }

    /// URL of `path` in this writer's bucket.
    pub fn public_url_for(&self, path: &str) -> Option<String> {
        self.objects.public_url(&self.bucket, path)
    }

    pub fn read(&self, artifact: &ArtifactRef) -> Result<Bytes> {
        self.objects.get(&artifact.bucket, &artifact.path)
    }

    /// Recently indexed artifacts, served through the `artifacts` collection.
    pub fn list_recent(&self) -> Result<Vec<ArtifactRecord>> {
        self.recent.get()
    }

    pub fn list_records(&self, category: Option<&str>, limit: usize) -> Result<Vec<ArtifactRecord>> {
        self.store.with_conn(|c| list_rows(c, category, limit))
    }

    /// Every artifact row linked to one execution, oldest first.
    pub fn records_for_execution(&self, execution_id: i64) -> Result<Vec<ArtifactRecord>> {
        self.store.with_conn(|c| rows_for_execution(c, execution_id))
    }

    fn prefix(category: &str, date: Option<NaiveDate>) -> String {
        match date {
            Some(date) => objects::date_prefix(category, date),
            None => format!("{category}/"),
        }
    }

    /// Objects under `category` (and `date`), in time order.
    pub fn list_objects(&self, category: &str, date: Option<NaiveDate>) -> Result<Vec<ObjectInfo>> {
        self.ensure_bucket()?;
        self.objects.list(&self.bucket, &Self::prefix(category, date))
    }

    /// Objects with no `artifacts` row.
    pub fn find_orphans(&self, category: &str, date: Option<NaiveDate>) -> Result<Vec<ObjectInfo>> {
        let prefix = Self::prefix(category, date);
        self.ensure_bucket()?;
        let listed = self.objects.list(&self.bucket, &prefix)?;
        let indexed = self.store.with_conn(|c| indexed_paths(c, &self.bucket, &prefix))?;
        let orphans: Vec<ObjectInfo> = listed
            .into_iter()
            .filter(|o| !indexed.contains(&o.path))
            .collect();
        if !orphans.is_empty() {
            warn!(%category, count = orphans.len(), "orphan artifacts found");
        }
        Ok(orphans)
    }
}
