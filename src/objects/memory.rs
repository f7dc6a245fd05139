use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{validate_bucket, validate_path, ObjectInfo, ObjectStore};
use crate::error::{CoreError, Result};

struct StoredObject {
    data: Bytes,
    content_type: String,
    modified: DateTime<Utc>,
}

/// Object store held entirely in memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<HashMap<String, BTreeMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(&self, bucket: &str, path: &str) -> Option<String> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.get(path))
            .map(|o| o.content_type.clone())
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.lock().get(bucket).map_or(0, |b| b.len())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().contains_key(bucket))
    }

    fn create_bucket(&self, bucket: &str) -> Result<()> {
        validate_bucket(bucket)?;
        self.buckets.lock().entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn put(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> Result<()> {
        validate_path(path)?;
        let mut buckets = self.buckets.lock();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| CoreError::object(format!("no such bucket: {bucket}")))?;
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn get(&self, bucket: &str, path: &str) -> Result<Bytes> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.get(path))
            .map(|o| o.data.clone())
            .ok_or_else(|| CoreError::not_found("object", format!("{bucket}/{path}")))
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let buckets = self.buckets.lock();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| CoreError::object(format!("no such bucket: {bucket}")))?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, o)| ObjectInfo {
                path: path.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.modified),
            })
            .collect())
    }

    fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        if let Some(objects) = self.buckets.lock().get_mut(bucket) {
            objects.remove(path);
        }
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}
