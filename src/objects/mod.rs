//! Blob storage with an S3-style surface.
//!
//! Object paths follow `<category>/<yyyy>/<mm>/<dd>/<unique-name>` so a
//! prefix listing by category and date is already time ordered.

pub mod fs;
pub mod memory;
pub mod s3;

use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;

use crate::error::{CoreError, Result};

pub use self::fs::FsObjectStore;
pub use self::memory::MemoryObjectStore;
pub use self::s3::{S3ObjectStore, S3Options};

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

pub trait ObjectStore: Send + Sync {
    fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Create `bucket` unless it already exists. Safe to call repeatedly.
    fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        if !self.bucket_exists(bucket)? {
            self.create_bucket(bucket)?;
        }
        Ok(())
    }

    fn put(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> Result<()>;

    /// Fetch an object. Missing objects are `NotFound`.
    fn get(&self, bucket: &str, path: &str) -> Result<Bytes>;

    /// Objects whose path starts with `prefix`, sorted by path.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;

    fn delete(&self, bucket: &str, path: &str) -> Result<()>;

    fn ping(&self) -> Result<()>;

    /// Address clients can fetch the object from, if this store serves one.
    fn public_url(&self, _bucket: &str, _path: &str) -> Option<String> {
        None
    }
}

/// `<category>/<yyyy>/<mm>/<dd>/` for `date`.
pub fn date_prefix(category: &str, date: NaiveDate) -> String {
    format!(
        "{}/{:04}/{:02}/{:02}/",
        category,
        date.year(),
        date.month(),
        date.day()
    )
}

/// Full object path for a new object created at `at`.
pub fn object_path(category: &str, at: DateTime<Utc>, name: &str) -> String {
    format!("{}{}", date_prefix(category, at.date_naive()), name)
}

/// Reject paths that could escape a bucket or collide with listing syntax.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(CoreError::validation("object path is empty"));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(CoreError::validation(format!("invalid object path: {path}")));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(CoreError::validation(format!("invalid object path: {path}")));
    }
    Ok(())
}

/// Bucket names follow the S3 rules loosely: lowercase alphanumerics, `-` and `.`.
pub fn validate_bucket(bucket: &str) -> Result<()> {
    let ok = (3..=63).contains(&bucket.len())
        && bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !bucket.starts_with(['-', '.'])
        && !bucket.contains("..");
    if ok {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid bucket name: {bucket}")))
    }
}
