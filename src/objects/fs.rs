//! Filesystem-backed object store: one directory per bucket under a root.
//!
//! Writes go to a temporary sibling and are renamed into place, so a reader
//! never observes a partially written object. Content types are not persisted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{validate_bucket, validate_path, ObjectInfo, ObjectStore};
use crate::error::{CoreError, Result};

const TMP_PREFIX: &str = ".tmp-";

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(CoreError::object)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        validate_bucket(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn object_file(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        let mut file = self.bucket_dir(bucket)?;
        file.extend(path.split('/'));
        Ok(file)
    }

    fn walk(dir: &Path, rel: &str, prefix: &str, out: &mut Vec<ObjectInfo>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            let child = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            let meta = entry.metadata()?;
            if meta.is_dir() {
                // Skip subtrees that cannot contain a match.
                let as_dir = format!("{child}/");
                if as_dir.starts_with(prefix) || prefix.starts_with(&as_dir) {
                    Self::walk(&entry.path(), &child, prefix, out)?;
                }
            } else if child.starts_with(prefix) {
                out.push(ObjectInfo {
                    path: child,
                    size: meta.len(),
                    last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.bucket_dir(bucket)?.is_dir())
    }

    fn create_bucket(&self, bucket: &str) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        fs::create_dir_all(&dir).map_err(CoreError::object)?;
        info!(%bucket, "created bucket");
        Ok(())
    }

    fn put(&self, bucket: &str, path: &str, data: Bytes, _content_type: &str) -> Result<()> {
        if !self.bucket_exists(bucket)? {
            return Err(CoreError::object(format!("no such bucket: {bucket}")));
        }
        let file = self.object_file(bucket, path)?;
        let parent = file
            .parent()
            .ok_or_else(|| CoreError::validation(format!("invalid object path: {path}")))?;
        fs::create_dir_all(parent).map_err(CoreError::object)?;

        let tmp = parent.join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&data)?;
            f.sync_all()?;
            fs::rename(&tmp, &file)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(CoreError::object(e));
        }
        debug!(%bucket, %path, size = data.len(), "stored object");
        Ok(())
    }

    fn get(&self, bucket: &str, path: &str) -> Result<Bytes> {
        let file = self.object_file(bucket, path)?;
        match fs::read(&file) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::not_found("object", format!("{bucket}/{path}")))
            }
            Err(e) => Err(CoreError::object(e)),
        }
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Err(CoreError::object(format!("no such bucket: {bucket}")));
        }
        let mut out = Vec::new();
        Self::walk(&dir, "", prefix, &mut out).map_err(CoreError::object)?;
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        let file = self.object_file(bucket, path)?;
        match fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::object(e)),
        }
    }

    fn ping(&self) -> Result<()> {
        fs::metadata(&self.root)
            .map(|_| ())
            .map_err(CoreError::object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_roundtrip_and_delete() {
        let (_dir, store) = store();
        store.ensure_bucket("veritas-storage").unwrap();
        store
            .put(
                "veritas-storage",
                "evidence/2024/05/01/log.txt",
                Bytes::from_static(b"hello"),
                "text/plain",
            )
            .unwrap();

        let got = store.get("veritas-storage", "evidence/2024/05/01/log.txt").unwrap();
        assert_eq!(&got[..], b"hello");

        store.delete("veritas-storage", "evidence/2024/05/01/log.txt").unwrap();
        assert!(matches!(
            store.get("veritas-storage", "evidence/2024/05/01/log.txt"),
            Err(CoreError::NotFound { .. })
        ));
        // Deleting twice is fine.
        store.delete("veritas-storage", "evidence/2024/05/01/log.txt").unwrap();
    }

    #[test]
    fn test_put_without_bucket_fails() {
        let (_dir, store) = store();
        let err = store
            .put("veritas-storage", "a/b", Bytes::from_static(b"x"), "text/plain")
            .unwrap_err();
        assert!(matches!(err, CoreError::StoreUnavailable { .. }));
    }

    #[test]
    fn test_list_by_prefix() {
        let (_dir, store) = store();
        store.ensure_bucket("bkt").unwrap();
        for p in [
            "executions/2024/01/02/b.json",
            "executions/2024/01/01/a.json",
            "evidence/2024/01/01/c.txt",
        ] {
            store.put("bkt", p, Bytes::from_static(b"{}"), "application/json").unwrap();
        }

        let all: Vec<_> = store.list("bkt", "").unwrap().into_iter().map(|o| o.path).collect();
        assert_eq!(all.len(), 3);

        let day: Vec<_> = store
            .list("bkt", "executions/2024/01/01/")
            .unwrap()
            .into_iter()
            .map(|o| o.path)
            .collect();
        assert_eq!(day, vec!["executions/2024/01/01/a.json"]);

        let cat: Vec<_> = store
            .list("bkt", "executions/")
            .unwrap()
            .into_iter()
            .map(|o| o.path)
            .collect();
        assert_eq!(
            cat,
            vec!["executions/2024/01/01/a.json", "executions/2024/01/02/b.json"]
        );
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, store) = store();
        store.ensure_bucket("bkt").unwrap();
        assert!(store
            .put("bkt", "../escape", Bytes::from_static(b"x"), "text/plain")
            .is_err());
    }
}
