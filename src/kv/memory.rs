//! In-process TTL map, used when no Redis endpoint is configured and in tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::KeyValueStore;
use crate::error::Result;

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let kv = MemoryKv::new();
        kv.set_ex("config:a", "1", Duration::from_secs(60)).unwrap();
        assert_eq!(kv.get("config:a").unwrap().as_deref(), Some("1"));
        kv.delete("config:a").unwrap();
        assert_eq!(kv.get("config:a").unwrap(), None);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_millis(0)).unwrap();
        assert_eq!(kv.get("k").unwrap(), None);
        assert!(kv.is_empty());
    }

    #[test]
    fn test_delete_prefix_only_touches_namespace() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(60);
        kv.set_ex("projects:all", "[]", ttl).unwrap();
        kv.set_ex("projects:42", "{}", ttl).unwrap();
        kv.set_ex("test_cases:all", "[]", ttl).unwrap();

        assert_eq!(kv.delete_prefix("projects:").unwrap(), 2);
        assert_eq!(kv.get("test_cases:all").unwrap().as_deref(), Some("[]"));
    }
}
