//! Key-value store behind the task status and embedding caches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;

use crate::error::QueryError;

/// Byte-oriented store with optional per-key expiry.
///
/// Implementations must be safe to share across the submitting side and the
/// background worker.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QueryError>;

    /// Insert or overwrite `key`. `ttl` of `None` keeps the entry until it is
    /// evicted for capacity.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), QueryError>;

    fn delete(&self, key: &str) -> Result<(), QueryError>;
}

#[derive(Clone)]
struct KvEntry {
    bytes: Arc<[u8]>,
    ttl: Option<Duration>,
}

/// Every entry carries its own time-to-live; writes restart the clock.
struct PerEntryTtl;

impl Expiry<String, KvEntry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &KvEntry, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &KvEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process store backed by a bounded moka cache.
pub struct MemoryKvStore {
    cache: Cache<String, KvEntry>,
}

impl MemoryKvStore {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl std::fmt::Debug for MemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QueryError> {
        Ok(self.cache.get(key).map(|entry| entry.bytes.to_vec()))
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), QueryError> {
        self.cache.insert(
            key.to_string(),
            KvEntry {
                bytes: value.into(),
                ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), QueryError> {
        self.cache.invalidate(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemoryKvStore::new(100);
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", b"v1".to_vec(), None).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"v1"[..]));

        store.set("k", b"v2".to_vec(), None).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"v2"[..]));

        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_entries_expire() {
        let store = MemoryKvStore::new(100);
        store
            .set("short", b"x".to_vec(), Some(Duration::from_millis(30)))
            .unwrap();
        store
            .set("long", b"y".to_vec(), Some(Duration::from_secs(60)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(120));

        assert_eq!(store.get("short").unwrap(), None);
        assert!(store.get("long").unwrap().is_some());
    }

    #[test]
    fn test_overwrite_resets_ttl() {
        let store = MemoryKvStore::new(100);
        store
            .set("k", b"x".to_vec(), Some(Duration::from_millis(30)))
            .unwrap();
        store.set("k", b"y".to_vec(), None).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"y"[..]));
    }
}
