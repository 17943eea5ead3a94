//! Bounded in-memory map over a `PsfCacheStore`, evicting least-recently-used
//! keys to disk once `capacity` entries are held in memory.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;

use super::store::{CacheValue, PsfCacheStore};
use crate::error::Result;

pub struct LruCacheManager {
    store: PsfCacheStore,
    capacity: usize,
    memory: HashMap<String, CacheValue>,
    // Front = most recently used. Linear scan on touch is fine: capacity is
    // small (tens of entries) and this keeps the structure a plain
    // parallel-array design rather than pulling in an LRU crate.
    recency: VecDeque<String>,
}

impl LruCacheManager {
    pub fn new(dir: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        Ok(LruCacheManager {
            store: PsfCacheStore::open(dir)?,
            capacity: capacity.max(1),
            memory: HashMap::new(),
            recency: VecDeque::new(),
        })
    }

    /// True if `key` is resolvable either from memory or from disk.
    pub fn contains(&self, key: &str) -> bool {
        self.memory.contains_key(key) || self.store.contains(key)
    }

    /// Read-through get: returns the in-memory value if present, otherwise
    /// loads from disk, caches in memory (evicting LRU if over capacity),
    /// and returns it. Never creates a duplicate on-disk entry.
    pub fn get(&mut self, key: &str) -> Result<CacheValue> {
        if let Some(v) = self.memory.get(key).cloned() {
            self.touch(key);
            return Ok(v);
        }
        let value = self.store.get(key)?;
        self.insert_memory(key, value.clone());
        Ok(value)
    }

    /// Write-through put: persists to disk immediately, then updates (or
    /// inserts into) the in-memory tier, evicting LRU entries over capacity.
    pub fn put(&mut self, key: &str, value: CacheValue) -> Result<()> {
        self.store.put(key, &value)?;
        self.insert_memory(key, value);
        Ok(())
    }

    fn insert_memory(&mut self, key: &str, value: CacheValue) {
        if self.memory.contains_key(key) {
            self.memory.insert(key.to_string(), value);
            self.touch(key);
            return;
        }
        self.memory.insert(key.to_string(), value);
        self.recency.push_front(key.to_string());
        while self.memory.len() > self.capacity {
            if let Some(evicted) = self.recency.pop_back() {
                // Already write-through persisted; dropping from memory is
                // sufficient to satisfy the LRU contract.
                self.memory.remove(&evicted);
                log::debug!("evicted {evicted:?} from LRU memory tier");
            } else {
                break;
            }
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_front(key.to_string());
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub fn in_memory(&self, key: &str) -> bool {
        self.memory.contains_key(key)
    }
}
