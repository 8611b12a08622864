//! In-memory cache store.

use async_trait::async_trait;
use conveyor_core::Result;
use conveyor_core::cache::{CacheEntry, CacheKey, CacheStore};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Cache store backed by a process-local map. Used by tests and
/// single-process runs where persistence is not wanted.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            debug!(key = %key, "cache key already present, skipping write");
            return Ok(());
        }
        entries.insert(key.clone(), entry);
        Ok(())
    }

    async fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entries.lock().unwrap().contains_key(key))
    }
}
