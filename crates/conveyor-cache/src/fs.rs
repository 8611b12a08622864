//! Filesystem cache store.
//!
//! Entries live under `<root>/<key digest>/` with their relative paths laid
//! out as plain files. Writes stage into a temporary sibling directory and
//! `rename` into place; if the target already exists another writer won and
//! the call still reports success. No locks are taken.

use async_trait::async_trait;
use bytes::Bytes;
use conveyor_core::cache::{CacheEntry, CacheKey, CacheStore};
use conveyor_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content-addressed cache store on local disk.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Cache(format!("failed to create cache root: {}", e)))?;
        Ok(Self { root })
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.digest())
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(key);
        tokio::task::spawn_blocking(move || read_entry(&dir))
            .await
            .map_err(|e| Error::Cache(format!("cache read task failed: {}", e)))?
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        let dir = self.entry_dir(key);
        if dir.exists() {
            debug!(key = %key, "cache key already present, skipping write");
            return Ok(());
        }

        let root = self.root.clone();
        let key_str = key.to_string();
        tokio::task::spawn_blocking(move || write_entry(&root, &dir, &key_str, entry))
            .await
            .map_err(|e| Error::Cache(format!("cache write task failed: {}", e)))?
    }

    async fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entry_dir(key).exists())
    }
}

fn read_entry(dir: &Path) -> Result<Option<CacheEntry>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut entry = CacheEntry::new();
    collect_files(dir, dir, &mut entry)?;
    Ok(Some(entry))
}

fn collect_files(base: &Path, dir: &Path, entry: &mut CacheEntry) -> Result<()> {
    let read_dir =
        std::fs::read_dir(dir).map_err(|e| Error::Cache(format!("cache read failed: {}", e)))?;

    for item in read_dir {
        let item = item.map_err(|e| Error::Cache(format!("cache read failed: {}", e)))?;
        let path = item.path();
        if path.is_dir() {
            collect_files(base, &path, entry)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .map_err(|e| Error::Cache(format!("cache layout error: {}", e)))?
                .to_path_buf();
            let contents = std::fs::read(&path)
                .map_err(|e| Error::Cache(format!("cache read failed: {}", e)))?;
            entry.insert(rel, Bytes::from(contents));
        }
    }
    Ok(())
}

fn write_entry(root: &Path, dir: &Path, key: &str, entry: CacheEntry) -> Result<()> {
    let staging = tempfile::tempdir_in(root)
        .map_err(|e| Error::Cache(format!("failed to create staging dir: {}", e)))?;

    for (rel, contents) in &entry.files {
        let target = staging.path().join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Cache(format!("cache write failed: {}", e)))?;
        }
        std::fs::write(&target, contents)
            .map_err(|e| Error::Cache(format!("cache write failed: {}", e)))?;
    }

    // Atomic publish. A rename failure with the target present means a
    // concurrent writer won the race, which callers observe as success.
    match std::fs::rename(staging.path(), dir) {
        Ok(()) => {
            debug!(key = %key, "cache entry stored");
            Ok(())
        }
        Err(_) if dir.exists() => {
            debug!(key = %key, "lost cache write race, entry already stored");
            Ok(())
        }
        Err(e) => Err(Error::Cache(format!("cache publish failed: {}", e))),
    }
}
