//! Cache store trait, cache keys, and cache entries.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::Result;

/// Deterministic cache identifier derived from a key template and the
/// hash of one or more input files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from a template and input file contents.
    ///
    /// `${hash}` in the template expands to the hex SHA-256 digest of the
    /// inputs, in order. Input order matters; callers pass files in their
    /// configured order.
    pub fn derive<'a, I>(template: &str, inputs: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = Sha256::new();
        for input in inputs {
            hasher.update(input);
        }
        let digest = hex::encode(hasher.finalize());
        Self(template.replace("${hash}", &digest))
    }

    /// A key from an already-resolved string (tests, fallback keys).
    pub fn from_resolved(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 of the key itself, for content-addressed storage layout.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable cache blob: relative paths mapped to file contents.
///
/// BTreeMap keeps the path set ordered so entries compare and serialize
/// deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub files: BTreeMap<PathBuf, Bytes>,
}

impl CacheEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, contents: impl Into<Bytes>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total payload size in bytes.
    pub fn size(&self) -> u64 {
        self.files.values().map(|b| b.len() as u64).sum()
    }
}

/// Trait for cache storage backends.
///
/// Entries are immutable once stored: `put` on an existing key is a no-op
/// that still reports success (first writer wins). Concurrent `put` on the
/// same key from parallel jobs is safe; exactly one write lands.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Retrieve the entry for a key, if present.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store an entry unless the key already exists.
    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()>;

    /// Whether a key is present.
    async fn contains(&self, key: &CacheKey) -> Result<bool>;
}
