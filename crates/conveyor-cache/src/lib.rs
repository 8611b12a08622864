//! Cache storage backends for Conveyor.
//!
//! Provides [`CacheStore`] implementations:
//! - Filesystem (content-addressed, first-writer-wins)
//! - In-memory (tests, single-process runs)

pub mod fs;
pub mod memory;

pub use conveyor_core::cache::{CacheEntry, CacheKey, CacheStore};
pub use fs::FsCacheStore;
pub use memory::MemoryCacheStore;
