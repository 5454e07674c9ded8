//! Local cache for data pulled from trackers.
//!
//! This module provides a tracker-agnostic caching mechanism that:
//! - Stores serialized entities under a [`CacheKey`] with a freshness timestamp
//! - Never lets a write move an entry's timestamp backwards
//! - Judges freshness against a configurable maximum age
//! - Serializes read-modify-write updates per key

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheEntry, CacheStore, MemoryStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheKey, CacheResult, CacheSource, Cacheable};
