//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::tracker::ItemKind;

/// Trait for entities that can be cached.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identity of this entity in the cache
  fn cache_key(&self) -> CacheKey;
}

/// Identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
  /// One tracked artifact
  Item {
    kind: ItemKind,
    tracker: String,
    id: String,
  },
  /// One shard of the tag index
  TagIndex { shard: String },
}

impl CacheKey {
  pub fn item(kind: ItemKind, tracker: impl Into<String>, id: impl Into<String>) -> Self {
    Self::Item {
      kind,
      tracker: tracker.into(),
      id: id.into(),
    }
  }

  pub fn tag_index(shard: impl Into<String>) -> Self {
    Self::TagIndex {
      shard: shard.into(),
    }
  }

  /// Entity type name for storage organization
  pub fn entity_type(&self) -> &'static str {
    match self {
      Self::Item { kind, .. } => kind.as_str(),
      Self::TagIndex { .. } => "tag_index",
    }
  }

  /// Human readable form. Not unique: ids and names may contain `:`.
  pub fn description(&self) -> String {
    match self {
      Self::Item { kind, tracker, id } => format!("{}:{}:{}", kind, tracker, id),
      Self::TagIndex { shard } => format!("tags:{}", shard),
    }
  }

  /// Stable, fixed-length storage key.
  ///
  /// Every part is hashed with its length in front, so no two keys share a
  /// hash whatever characters their parts contain.
  pub fn cache_hash(&self) -> String {
    let parts: [&str; 3] = match self {
      Self::Item { kind, tracker, id } => [kind.as_str(), tracker.as_str(), id.as_str()],
      Self::TagIndex { shard } => [self.entity_type(), shard.as_str(), ""],
    };

    let mut hasher = Sha256::new();
    for part in parts {
      hasher.update((part.len() as u64).to_le_bytes());
      hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
  }

  /// Reject keys that cannot name a real entry.
  pub fn validate(&self) -> Result<()> {
    let blank = |s: &str| s.trim().is_empty();
    let bad = match self {
      Self::Item { tracker, id, .. } => blank(tracker) || blank(id),
      Self::TagIndex { shard } => blank(shard),
    };

    if bad {
      Err(Error::InvalidKey(self.description()))
    } else {
      Ok(())
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Freshness timestamp of the data
  pub cached_at: DateTime<Utc>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: fetched_at,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn is_fresh(&self) -> bool {
    self.source == CacheSource::CacheFresh
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, older than the freshness window
  CacheStale,
  /// Remote fetch failed, serving the last cached copy
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::CacheFresh => "cache_fresh",
      Self::CacheStale => "cache_stale",
      Self::Offline => "offline",
    }
  }
}
