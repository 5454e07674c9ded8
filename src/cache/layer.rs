//! Typed cache access on top of a [`CacheStore`].

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use super::storage::CacheStore;
use super::traits::{CacheKey, CacheResult, Cacheable};
use crate::error::Result;

/// Cache layer that serializes entities, judges freshness and hands out
/// per-key write locks.
pub struct CacheLayer<S: CacheStore> {
  storage: Arc<S>,
  /// How long before cached data is considered stale
  max_age: Duration,
  locks: Arc<Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>>,
}

impl<S: CacheStore> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      max_age: Duration::minutes(60),
      locks: Arc::default(),
    }
  }

  /// Set how long cached data stays fresh.
  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Check if cached data is stale based on its freshness timestamp.
  pub fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.max_age
  }

  /// Read and decode one entity.
  ///
  /// An entry that no longer decodes (e.g. written by an older version) is
  /// reported as a miss so that it gets re-fetched.
  pub fn get<T: Cacheable>(&self, key: &CacheKey) -> Result<Option<CacheResult<T>>> {
    let Some(entry) = self.storage.get(key)? else {
      return Ok(None);
    };

    match serde_json::from_slice::<T>(&entry.value) {
      Ok(data) => Ok(Some(CacheResult::from_cache(
        data,
        entry.fresh_at,
        self.is_stale(entry.fresh_at),
      ))),
      Err(e) => {
        warn!(key = %key.description(), error = %e, "discarding undecodable cache entry");
        Ok(None)
      }
    }
  }

  /// Encode and store one entity. Returns false if a fresher copy was kept.
  pub fn store<T: Cacheable>(&self, entity: &T, fresh_at: DateTime<Utc>) -> Result<bool> {
    let data = serde_json::to_vec(entity)?;
    self.storage.put(&entity.cache_key(), &data, fresh_at)
  }

  /// Exclusive write access to one key, for read-modify-write updates.
  pub async fn lock(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
      Arc::clone(locks.entry(key.clone()).or_default())
    };
    lock.lock_owned().await
  }

  /// Load, modify and store an entity while holding its key lock.
  ///
  /// `init` provides the entity when nothing is cached under `key` yet.
  pub async fn update<T, I, F>(&self, key: &CacheKey, init: I, modify: F) -> Result<T>
  where
    T: Cacheable,
    I: FnOnce() -> T,
    F: FnOnce(&mut T),
  {
    let _guard = self.lock(key).await;

    let cached = self.get::<T>(key)?;
    // Never stamp an entry older than the one just read
    let fresh_at = match &cached {
      Some(c) => c.cached_at.max(Utc::now()),
      None => Utc::now(),
    };

    let mut entity = cached.map(|c| c.data).unwrap_or_else(init);
    modify(&mut entity);

    let data = serde_json::to_vec(&entity)?;
    self.storage.put(key, &data, fresh_at)?;

    Ok(entity)
  }
}

impl<S: CacheStore> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      max_age: self.max_age,
      locks: Arc::clone(&self.locks),
    }
  }
}
