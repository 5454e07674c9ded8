//! Cache storage trait and its SQLite, in-memory and no-op implementations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::traits::CacheKey;
use crate::error::{Error, Result};

/// A stored value with its freshness marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub value: Vec<u8>,
  pub fresh_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Entries are never evicted. A write only lands when it is at least as fresh
/// as what is already stored, so timestamps never move backwards.
pub trait CacheStore: Send + Sync + 'static {
  /// Get a single entry by key.
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Store an entry unless a fresher one exists. Returns whether it was written.
  fn put(&self, key: &CacheKey, value: &[u8], fresh_at: DateTime<Utc>) -> Result<bool>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStore for NoopStorage {
  fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &CacheKey, _value: &[u8], _fresh_at: DateTime<Utc>) -> Result<bool> {
    Ok(false) // Discard
  }
}

/// Process-local storage, mostly for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryStorage {
  entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl CacheStore for MemoryStorage {
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    key.validate()?;
    let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
    Ok(entries.get(key).cloned())
  }

  fn put(&self, key: &CacheKey, value: &[u8], fresh_at: DateTime<Utc>) -> Result<bool> {
    key.validate()?;
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = entries.get(key) {
      if existing.fresh_at > fresh_at {
        return Ok(false);
      }
    }
    entries.insert(
      key.clone(),
      CacheEntry {
        value: value.to_vec(),
        fresh_at,
      },
    );
    Ok(true)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::Storage(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.busy_timeout(Duration::from_secs(5))?;

    Self::with_connection(conn)
  }

  /// A throwaway database living only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Generic entry cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS cache_entries (
    key_hash TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    description TEXT NOT NULL,
    data BLOB NOT NULL,
    -- microseconds since the epoch
    fresh_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_type
    ON cache_entries(entity_type, fresh_at);
"#;

impl CacheStore for SqliteStorage {
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    key.validate()?;
    let conn = self.conn()?;

    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT data, fresh_at FROM cache_entries WHERE key_hash = ?",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((value, micros)) => Ok(Some(CacheEntry {
        value,
        fresh_at: from_micros(micros)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, key: &CacheKey, value: &[u8], fresh_at: DateTime<Utc>) -> Result<bool> {
    key.validate()?;
    let conn = self.conn()?;

    // The upsert only replaces rows that are not fresher than the new value
    let changed = conn.execute(
      "INSERT INTO cache_entries (key_hash, entity_type, description, data, fresh_at)
       VALUES (?, ?, ?, ?, ?)
       ON CONFLICT(key_hash) DO UPDATE SET
         data = excluded.data,
         fresh_at = excluded.fresh_at
       WHERE excluded.fresh_at >= cache_entries.fresh_at",
      params![
        key.cache_hash(),
        key.entity_type(),
        key.description(),
        value,
        fresh_at.timestamp_micros()
      ],
    )?;

    Ok(changed > 0)
  }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_micros(micros)
    .ok_or_else(|| Error::Storage(format!("Bad timestamp in cache: {}", micros)))
}
