//! Pull-through access to tracker items and the tag index.
//!
//! The [`Repository`] answers from the cache when it can and goes to the
//! trackers for everything else. Remote results are written back to the cache
//! as they arrive. One failing id never fails the whole call: failures are
//! reported next to the items that could be retrieved.

mod item;

use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::bugrefs::{self, BugRef, TagIndex};
use crate::cache::{CacheKey, CacheLayer, CacheResult, CacheStore, Cacheable};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::tracker::{Connector, ItemKind, QueryResult, Session, SessionManager, TrackerInstance, TrackerRepo};

pub use item::Item;

/// One id that could not be fetched.
#[derive(Debug)]
pub struct FetchFailure {
  pub tracker: String,
  pub id: String,
  pub error: Error,
}

/// Items that could be retrieved plus the ids that could not.
///
/// An id that failed remotely but has an older cached copy shows up in both
/// lists; its item carries [`crate::cache::CacheSource::Offline`].
#[derive(Debug)]
pub struct FetchOutcome<T> {
  pub items: Vec<CacheResult<T>>,
  pub failures: Vec<FetchFailure>,
  /// Distinct ids asked for
  pub requested: usize,
}

impl<T> FetchOutcome<T> {
  pub fn is_complete(&self) -> bool {
    self.failures.is_empty()
  }

  /// Summary error when some ids failed.
  pub fn partial_error(&self) -> Option<Error> {
    if self.failures.is_empty() {
      return None;
    }

    Some(Error::PartialFetch {
      failed: self.failures.len(),
      requested: self.requested,
    })
  }

  pub fn data(&self) -> impl Iterator<Item = &T> {
    self.items.iter().map(|r| &r.data)
  }
}

/// Tuning knobs for a [`Repository`].
#[derive(Debug, Clone, Copy)]
pub struct RepositoryOptions {
  /// Limit for every login and query round trip
  pub request_timeout: Duration,
  /// Remote queries in flight across all trackers
  pub max_concurrent_requests: usize,
  /// How long a cached item counts as fresh
  pub max_age: chrono::Duration,
}

impl Default for RepositoryOptions {
  fn default() -> Self {
    Self::from(&Config::default())
  }
}

impl From<&Config> for RepositoryOptions {
  fn from(config: &Config) -> Self {
    Self {
      request_timeout: config.request_timeout(),
      max_concurrent_requests: config.max_concurrent_requests.max(1),
      max_age: config.max_age(),
    }
  }
}

/// Fetch and refresh engine over the configured trackers.
pub struct Repository<S: CacheStore, C: Connector> {
  trackers: Arc<TrackerRepo>,
  sessions: Arc<SessionManager<C>>,
  cache: CacheLayer<S>,
  permits: Arc<Semaphore>,
  timeout: Duration,
}

impl<S: CacheStore, C: Connector> Clone for Repository<S, C> {
  fn clone(&self) -> Self {
    Self {
      trackers: Arc::clone(&self.trackers),
      sessions: Arc::clone(&self.sessions),
      cache: self.cache.clone(),
      permits: Arc::clone(&self.permits),
      timeout: self.timeout,
    }
  }
}

impl<S: CacheStore, C: Connector> Repository<S, C> {
  pub fn new(trackers: TrackerRepo, connector: C, storage: S, options: RepositoryOptions) -> Self {
    let sessions = SessionManager::new(Arc::new(connector), options.request_timeout);

    Self {
      trackers: Arc::new(trackers),
      sessions: Arc::new(sessions),
      cache: CacheLayer::new(storage).with_max_age(options.max_age),
      permits: Arc::new(Semaphore::new(options.max_concurrent_requests.max(1))),
      timeout: options.request_timeout,
    }
  }

  pub fn trackers(&self) -> &TrackerRepo {
    &self.trackers
  }

  pub fn sessions(&self) -> &SessionManager<C> {
    &self.sessions
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  /// Get items from a tracker, from the cache where it is fresh.
  ///
  /// `container` names the tracker, by name or abbreviation. Results follow
  /// the requested order; repeated ids are only fetched and returned once.
  /// Only an unknown container, a tracker that does not serve `kind` or a
  /// broken cache fails the whole call.
  pub async fn fetch<I>(&self, kind: ItemKind, container: &str, ids: I) -> Result<FetchOutcome<Item>>
  where
    I: IntoIterator,
    I::Item: Into<String>,
  {
    let instance = self.trackers.instance_for(container)?;
    if !instance.kind.serves(kind) {
      return Err(unsupported(&instance, kind));
    }
    let ids: Vec<String> = dedupe(ids.into_iter().map(Into::into));

    self.fetch_from(&instance, kind, &ids, false).await
  }

  /// Re-fetch bugs no matter how fresh their cached copies are.
  ///
  /// References to unknown trackers, or to trackers without bugs, are
  /// reported as failures without any remote work.
  pub async fn refresh(&self, refs: &[BugRef]) -> Result<FetchOutcome<Item>> {
    let refs = dedupe(refs.iter().cloned());
    info!(count = refs.len(), "refreshing bugs");

    let mut rejected: HashMap<&BugRef, Error> = HashMap::new();
    let mut groups: Vec<(Arc<TrackerInstance>, Vec<String>)> = Vec::new();
    for bugref in &refs {
      let Some(instance) = self.trackers.by_tla(&bugref.tracker) else {
        rejected.insert(
          bugref,
          Error::UnknownTracker {
            name: bugref.tracker.clone(),
          },
        );
        continue;
      };
      if !instance.kind.serves(ItemKind::Bug) {
        rejected.insert(bugref, unsupported(&instance, ItemKind::Bug));
        continue;
      }
      match groups.iter_mut().find(|(i, _)| Arc::ptr_eq(i, &instance)) {
        Some((_, ids)) => ids.push(bugref.id.clone()),
        None => groups.push((instance, vec![bugref.id.clone()])),
      }
    }

    let outcomes = join_all(
      groups
        .iter()
        .map(|(instance, ids)| self.fetch_from(instance, ItemKind::Bug, ids, true)),
    )
    .await;

    let mut items = HashMap::new();
    let mut failures = HashMap::new();
    for outcome in outcomes {
      let outcome = outcome?;
      for item in outcome.items {
        items.insert((item.data.tracker.clone(), item.data.id.clone()), item);
      }
      for failure in outcome.failures {
        failures.insert((failure.tracker.clone(), failure.id.clone()), failure);
      }
    }

    let mut merged = FetchOutcome {
      items: Vec::with_capacity(items.len()),
      failures: Vec::with_capacity(failures.len() + rejected.len()),
      requested: refs.len(),
    };
    for bugref in &refs {
      if let Some(error) = rejected.remove(bugref) {
        merged.failures.push(FetchFailure {
          tracker: bugref.tracker.clone(),
          id: bugref.id.clone(),
          error,
        });
        continue;
      }
      let Some(instance) = self.trackers.by_tla(&bugref.tracker) else {
        continue;
      };
      let key = (instance.name.clone(), bugref.id.clone());
      if let Some(item) = items.remove(&key) {
        merged.items.push(item);
      }
      if let Some(failure) = failures.remove(&key) {
        merged.failures.push(failure);
      }
    }

    Ok(merged)
  }

  /// Re-fetch every bug some test in the shard is tagged with.
  pub async fn refresh_tagged(&self, shard: &str) -> Result<FetchOutcome<Item>> {
    let index = self.tag_index(shard)?;
    self.refresh(&index.bugrefs()).await
  }

  /// Parse `text` for tags and merge them into the shard's tag index.
  ///
  /// Returns the number of tags found in the text.
  pub async fn extract_tags(&self, shard: &str, text: &str) -> Result<usize> {
    let key = CacheKey::tag_index(shard);
    key.validate()?;

    let mut found = 0;
    let index = self
      .cache
      .update(
        &key,
        || TagIndex::new(shard),
        |index| found = bugrefs::extract_tags(index, text, &self.trackers),
      )
      .await?;

    info!(shard, found, tests = index.len(), "merged tags");
    Ok(found)
  }

  /// The shard's tag index; empty if nothing was tagged yet.
  pub fn tag_index(&self, shard: &str) -> Result<TagIndex> {
    let key = CacheKey::tag_index(shard);
    Ok(
      self
        .cache
        .get::<TagIndex>(&key)?
        .map(|cached| cached.data)
        .unwrap_or_else(|| TagIndex::new(shard)),
    )
  }

  async fn fetch_from(
    &self,
    instance: &Arc<TrackerInstance>,
    kind: ItemKind,
    ids: &[String],
    force: bool,
  ) -> Result<FetchOutcome<Item>> {
    let mut hits = HashMap::new();
    let mut fallback = HashMap::new();
    let mut misses = Vec::new();

    for id in ids {
      let key = CacheKey::item(kind, &instance.name, id);
      match self.cache.get::<Item>(&key)? {
        Some(cached) if cached.is_fresh() && !force => {
          hits.insert(id.clone(), cached);
        }
        Some(cached) => {
          fallback.insert(id.clone(), cached);
          misses.push(id.clone());
        }
        None => misses.push(id.clone()),
      }
    }

    debug!(
      tracker = %instance.name,
      %kind,
      hits = hits.len(),
      misses = misses.len(),
      "cache lookup"
    );

    let mut fetched: HashMap<String, Result<CacheResult<Item>>> = if misses.is_empty() {
      HashMap::new()
    } else {
      self.fetch_remote(instance, kind, misses).await.into_iter().collect()
    };

    let mut outcome = FetchOutcome {
      items: Vec::with_capacity(ids.len()),
      failures: Vec::new(),
      requested: ids.len(),
    };
    for id in ids {
      if let Some(hit) = hits.remove(id) {
        outcome.items.push(hit);
        continue;
      }

      let result = fetched.remove(id).unwrap_or_else(|| {
        Err(Error::Remote {
          tracker: instance.name.clone(),
          message: format!("no result for {}", id),
          status: None,
        })
      });
      match result {
        Ok(item) => outcome.items.push(item),
        Err(error) => {
          if let Some(old) = fallback.remove(id) {
            outcome.items.push(CacheResult::offline(old.data, old.cached_at));
          }
          outcome.failures.push(FetchFailure {
            tracker: instance.name.clone(),
            id: id.clone(),
            error,
          });
        }
      }
    }

    Ok(outcome)
  }

  /// Query the tracker for `ids`, in batches where the tracker allows it.
  ///
  /// Every request runs as its own task, so it still completes and lands in
  /// the cache if the caller stops waiting.
  async fn fetch_remote(
    &self,
    instance: &Arc<TrackerInstance>,
    kind: ItemKind,
    ids: Vec<String>,
  ) -> Vec<(String, Result<CacheResult<Item>>)> {
    let chunk_size = if instance.capabilities.batch {
      instance.capabilities.max_batch.max(1)
    } else {
      1
    };

    let tasks: Vec<_> = ids
      .chunks(chunk_size)
      .map(|chunk| {
        let chunk = chunk.to_vec();
        let task = tokio::spawn(self.clone().query_chunk(Arc::clone(instance), kind, chunk.clone()));
        (chunk, task)
      })
      .collect();

    let mut results = Vec::with_capacity(ids.len());
    for (chunk, task) in tasks {
      match task.await {
        Ok(chunk_results) => results.extend(chunk_results),
        Err(e) => {
          let error = Error::Remote {
            tracker: instance.name.clone(),
            message: format!("query task failed: {}", e),
            status: None,
          };
          results.extend(fail_all(&chunk, &error));
        }
      }
    }
    results
  }

  /// One remote request and the cache writes for its results.
  async fn query_chunk(
    self,
    instance: Arc<TrackerInstance>,
    kind: ItemKind,
    ids: Vec<String>,
  ) -> Vec<(String, Result<CacheResult<Item>>)> {
    let Ok(_permit) = self.permits.acquire().await else {
      let error = Error::Storage("request limiter closed".to_string());
      return fail_all(&ids, &error);
    };

    let mut returned: HashMap<String, Result<serde_json::Value>> =
      match self.query_with_relogin(&instance, kind, &ids).await {
        Ok(results) => results.into_iter().collect(),
        Err(error) => {
          warn!(tracker = %instance.name, ids = ids.len(), error = %error, "remote query failed");
          return fail_all(&ids, &error);
        }
      };
    let fetched_at = Utc::now();

    ids
      .into_iter()
      .map(|id| {
        let result = match returned.remove(&id) {
          Some(Ok(payload)) => {
            let item = Item::new(kind, &instance, id.clone(), payload, fetched_at);
            Ok(self.keep_freshest(item))
          }
          Some(Err(error)) => {
            debug!(tracker = %instance.name, id = %id, error = %error, "item not fetched");
            Err(error)
          }
          None => Err(Error::Remote {
            tracker: instance.name.clone(),
            message: format!("tracker returned nothing for {}", id),
            status: None,
          }),
        };
        (id, result)
      })
      .collect()
  }

  /// Write a fetched item back to the cache.
  ///
  /// When the cache already holds a copy fresher than `item` (a later
  /// response, or another process sharing the database), that copy wins and
  /// is returned instead.
  fn keep_freshest(&self, item: Item) -> CacheResult<Item> {
    let fetched_at = item.fetched_at;
    match self.cache.store(&item, fetched_at) {
      Ok(true) => {}
      Ok(false) => match self.cache.get::<Item>(&item.cache_key()) {
        Ok(Some(newer)) if newer.cached_at > fetched_at => {
          debug!(tracker = %item.tracker, id = %item.id, "cache holds a fresher copy");
          return newer;
        }
        Ok(_) => {}
        Err(e) => warn!(tracker = %item.tracker, id = %item.id, error = %e, "failed to read back item"),
      },
      Err(e) => warn!(tracker = %item.tracker, id = %item.id, error = %e, "failed to cache item"),
    }
    CacheResult::from_network(item, fetched_at)
  }

  /// Run a query, logging in again once if the tracker rejects the session.
  async fn query_with_relogin(
    &self,
    instance: &Arc<TrackerInstance>,
    kind: ItemKind,
    ids: &[String],
  ) -> Result<QueryResult> {
    let session = self.sessions.ensure_session(instance).await?;

    match self.timed_query(&session, kind, ids).await {
      Err(e) if e.is_auth() => {
        info!(tracker = %instance.name, error = %e, "session rejected, logging in again");
        self.sessions.invalidate(&session);

        let session = self.sessions.ensure_session(instance).await?;
        let result = self.timed_query(&session, kind, ids).await;
        if matches!(&result, Err(e) if e.is_auth()) {
          self.sessions.invalidate(&session);
        }
        result
      }
      other => other,
    }
  }

  async fn timed_query(&self, session: &Session, kind: ItemKind, ids: &[String]) -> Result<QueryResult> {
    let query = self.sessions.connector().query(session, kind, ids);

    match tokio::time::timeout(self.timeout, query).await {
      Ok(result) => result,
      Err(_) => Err(Error::Timeout {
        tracker: session.instance().name.clone(),
        ms: self.timeout.as_millis() as u64,
      }),
    }
  }
}

fn unsupported(instance: &TrackerInstance, kind: ItemKind) -> Error {
  Error::Unsupported {
    tracker: instance.name.clone(),
    kind: kind.to_string(),
  }
}

fn fail_all(ids: &[String], error: &Error) -> Vec<(String, Result<CacheResult<Item>>)> {
  ids
    .iter()
    .map(|id| (id.clone(), Err(error.duplicate())))
    .collect()
}

/// Drop repeats, keeping the first occurrence of each value.
fn dedupe<T: Clone + Eq + std::hash::Hash>(values: impl Iterator<Item = T>) -> Vec<T> {
  let mut seen = HashSet::new();
  values.filter(|v| seen.insert(v.clone())).collect()
}
