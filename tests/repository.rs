//! Fetch and refresh behaviour of the repository against a scripted tracker.

mod common;

use chrono::Utc;
use common::{fake, ids, options, repo, repo_with};
use serde_json::json;
use std::time::Duration;

use trackcache::bugrefs::BugRef;
use trackcache::cache::{CacheKey, CacheSource, CacheStore, NoopStorage, SqliteStorage};
use trackcache::repository::{Item, RepositoryOptions};
use trackcache::tracker::ItemKind;
use trackcache::Error;

fn shown_ids(outcome: &trackcache::repository::FetchOutcome<Item>) -> Vec<String> {
  outcome.data().map(|item| item.id.clone()).collect()
}

fn failed_ids(outcome: &trackcache::repository::FetchOutcome<Item>) -> Vec<String> {
  outcome.failures.iter().map(|f| f.id.clone()).collect()
}

// ---------------------------------------------------------------------------
// Cache hits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_fetch_is_served_from_cache() {
  let repo = repo();

  let first = repo.fetch(ItemKind::Bug, "bsc", ["1", "2"]).await.unwrap();
  assert!(first.is_complete());
  assert!(first.items.iter().all(|r| r.source == CacheSource::Network));
  let logins = fake(&repo).logins();
  let queries = fake(&repo).queries();
  assert_eq!(logins, 1);
  assert_eq!(queries, 1);

  let second = repo.fetch(ItemKind::Bug, "bsc", ["1", "2"]).await.unwrap();
  assert!(second.items.iter().all(|r| r.source == CacheSource::CacheFresh));
  assert_eq!(fake(&repo).logins(), logins);
  assert_eq!(fake(&repo).queries(), queries);

  let a: Vec<_> = first.data().cloned().collect();
  let b: Vec<_> = second.data().cloned().collect();
  assert_eq!(a, b);
}

#[tokio::test]
async fn container_can_be_named_or_abbreviated() {
  let repo = repo();

  repo.fetch(ItemKind::Bug, "bugzilla.suse.com", ["1"]).await.unwrap();
  let again = repo.fetch(ItemKind::Bug, "BSC", ["1"]).await.unwrap();

  assert_eq!(again.items[0].source, CacheSource::CacheFresh);
  assert_eq!(fake(&repo).queries(), 1);
}

#[tokio::test]
async fn stale_entries_are_fetched_again() {
  let opts = RepositoryOptions {
    max_age: chrono::Duration::seconds(-1),
    ..options()
  };
  let repo = repo_with(SqliteStorage::open_in_memory().unwrap(), opts);

  repo.fetch(ItemKind::Bug, "poo", ["1"]).await.unwrap();
  repo.fetch(ItemKind::Bug, "poo", ["1"]).await.unwrap();

  assert_eq!(fake(&repo).queries(), 2);
  assert_eq!(fake(&repo).logins(), 1);
}

#[tokio::test]
async fn disabled_cache_always_goes_remote() {
  let repo = repo_with(NoopStorage, options());

  repo.fetch(ItemKind::Bug, "poo", ["1"]).await.unwrap();
  let again = repo.fetch(ItemKind::Bug, "poo", ["1"]).await.unwrap();

  assert_eq!(again.items[0].source, CacheSource::Network);
  assert_eq!(fake(&repo).queries(), 2);
}

// ---------------------------------------------------------------------------
// Ordering and identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn results_follow_requested_order() {
  let repo = repo();
  repo.fetch(ItemKind::Bug, "poo", ["2"]).await.unwrap();

  let outcome = repo
    .fetch(ItemKind::Bug, "poo", ["3", "2", "1", "3"])
    .await
    .unwrap();

  assert_eq!(shown_ids(&outcome), ids(&["3", "2", "1"]));
  assert_eq!(outcome.requested, 3);
  assert_eq!(outcome.items[1].source, CacheSource::CacheFresh);
  assert_eq!(outcome.items[0].source, CacheSource::Network);
  // Only the misses went out
  assert_eq!(fake(&repo).queries(), 3);
}

#[tokio::test]
async fn unknown_container_fails_the_call() {
  let repo = repo();

  let err = repo.fetch(ItemKind::Bug, "gh", ["1"]).await.unwrap_err();
  assert!(matches!(err, Error::UnknownTracker { name } if name == "gh"));
  assert_eq!(fake(&repo).logins(), 0);
}

#[tokio::test]
async fn test_runs_come_from_openqa() {
  let repo = repo();

  let runs = repo.fetch(ItemKind::TestRun, "osd", ["4711"]).await.unwrap();
  assert!(runs.is_complete());
  assert_eq!(runs.items[0].data.kind, ItemKind::TestRun);
  assert_eq!(runs.items[0].data.payload["id"], "4711");

  assert_eq!(fake(&repo).logins(), 1);
  assert_eq!(fake(&repo).queries(), 1);
}

#[tokio::test]
async fn wrong_item_kind_fails_before_any_remote_work() {
  let repo = repo();

  let err = repo.fetch(ItemKind::TestRun, "bsc", ["1"]).await.unwrap_err();
  assert!(matches!(
    &err,
    Error::Unsupported { tracker, kind } if tracker == "bugzilla.suse.com" && kind == "test_run"
  ));
  assert!(!err.is_retryable());

  let err = repo.fetch(ItemKind::Bug, "osd", ["4711"]).await.unwrap_err();
  assert!(matches!(err, Error::Unsupported { .. }));

  assert_eq!(fake(&repo).logins(), 0);
  assert_eq!(fake(&repo).queries(), 0);
}

// ---------------------------------------------------------------------------
// Partial failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_failing_id_does_not_fail_the_rest() {
  let repo = repo();
  fake(&repo).fail_id("2");

  let outcome = repo.fetch(ItemKind::Bug, "poo", ["1", "2", "3"]).await.unwrap();

  assert_eq!(shown_ids(&outcome), ids(&["1", "3"]));
  assert_eq!(failed_ids(&outcome), ids(&["2"]));
  assert!(matches!(
    outcome.partial_error(),
    Some(Error::PartialFetch {
      failed: 1,
      requested: 3
    })
  ));
}

#[tokio::test]
async fn failures_inside_a_batch_stay_per_id() {
  let repo = repo();
  fake(&repo).missing_id("2");

  let outcome = repo.fetch(ItemKind::Bug, "bsc", ["1", "2"]).await.unwrap();

  assert_eq!(shown_ids(&outcome), ids(&["1"]));
  assert!(matches!(
    &outcome.failures[0].error,
    Error::NotFound { id, .. } if id == "2"
  ));
}

#[tokio::test]
async fn failed_fetch_leaves_cache_entry_alone() {
  let repo = repo();
  repo.fetch(ItemKind::Bug, "bsc", ["1"]).await.unwrap();

  let key = CacheKey::item(ItemKind::Bug, "bugzilla.suse.com", "1");
  let before = repo.cache().storage().get(&key).unwrap().unwrap();

  fake(&repo).set_version(2);
  fake(&repo).fail_id("1");
  let outcome = repo.refresh(&[BugRef::new("bsc", "1")]).await.unwrap();

  // Old copy is served, and the failure is still reported
  assert_eq!(failed_ids(&outcome), ids(&["1"]));
  assert_eq!(outcome.items.len(), 1);
  assert_eq!(outcome.items[0].source, CacheSource::Offline);
  assert_eq!(outcome.items[0].data.payload["version"], 0);

  let after = repo.cache().storage().get(&key).unwrap().unwrap();
  assert_eq!(after, before);
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refresh_always_goes_remote() {
  let repo = repo();
  repo.fetch(ItemKind::Bug, "bsc", ["1", "2"]).await.unwrap();
  repo.fetch(ItemKind::Bug, "poo", ["9"]).await.unwrap();
  let queries = fake(&repo).queries();

  fake(&repo).set_version(7);
  let refs = vec![
    BugRef::new("poo", "9"),
    BugRef::new("bsc", "2"),
    BugRef::new("bsc", "1"),
  ];
  let outcome = repo.refresh(&refs).await.unwrap();

  assert!(outcome.is_complete());
  assert_eq!(shown_ids(&outcome), ids(&["9", "2", "1"]));
  assert!(outcome.items.iter().all(|r| r.source == CacheSource::Network));
  assert!(outcome.data().all(|item| item.payload["version"] == 7));
  // One request per tracker: bsc batches both ids, poo has a single id
  assert_eq!(fake(&repo).queries(), queries + 2);

  // The cache now holds the refreshed copy
  let cached = repo.fetch(ItemKind::Bug, "bsc", ["1"]).await.unwrap();
  assert_eq!(cached.items[0].source, CacheSource::CacheFresh);
  assert_eq!(cached.items[0].data.payload["version"], 7);
}

#[tokio::test]
async fn refresh_reports_unknown_trackers() {
  let repo = repo();

  let outcome = repo
    .refresh(&[BugRef::new("gh", "5"), BugRef::new("poo", "1")])
    .await
    .unwrap();

  assert_eq!(shown_ids(&outcome), ids(&["1"]));
  assert_eq!(outcome.failures.len(), 1);
  assert!(matches!(
    &outcome.failures[0].error,
    Error::UnknownTracker { name } if name == "gh"
  ));
}

#[tokio::test]
async fn refresh_rejects_trackers_without_bugs() {
  let repo = repo();

  let outcome = repo
    .refresh(&[BugRef::new("osd", "4711"), BugRef::new("bsc", "1")])
    .await
    .unwrap();

  assert_eq!(shown_ids(&outcome), ids(&["1"]));
  assert_eq!(failed_ids(&outcome), ids(&["4711"]));
  assert!(matches!(outcome.failures[0].error, Error::Unsupported { .. }));
  // only bsc was contacted
  assert_eq!(fake(&repo).batches(), vec![ids(&["1"])]);
  assert_eq!(fake(&repo).logins(), 1);
}

// ---------------------------------------------------------------------------
// Batching and concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batches_respect_tracker_limit() {
  let repo = repo();

  let outcome = repo
    .fetch(ItemKind::Bug, "bsc", ["1", "2", "3", "4", "5"])
    .await
    .unwrap();

  assert!(outcome.is_complete());
  assert_eq!(
    fake(&repo).batches(),
    vec![ids(&["1", "2"]), ids(&["3", "4"]), ids(&["5"])]
  );
}

#[tokio::test]
async fn trackers_without_batching_get_one_request_per_id() {
  let repo = repo();

  repo.fetch(ItemKind::Bug, "poo", ["1", "2", "3"]).await.unwrap();

  assert_eq!(
    fake(&repo).batches(),
    vec![ids(&["1"]), ids(&["2"]), ids(&["3"])]
  );
}

#[tokio::test(start_paused = true)]
async fn remote_requests_are_bounded() {
  let opts = RepositoryOptions {
    max_concurrent_requests: 2,
    ..options()
  };
  let repo = repo_with(SqliteStorage::open_in_memory().unwrap(), opts);
  for id in ["1", "2", "3", "4", "5", "6"] {
    fake(&repo).slow_id(id, Duration::from_millis(50));
  }

  let outcome = repo
    .fetch(ItemKind::Bug, "poo", ["1", "2", "3", "4", "5", "6"])
    .await
    .unwrap();

  assert!(outcome.is_complete());
  assert_eq!(
    fake(&repo)
      .peak_in_flight
      .load(std::sync::atomic::Ordering::SeqCst),
    2
  );
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_session_is_replaced_once() {
  let repo = repo();
  fake(&repo).reject_queries(1);

  let outcome = repo.fetch(ItemKind::Bug, "bsc", ["1"]).await.unwrap();

  assert!(outcome.is_complete());
  assert_eq!(fake(&repo).logins(), 2);
  assert_eq!(fake(&repo).queries(), 2);
  assert_eq!(outcome.items[0].data.payload["session"], "token-2");
}

#[tokio::test]
async fn persistent_rejection_becomes_a_failure() {
  let repo = repo();
  fake(&repo).reject_queries(10);

  let outcome = repo.fetch(ItemKind::Bug, "bsc", ["1", "2"]).await.unwrap();

  assert!(outcome.items.is_empty());
  assert_eq!(failed_ids(&outcome), ids(&["1", "2"]));
  assert!(outcome.failures.iter().all(|f| f.error.is_auth()));
  // One retry, no more
  assert_eq!(fake(&repo).logins(), 2);
  assert_eq!(fake(&repo).queries(), 2);
}

#[tokio::test]
async fn failed_login_fails_every_id() {
  let repo = repo();
  fake(&repo).fail_logins(true);

  let outcome = repo.fetch(ItemKind::Bug, "poo", ["1", "2"]).await.unwrap();

  assert_eq!(failed_ids(&outcome), ids(&["1", "2"]));
  assert!(outcome.failures.iter().all(|f| f.error.is_auth()));
  assert_eq!(fake(&repo).queries(), 0);

  // Nothing about the failure is remembered
  fake(&repo).fail_logins(false);
  let outcome = repo.fetch(ItemKind::Bug, "poo", ["1", "2"]).await.unwrap();
  assert!(outcome.is_complete());
}

// ---------------------------------------------------------------------------
// Timeouts and cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timeout_fails_only_the_slow_id() {
  let repo = repo();
  fake(&repo).slow_id("2", Duration::from_secs(5));

  let outcome = repo.fetch(ItemKind::Bug, "poo", ["1", "2", "3"]).await.unwrap();

  assert_eq!(shown_ids(&outcome), ids(&["1", "3"]));
  assert_eq!(failed_ids(&outcome), ids(&["2"]));
  assert!(matches!(
    outcome.failures[0].error,
    Error::Timeout { ms: 500, .. }
  ));
  assert!(outcome.failures[0].error.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn abandoned_fetch_still_fills_the_cache() {
  let repo = repo();
  fake(&repo).slow_id("1", Duration::from_millis(200));

  let abandoned = tokio::time::timeout(
    Duration::from_millis(50),
    repo.fetch(ItemKind::Bug, "poo", ["1"]),
  )
  .await;
  assert!(abandoned.is_err());

  tokio::time::sleep(Duration::from_millis(400)).await;

  let key = CacheKey::item(ItemKind::Bug, "progress.opensuse.org", "1");
  assert!(repo.cache().storage().get(&key).unwrap().is_some());

  let outcome = repo.fetch(ItemKind::Bug, "poo", ["1"]).await.unwrap();
  assert_eq!(outcome.items[0].source, CacheSource::CacheFresh);
  assert_eq!(fake(&repo).queries(), 1);
}

#[tokio::test(start_paused = true)]
async fn last_completed_refresh_wins() {
  let repo = repo();
  let bug = vec![BugRef::new("bsc", "1")];
  // the first request is slow, the second overtakes it
  fake(&repo).stagger(&[Duration::from_millis(100), Duration::from_millis(10)]);

  let slow = tokio::spawn({
    let repo = repo.clone();
    let bug = bug.clone();
    async move { repo.refresh(&bug).await.unwrap() }
  });
  tokio::time::sleep(Duration::from_millis(1)).await;
  let quick = repo.refresh(&bug).await.unwrap();
  let slow = slow.await.unwrap();

  assert_eq!(quick.items[0].data.payload["call"], 2);
  assert_eq!(slow.items[0].data.payload["call"], 1);
  assert!(slow.items[0].cached_at >= quick.items[0].cached_at);

  let key = CacheKey::item(ItemKind::Bug, "bugzilla.suse.com", "1");
  let entry = repo.cache().storage().get(&key).unwrap().unwrap();
  let cached: Item = serde_json::from_slice(&entry.value).unwrap();
  assert_eq!(cached.payload["call"], 1);
  assert_eq!(
    entry.fresh_at.timestamp_micros(),
    slow.items[0].cached_at.timestamp_micros()
  );

  let outcome = repo.fetch(ItemKind::Bug, "bsc", ["1"]).await.unwrap();
  assert_eq!(outcome.items[0].source, CacheSource::CacheFresh);
  assert_eq!(outcome.items[0].data.payload["call"], 1);
}

#[tokio::test]
async fn fresher_cached_copy_beats_older_response() {
  let repo = repo();
  let instance = repo.trackers().instance_for("bsc").unwrap();
  // written by another process sharing the cache, after our request went out
  let later = Utc::now() + chrono::Duration::minutes(5);
  let newer = Item::new(ItemKind::Bug, &instance, "1", json!({ "id": "1", "version": 99 }), later);
  assert!(repo.cache().store(&newer, later).unwrap());

  let outcome = repo.refresh(&[BugRef::new("bsc", "1")]).await.unwrap();

  assert_eq!(fake(&repo).queries(), 1);
  assert!(outcome.is_complete());
  assert_eq!(outcome.items[0].data.payload["version"], 99);
  assert_eq!(outcome.items[0].source, CacheSource::CacheFresh);
  assert_eq!(outcome.items[0].cached_at.timestamp_micros(), later.timestamp_micros());

  let key = CacheKey::item(ItemKind::Bug, "bugzilla.suse.com", "1");
  let entry = repo.cache().storage().get(&key).unwrap().unwrap();
  let cached: Item = serde_json::from_slice(&entry.value).unwrap();
  assert_eq!(cached.payload["version"], 99);
}
