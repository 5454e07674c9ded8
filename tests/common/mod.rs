//! Scripted in-process tracker shared by the integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use trackcache::cache::{CacheStore, SqliteStorage};
use trackcache::repository::{Repository, RepositoryOptions};
use trackcache::tracker::{
  Connector, Credentials, ItemKind, QueryResult, Session, SessionHandle, TrackerInstance,
  TrackerKind, TrackerRepo,
};
use trackcache::{Error, Result};

#[derive(Default)]
struct Script {
  /// Ids answered with a server error
  failing: HashSet<String>,
  /// Ids the tracker does not know
  missing: HashSet<String>,
  /// Ids that make their request take `query_delay`
  slow: HashSet<String>,
  query_delay: Duration,
  /// Delays for the next queries, one per request in arrival order
  staggered: VecDeque<Duration>,
  login_delay: Duration,
  fail_logins: bool,
  /// Upcoming queries rejected with an authentication error
  reject_queries: usize,
  /// Written into every payload, so refetched data can be told apart
  version: u64,
}

/// Fake tracker backend counting every call it receives.
#[derive(Default)]
pub struct FakeConnector {
  pub logins: AtomicUsize,
  pub queries: AtomicUsize,
  in_flight: AtomicUsize,
  pub peak_in_flight: AtomicUsize,
  batches: Mutex<Vec<Vec<String>>>,
  script: Mutex<Script>,
}

impl FakeConnector {
  pub fn new() -> Self {
    Self::default()
  }

  fn script(&self) -> std::sync::MutexGuard<'_, Script> {
    self.script.lock().unwrap()
  }

  pub fn fail_id(&self, id: &str) {
    self.script().failing.insert(id.to_string());
  }

  pub fn heal(&self) {
    self.script().failing.clear();
  }

  pub fn missing_id(&self, id: &str) {
    self.script().missing.insert(id.to_string());
  }

  pub fn slow_id(&self, id: &str, delay: Duration) {
    let mut script = self.script();
    script.slow.insert(id.to_string());
    script.query_delay = delay;
  }

  pub fn stagger(&self, delays: &[Duration]) {
    self.script().staggered.extend(delays.iter().copied());
  }

  pub fn login_delay(&self, delay: Duration) {
    self.script().login_delay = delay;
  }

  pub fn fail_logins(&self, fail: bool) {
    self.script().fail_logins = fail;
  }

  pub fn reject_queries(&self, count: usize) {
    self.script().reject_queries = count;
  }

  pub fn set_version(&self, version: u64) {
    self.script().version = version;
  }

  pub fn logins(&self) -> usize {
    self.logins.load(Ordering::SeqCst)
  }

  pub fn queries(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }

  /// Ids of every query so far, one entry per request.
  pub fn batches(&self) -> Vec<Vec<String>> {
    let mut batches = self.batches.lock().unwrap().clone();
    batches.sort();
    batches
  }
}

impl Connector for FakeConnector {
  async fn login(&self, instance: &Arc<TrackerInstance>, _credentials: &Credentials) -> Result<Session> {
    let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
    let (delay, fail) = {
      let script = self.script();
      (script.login_delay, script.fail_logins)
    };

    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    if fail {
      return Err(Error::Authentication {
        tracker: instance.name.clone(),
        message: "bad credentials".to_string(),
      });
    }

    Ok(Session::new(
      Arc::clone(instance),
      SessionHandle::Token(format!("token-{}", n)),
    ))
  }

  async fn query(&self, session: &Session, kind: ItemKind, ids: &[String]) -> Result<QueryResult> {
    let call = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
    self.batches.lock().unwrap().push(ids.to_vec());
    let tracker = session.instance().name.clone();

    let (delay, rejected, version) = {
      let mut script = self.script();
      let delay = if let Some(delay) = script.staggered.pop_front() {
        delay
      } else if ids.iter().any(|id| script.slow.contains(id)) {
        script.query_delay
      } else {
        Duration::ZERO
      };
      let rejected = script.reject_queries > 0;
      if rejected {
        script.reject_queries -= 1;
      }
      (delay, rejected, script.version)
    };

    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    if rejected {
      return Err(Error::Authentication {
        tracker,
        message: "session expired".to_string(),
      });
    }

    let token = match session.handle() {
      SessionHandle::Token(token) => token.clone(),
      _ => String::new(),
    };
    let script = self.script();
    Ok(
      ids
        .iter()
        .map(|id| {
          let result = if !session.instance().kind.serves(kind) {
            Err(Error::Unsupported {
              tracker: tracker.clone(),
              kind: kind.to_string(),
            })
          } else if script.failing.contains(id) {
            Err(Error::Remote {
              tracker: tracker.clone(),
              message: "HTTP 500".to_string(),
              status: Some(500),
            })
          } else if script.missing.contains(id) {
            Err(Error::NotFound {
              tracker: tracker.clone(),
              id: id.clone(),
            })
          } else {
            Ok(payload(id, version, call, &token))
          };
          (id.clone(), result)
        })
        .collect(),
    )
  }
}

fn payload(id: &str, version: u64, call: usize, token: &str) -> Value {
  json!({ "id": id, "version": version, "call": call, "session": token })
}

/// bsc (Bugzilla, batches of 2), poo (Redmine) and osd (openQA).
pub fn trackers() -> TrackerRepo {
  let mut bsc = TrackerInstance::new(
    "bugzilla.suse.com",
    "bsc",
    TrackerKind::Bugzilla,
    Some(Url::parse("https://bugzilla.suse.com").unwrap()),
  );
  bsc.capabilities.max_batch = 2;

  let poo = TrackerInstance::new(
    "progress.opensuse.org",
    "poo",
    TrackerKind::Redmine,
    Some(Url::parse("https://progress.opensuse.org").unwrap()),
  );
  let osd = TrackerInstance::new(
    "openqa.suse.de",
    "osd",
    TrackerKind::OpenQa,
    Some(Url::parse("https://openqa.suse.de").unwrap()),
  );

  TrackerRepo::new(vec![bsc, poo, osd]).unwrap()
}

pub fn options() -> RepositoryOptions {
  RepositoryOptions {
    request_timeout: Duration::from_millis(500),
    max_concurrent_requests: 8,
    max_age: chrono::Duration::minutes(60),
  }
}

pub fn repo() -> Repository<SqliteStorage, FakeConnector> {
  repo_with(SqliteStorage::open_in_memory().unwrap(), options())
}

pub fn repo_with<S: CacheStore>(storage: S, options: RepositoryOptions) -> Repository<S, FakeConnector> {
  Repository::new(trackers(), FakeConnector::new(), storage, options)
}

pub fn fake<S: CacheStore>(repo: &Repository<S, FakeConnector>) -> &FakeConnector {
  repo.sessions().connector()
}

pub fn ids(values: &[&str]) -> Vec<String> {
  values.iter().map(|v| v.to_string()).collect()
}
