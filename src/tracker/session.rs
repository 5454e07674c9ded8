//! Authenticated connections to trackers.
//!
//! The [`SessionManager`] keeps at most one canonical session per tracker
//! instance. Logins are single-flight: callers arriving while a login is in
//! progress wait on that login and share its outcome, including a failure.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connector::Connector;
use super::TrackerInstance;
use crate::error::{Error, Result};

/// Login material for one tracker.
#[derive(Clone, Default)]
pub struct Credentials {
  pub user: Option<String>,
  /// Password or API token
  pub secret: Option<String>,
}

impl Credentials {
  /// Read the credentials referenced by a tracker's configuration.
  ///
  /// The secret comes from the environment variable named by `token_env`.
  /// A missing variable is not an error; the tracker may allow anonymous reads.
  pub fn for_instance(instance: &TrackerInstance) -> Self {
    let secret = instance
      .token_env
      .as_deref()
      .and_then(|var| std::env::var(var).ok())
      .filter(|s| !s.is_empty());

    Self {
      user: instance.user.clone(),
      secret,
    }
  }
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("user", &self.user)
      .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
      .finish()
  }
}

/// Tracker specific authentication state carried by a session.
#[derive(Clone)]
pub enum SessionHandle {
  /// Not really a session
  Anonymous,
  /// Static API key sent with every request
  ApiKey(String),
  /// Token obtained from a login round trip
  Token(String),
  Jira(gouqi::r#async::Jira),
}

impl fmt::Debug for SessionHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Anonymous => f.write_str("Anonymous"),
      Self::ApiKey(_) => f.write_str("ApiKey([REDACTED])"),
      Self::Token(_) => f.write_str("Token([REDACTED])"),
      Self::Jira(_) => f.write_str("Jira"),
    }
  }
}

/// A connection to a tracker API
#[derive(Debug)]
pub struct Session {
  instance: Arc<TrackerInstance>,
  handle: SessionHandle,
  created_at: DateTime<Utc>,
  last_activity: Mutex<DateTime<Utc>>,
  valid: AtomicBool,
}

impl Session {
  pub fn new(instance: Arc<TrackerInstance>, handle: SessionHandle) -> Self {
    let now = Utc::now();
    Self {
      instance,
      handle,
      created_at: now,
      last_activity: Mutex::new(now),
      valid: AtomicBool::new(true),
    }
  }

  pub fn instance(&self) -> &TrackerInstance {
    &self.instance
  }

  pub fn handle(&self) -> &SessionHandle {
    &self.handle
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  pub fn last_activity(&self) -> DateTime<Utc> {
    *self
      .last_activity
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Record that the session was just used.
  pub fn touch(&self) {
    let mut last = self
      .last_activity
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    *last = Utc::now().max(*last);
  }

  pub fn is_valid(&self) -> bool {
    self.valid.load(Ordering::Acquire)
  }

  fn invalidate(&self) {
    self.valid.store(false, Ordering::Release);
  }
}

/// Login failure shared between every caller waiting on the same login.
#[derive(Debug, Clone)]
struct LoginError {
  tracker: String,
  message: String,
}

impl From<LoginError> for Error {
  fn from(e: LoginError) -> Self {
    Error::Authentication {
      tracker: e.tracker,
      message: e.message,
    }
  }
}

type LoginFuture = Shared<BoxFuture<'static, std::result::Result<Arc<Session>, LoginError>>>;

enum Slot {
  Pending { generation: u64, login: LoginFuture },
  Ready(Arc<Session>),
}

/// Registry of live sessions, one slot per tracker instance.
///
/// Slots are independent, so logins to different trackers run concurrently.
pub struct SessionManager<C: Connector> {
  connector: Arc<C>,
  timeout: Duration,
  slots: Mutex<HashMap<String, Slot>>,
  generation: AtomicU64,
}

impl<C: Connector> SessionManager<C> {
  pub fn new(connector: Arc<C>, timeout: Duration) -> Self {
    Self {
      connector,
      timeout,
      slots: Mutex::new(HashMap::new()),
      generation: AtomicU64::new(0),
    }
  }

  pub fn connector(&self) -> &Arc<C> {
    &self.connector
  }

  /// Returns an active session
  ///
  /// If the tracker already has a valid session it is returned without any
  /// I/O. Otherwise a login is started, or joined if one is already running.
  pub async fn ensure_session(&self, instance: &Arc<TrackerInstance>) -> Result<Arc<Session>> {
    let (generation, login) = {
      let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

      match slots.get(&instance.name) {
        Some(Slot::Ready(session)) if session.is_valid() => return Ok(Arc::clone(session)),
        Some(Slot::Pending { generation, login }) => {
          debug!(tracker = %instance.name, "joining login in progress");
          (*generation, login.clone())
        }
        _ => {
          let generation = self.generation.fetch_add(1, Ordering::Relaxed);
          let login = self.start_login(instance);
          slots.insert(
            instance.name.clone(),
            Slot::Pending {
              generation,
              login: login.clone(),
            },
          );
          (generation, login)
        }
      }
    };

    let outcome = login.await;
    self.settle(&instance.name, generation, &outcome);
    outcome.map_err(Error::from)
  }

  /// Drop a session after the tracker rejected it.
  ///
  /// Only the canonical session is removed; if a newer session has already
  /// replaced it, the slot is left alone.
  pub fn invalidate(&self, session: &Arc<Session>) {
    session.invalidate();

    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    let name = &session.instance().name;
    if let Some(Slot::Ready(current)) = slots.get(name) {
      if Arc::ptr_eq(current, session) {
        warn!(tracker = %name, "session invalidated");
        slots.remove(name);
      }
    }
  }

  /// The canonical session for a tracker, if one is live.
  pub fn current(&self, name: &str) -> Option<Arc<Session>> {
    let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    match slots.get(name) {
      Some(Slot::Ready(session)) if session.is_valid() => Some(Arc::clone(session)),
      _ => None,
    }
  }

  /// Spawn the login so that it completes even if every waiter goes away.
  fn start_login(&self, instance: &Arc<TrackerInstance>) -> LoginFuture {
    let connector = Arc::clone(&self.connector);
    let instance = Arc::clone(instance);
    let timeout = self.timeout;
    let tracker = instance.name.clone();

    let task = tokio::spawn(async move {
      let credentials = Credentials::for_instance(&instance);
      info!(tracker = %instance.name, kind = %instance.kind, "logging in");

      match tokio::time::timeout(timeout, connector.login(&instance, &credentials)).await {
        Ok(Ok(session)) => Ok(Arc::new(session)),
        Ok(Err(e)) => Err(LoginError {
          tracker: instance.name.clone(),
          message: match e {
            Error::Authentication { message, .. } => message,
            other => other.to_string(),
          },
        }),
        Err(_) => Err(LoginError {
          tracker: instance.name.clone(),
          message: format!("login timed out after {}ms", timeout.as_millis()),
        }),
      }
    });

    async move {
      task.await.unwrap_or_else(|e| {
        Err(LoginError {
          tracker,
          message: format!("login task failed: {}", e),
        })
      })
    }
    .boxed()
    .shared()
  }

  /// Replace a finished pending login with its result.
  fn settle(
    &self,
    name: &str,
    generation: u64,
    outcome: &std::result::Result<Arc<Session>, LoginError>,
  ) {
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

    let is_ours = matches!(
      slots.get(name),
      Some(Slot::Pending { generation: g, .. }) if *g == generation
    );
    if !is_ours {
      return;
    }

    match outcome {
      Ok(session) => {
        slots.insert(name.to_string(), Slot::Ready(Arc::clone(session)));
      }
      Err(e) => {
        warn!(tracker = %name, error = %e.message, "login failed");
        slots.remove(name);
      }
    }
  }
}
