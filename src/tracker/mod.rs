//! Trackers are external systems which own the authoritative record of some
//! kind of item: Bugzilla and Redmine track bugs, openQA tracks test runs.
//!
//! Each configured tracker becomes an immutable [`TrackerInstance`]. The
//! [`TrackerKind`] tag on the instance selects the login and query encoding
//! used by the [`Connector`].

pub mod api_types;
pub mod connector;
pub mod session;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};

pub use connector::{Connector, HttpConnector, QueryResult};
pub use session::{Credentials, Session, SessionHandle, SessionManager};

/// Which API a tracker speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
  Bugzilla,
  Redmine,
  Jira,
  #[serde(rename = "openqa")]
  OpenQa,
  /// No remote API; used for placeholder instances
  Static,
}

impl TrackerKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Bugzilla => "bugzilla",
      Self::Redmine => "redmine",
      Self::Jira => "jira",
      Self::OpenQa => "openqa",
      Self::Static => "static",
    }
  }

  /// Whether trackers of this kind hold items of the given kind.
  pub fn serves(&self, item: ItemKind) -> bool {
    match self {
      Self::Bugzilla | Self::Redmine | Self::Jira => item == ItemKind::Bug,
      Self::OpenQa => item == ItemKind::TestRun,
      Self::Static => false,
    }
  }

  pub fn default_capabilities(&self) -> Capabilities {
    match self {
      Self::Bugzilla => Capabilities {
        batch: true,
        max_batch: 50,
      },
      _ => Capabilities {
        batch: false,
        max_batch: 1,
      },
    }
  }
}

impl fmt::Display for TrackerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The kind of artifact an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
  Bug,
  TestRun,
}

impl ItemKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Bug => "bug",
      Self::TestRun => "test_run",
    }
  }
}

impl fmt::Display for ItemKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ItemKind {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "bug" => Ok(Self::Bug),
      "test_run" | "test-run" | "job" => Ok(Self::TestRun),
      other => Err(format!("unknown item kind: {}", other)),
    }
  }
}

/// What a tracker's API can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
  /// Several ids can be retrieved with one request
  pub batch: bool,
  /// Largest number of ids sent in one request
  pub max_batch: usize,
}

/// Information about a tracker's instance
#[derive(Debug, Clone)]
pub struct TrackerInstance {
  /// Unique name from configuration
  pub name: String,
  /// Bug reference abbreviation, always lowercase
  pub tla: String,
  pub kind: TrackerKind,
  pub endpoint: Option<Url>,
  pub capabilities: Capabilities,
  pub user: Option<String>,
  /// Environment variable holding the secret
  pub token_env: Option<String>,
}

impl TrackerInstance {
  pub fn new(name: impl Into<String>, tla: &str, kind: TrackerKind, endpoint: Option<Url>) -> Self {
    Self {
      name: name.into(),
      tla: tla.to_lowercase(),
      kind,
      endpoint,
      capabilities: kind.default_capabilities(),
      user: None,
      token_env: None,
    }
  }

  /// Create a minimal tracker instance for an unknown tracker
  pub fn unknown(tla: &str) -> Self {
    Self::new(tla.to_lowercase(), tla, TrackerKind::Static, None)
  }

  pub fn is_placeholder(&self) -> bool {
    self.kind == TrackerKind::Static && self.endpoint.is_none()
  }
}

/// Tracker Repository
///
/// Immutable registry of the configured trackers, addressable by name or by
/// bug reference abbreviation.
#[derive(Debug, Default)]
pub struct TrackerRepo {
  instances: Vec<Arc<TrackerInstance>>,
  by_name: HashMap<String, usize>,
  by_tla: HashMap<String, usize>,
}

impl TrackerRepo {
  pub fn new(instances: Vec<TrackerInstance>) -> Result<Self> {
    let mut repo = Self::default();

    for instance in instances {
      let idx = repo.instances.len();
      if repo.by_name.insert(instance.name.clone(), idx).is_some() {
        return Err(Error::Config(format!(
          "duplicate tracker name: {}",
          instance.name
        )));
      }
      if repo.by_tla.insert(instance.tla.clone(), idx).is_some() {
        return Err(Error::Config(format!(
          "tracker abbreviation {} is used more than once",
          instance.tla
        )));
      }
      repo.instances.push(Arc::new(instance));
    }

    Ok(repo)
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    let instances = config
      .trackers
      .iter()
      .map(|(name, tc)| {
        if tc.api != TrackerKind::Static && tc.url.is_none() {
          return Err(Error::Config(format!("tracker {} needs a url", name)));
        }
        let tla = tc.tla.as_deref().unwrap_or(name);
        let mut instance = TrackerInstance::new(name.clone(), tla, tc.api, tc.url.clone());
        if let Some(batch) = tc.batch {
          instance.capabilities.batch = batch;
          if !batch {
            instance.capabilities.max_batch = 1;
          }
        }
        instance.user = tc.user.clone();
        instance.token_env = tc.token_env.clone();
        Ok(instance)
      })
      .collect::<Result<Vec<_>>>()?;

    Self::new(instances)
  }

  /// Look a tracker up by name, falling back to its abbreviation.
  pub fn instance_for(&self, name: &str) -> Result<Arc<TrackerInstance>> {
    self
      .by_name
      .get(name)
      .or_else(|| self.by_tla.get(&name.to_lowercase()))
      .map(|&idx| Arc::clone(&self.instances[idx]))
      .ok_or_else(|| Error::UnknownTracker {
        name: name.to_string(),
      })
  }

  pub fn by_tla(&self, tla: &str) -> Option<Arc<TrackerInstance>> {
    self
      .by_tla
      .get(&tla.to_lowercase())
      .map(|&idx| Arc::clone(&self.instances[idx]))
  }

  /// Resolve an abbreviation, inventing a placeholder when it is not configured.
  pub fn resolve_or_placeholder(&self, tla: &str) -> Arc<TrackerInstance> {
    self
      .by_tla(tla)
      .unwrap_or_else(|| Arc::new(TrackerInstance::unknown(tla)))
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<TrackerInstance>> {
    self.instances.iter()
  }

  pub fn len(&self) -> usize {
    self.instances.len()
  }

  pub fn is_empty(&self) -> bool {
    self.instances.is_empty()
  }
}
