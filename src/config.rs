use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::tracker::TrackerKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Tracker name -> connection parameters
  #[serde(default)]
  pub trackers: BTreeMap<String, TrackerConfig>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  #[serde(default = "default_max_concurrent_requests")]
  pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
  pub api: TrackerKind,
  pub url: Option<Url>,
  /// Bug reference abbreviation (e.g. "bsc"); defaults to the tracker name
  pub tla: Option<String>,
  pub user: Option<String>,
  /// Environment variable holding the password or API token
  pub token_env: Option<String>,
  /// Override whether the tracker is queried with batched requests
  pub batch: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/trackcache/cache.db)
  pub path: Option<PathBuf>,
  /// How long a cached item counts as fresh
  #[serde(default = "default_max_age_minutes")]
  pub max_age_minutes: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      max_age_minutes: default_max_age_minutes(),
    }
  }
}

fn default_request_timeout_secs() -> u64 {
  30
}

fn default_max_concurrent_requests() -> usize {
  8
}

fn default_max_age_minutes() -> i64 {
  60
}

impl Default for Config {
  fn default() -> Self {
    Self {
      trackers: BTreeMap::new(),
      cache: CacheConfig::default(),
      request_timeout_secs: default_request_timeout_secs(),
      max_concurrent_requests: default_max_concurrent_requests(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// With an explicit path only that file is read. Otherwise
  /// `./trackcache.yaml` is read first and `$XDG_CONFIG_HOME/trackcache/config.yaml`
  /// is layered on top of it; the user file wins on conflicts.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(p) = explicit_path {
      if !p.exists() {
        return Err(Error::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
      let value = Self::read_value(p)?;
      return Self::from_value(value, &p.display().to_string());
    }

    let layers: Vec<PathBuf> = Self::config_files()
      .into_iter()
      .filter(|p| p.exists())
      .collect();

    if layers.is_empty() {
      return Err(Error::Config(
        "No configuration file found. Create one at ~/.config/trackcache/config.yaml\n\
         See config.example.yaml for the format."
          .to_string(),
      ));
    }

    let mut merged = serde_yaml::Value::Mapping(Default::default());
    for path in &layers {
      merged = merge(merged, Self::read_value(path)?);
    }

    Self::from_value(merged, "merged configuration")
  }

  /// Parse configuration from a YAML string.
  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    let config: Self = serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
    config.validate()
  }

  fn config_files() -> Vec<PathBuf> {
    let mut files = vec![PathBuf::from("trackcache.yaml")];
    if let Some(config_dir) = dirs::config_dir() {
      files.push(config_dir.join("trackcache").join("config.yaml"));
    }
    files
  }

  fn read_value(path: &Path) -> Result<serde_yaml::Value> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    serde_yaml::from_str(&contents).map_err(|e| {
      Error::Config(format!(
        "Failed to parse config file {}: {}",
        path.display(),
        e
      ))
    })
  }

  fn from_value(value: serde_yaml::Value, origin: &str) -> Result<Self> {
    let config: Self = serde_yaml::from_value(value)
      .map_err(|e| Error::Config(format!("Invalid configuration in {}: {}", origin, e)))?;
    config.validate()
  }

  fn validate(self) -> Result<Self> {
    if chrono::Duration::try_minutes(self.cache.max_age_minutes).is_none() {
      return Err(Error::Config(format!(
        "cache.max_age_minutes out of range: {}",
        self.cache.max_age_minutes
      )));
    }
    Ok(self)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  /// Freshness window; out of range values fall back to the default.
  pub fn max_age(&self) -> chrono::Duration {
    chrono::Duration::try_minutes(self.cache.max_age_minutes)
      .unwrap_or_else(|| chrono::Duration::minutes(default_max_age_minutes()))
  }

  /// Get the cache database path.
  pub fn cache_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("trackcache").join("cache.db"))
  }
}

/// Merge two YAML documents. Mappings are merged key by key, anything else in
/// `overlay` replaces `base`.
fn merge(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
  use serde_yaml::Value;

  match (base, overlay) {
    (Value::Mapping(mut base), Value::Mapping(overlay)) => {
      for (key, value) in overlay {
        let merged = match base.remove(&key) {
          Some(existing) => merge(existing, value),
          None => value,
        };
        base.insert(key, merged);
      }
      Value::Mapping(base)
    }
    (_, overlay) => overlay,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
trackers:
  bugzilla.suse.com:
    api: bugzilla
    url: https://bugzilla.suse.com
    tla: bsc
    token_env: BSC_API_KEY
  progress:
    api: redmine
    url: https://progress.opensuse.org
    tla: poo
cache:
  max_age_minutes: 15
request_timeout_secs: 5
"#;

  #[test]
  fn parses_trackers_and_defaults() {
    let config = Config::from_yaml_str(SAMPLE).unwrap();

    assert_eq!(config.trackers.len(), 2);
    let bsc = &config.trackers["bugzilla.suse.com"];
    assert_eq!(bsc.api, TrackerKind::Bugzilla);
    assert_eq!(bsc.tla.as_deref(), Some("bsc"));
    assert_eq!(bsc.token_env.as_deref(), Some("BSC_API_KEY"));
    assert_eq!(config.request_timeout(), Duration::from_secs(5));
    assert_eq!(config.max_age(), chrono::Duration::minutes(15));
    assert_eq!(config.max_concurrent_requests, 8);
  }

  #[test]
  fn rejects_unknown_api() {
    let err = Config::from_yaml_str("trackers:\n  x:\n    api: gopher\n").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
  }

  #[test]
  fn out_of_range_max_age_is_a_config_error() {
    let err = Config::from_yaml_str("cache:\n  max_age_minutes: 9223372036854775807\n").unwrap_err();
    assert!(matches!(err, Error::Config(ref msg) if msg.contains("max_age_minutes")));

    let value: serde_yaml::Value =
      serde_yaml::from_str("cache:\n  max_age_minutes: -9223372036854775808\n").unwrap();
    assert!(matches!(Config::from_value(value, "test"), Err(Error::Config(_))));

    let mut config = Config::default();
    config.cache.max_age_minutes = i64::MAX;
    assert_eq!(config.max_age(), chrono::Duration::minutes(60));
  }

  #[test]
  fn user_layer_wins_and_mappings_merge() {
    let base: serde_yaml::Value = serde_yaml::from_str(SAMPLE).unwrap();
    let user: serde_yaml::Value = serde_yaml::from_str(
      r#"
trackers:
  progress:
    user: tester
cache:
  max_age_minutes: 120
"#,
    )
    .unwrap();

    let config = Config::from_value(merge(base, user), "test").unwrap();

    assert_eq!(config.trackers.len(), 2);
    let poo = &config.trackers["progress"];
    assert_eq!(poo.user.as_deref(), Some("tester"));
    assert_eq!(poo.tla.as_deref(), Some("poo"));
    assert_eq!(config.cache.max_age_minutes, 120);
    assert_eq!(config.request_timeout_secs, 5);
  }

  #[test]
  fn example_config_is_valid() {
    let config = Config::from_yaml_str(include_str!("../config.example.yaml")).unwrap();
    assert_eq!(config.trackers["openqa.suse.de"].api, TrackerKind::OpenQa);
    assert_eq!(config.trackers["bugzilla.opensuse.org"].batch, Some(false));
  }
}
