use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{CacheKey, Cacheable};
use crate::tracker::{ItemKind, TrackerInstance, TrackerKind};

/// One tracked artifact as last seen on its tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
  pub kind: ItemKind,
  /// Name of the tracker instance the item lives on
  pub tracker: String,
  pub tracker_kind: TrackerKind,
  pub id: String,
  /// Whatever the tracker returned for the item
  pub payload: Value,
  pub fetched_at: DateTime<Utc>,
}

impl Item {
  pub fn new(
    kind: ItemKind,
    instance: &TrackerInstance,
    id: impl Into<String>,
    payload: Value,
    fetched_at: DateTime<Utc>,
  ) -> Self {
    Self {
      kind,
      tracker: instance.name.clone(),
      tracker_kind: instance.kind,
      id: id.into(),
      payload,
      fetched_at,
    }
  }

  /// Look up a top level field of the payload, e.g. `status`.
  pub fn field(&self, name: &str) -> Option<&Value> {
    self.payload.get(name)
  }
}

impl Cacheable for Item {
  fn cache_key(&self) -> CacheKey {
    CacheKey::item(self.kind, &self.tracker, &self.id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn key_matches_identity() {
    let instance = TrackerInstance::new("bugzilla.suse.com", "bsc", TrackerKind::Bugzilla, None);
    let item = Item::new(
      ItemKind::Bug,
      &instance,
      "1234",
      json!({"id": 1234, "status": "NEW"}),
      Utc::now(),
    );

    assert_eq!(
      item.cache_key(),
      CacheKey::item(ItemKind::Bug, "bugzilla.suse.com", "1234")
    );
    assert_eq!(item.field("status"), Some(&json!("NEW")));
    assert!(item.field("resolution").is_none());
  }
}
