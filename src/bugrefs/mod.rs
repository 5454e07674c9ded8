//! Bug references and tags.
//!
//! Bug references are a short abbreviation for a tracker instance (e.g.
//! bugzilla.suse.com -> bsc) followed by `#` and an id, so for example
//! `bsc#12345`.
//!
//! Test failures can be tagged with a bug reference, which usually looks like
//! `test01:bsc#12345`. Anti-tags such as `test01:!bsc#12345` signal that a
//! failure should no longer be associated with that bug. Tags are typically
//! found in comments on test failures, but can be taken from any text.

mod parser;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::cache::{CacheKey, Cacheable};
use crate::tracker::TrackerRepo;

pub use parser::{parse_comment, parse_refs, TagMatch};

/// A reference to a bug on a particular tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BugRef {
  /// Tracker abbreviation, lowercase
  pub tracker: String,
  pub id: String,
}

impl BugRef {
  pub fn new(tracker: &str, id: &str) -> Self {
    Self {
      tracker: tracker.to_lowercase(),
      id: id.to_string(),
    }
  }
}

impl fmt::Display for BugRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.tracker, self.id)
  }
}

impl FromStr for BugRef {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match parse_refs(s).as_slice() {
      [bugref] if bugref.to_string().len() == s.trim().len() => Ok(bugref.clone()),
      _ => Err(format!("not a bug reference: {}", s)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
  Positive,
  Negative,
}

impl Polarity {
  pub fn is_negative(&self) -> bool {
    *self == Self::Negative
  }
}

/// An association (or its negation) between a test and a bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
  pub test: String,
  pub bugref: BugRef,
  pub polarity: Polarity,
  /// Name of the tracker instance the abbreviation resolved to
  pub tracker: String,
  /// Text the tag was read from
  pub provenance: String,
}

/// What merging one tag did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
  Added,
  /// A positive tag was replaced by its negation
  Negated,
  Unchanged,
}

/// Reducer for one (test, bug) pair: the stored polarity, if any, combined
/// with an incoming one. A negation is never undone, so the result does not
/// depend on the order tags arrive in.
fn reduce(existing: Option<Polarity>, incoming: Polarity) -> Option<Polarity> {
  match (existing, incoming) {
    (None, p) => Some(p),
    (Some(Polarity::Negative), _) => None,
    (Some(Polarity::Positive), Polarity::Negative) => Some(Polarity::Negative),
    (Some(Polarity::Positive), Polarity::Positive) => None,
  }
}

/// Mapping from test name to its tags, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagIndex {
  pub shard: String,
  tests: BTreeMap<String, Vec<Tag>>,
}

impl TagIndex {
  pub fn new(shard: impl Into<String>) -> Self {
    Self {
      shard: shard.into(),
      tests: BTreeMap::new(),
    }
  }

  /// Merge one tag. At most one tag per (test, bug) pair is kept.
  pub fn merge(&mut self, tag: Tag) -> MergeOutcome {
    let tags = self.tests.entry(tag.test.clone()).or_default();
    let slot = tags.iter().position(|t| t.bugref == tag.bugref);
    let existing = slot.map(|i| tags[i].polarity);

    match (reduce(existing, tag.polarity), slot) {
      (None, _) => MergeOutcome::Unchanged,
      (Some(_), Some(i)) => {
        tags[i] = tag;
        MergeOutcome::Negated
      }
      (Some(_), None) => {
        tags.push(tag);
        MergeOutcome::Added
      }
    }
  }

  /// Merge every tag of another index, e.g. one built from another source.
  pub fn merge_index(&mut self, other: &TagIndex) {
    for tag in other.tests.values().flatten() {
      self.merge(tag.clone());
    }
  }

  /// Every tag recorded for a test, negations included.
  pub fn tags(&self, test: &str) -> &[Tag] {
    self.tests.get(test).map(Vec::as_slice).unwrap_or_default()
  }

  pub fn positive(&self, test: &str) -> impl Iterator<Item = &Tag> {
    self.tags(test).iter().filter(|t| !t.polarity.is_negative())
  }

  pub fn negations(&self, test: &str) -> impl Iterator<Item = &Tag> {
    self.tags(test).iter().filter(|t| t.polarity.is_negative())
  }

  /// Whether `test` is currently associated with `bugref`.
  pub fn is_tagged(&self, test: &str, bugref: &BugRef) -> bool {
    self.positive(test).any(|t| &t.bugref == bugref)
  }

  pub fn tests(&self) -> impl Iterator<Item = &str> {
    self.tests.keys().map(String::as_str)
  }

  /// Distinct bugs some test is tagged with, sorted.
  pub fn bugrefs(&self) -> Vec<BugRef> {
    let mut refs: Vec<BugRef> = self
      .tests
      .values()
      .flatten()
      .filter(|t| !t.polarity.is_negative())
      .map(|t| t.bugref.clone())
      .collect();
    refs.sort();
    refs.dedup();
    refs
  }

  /// Number of tests with at least one tag or negation.
  pub fn len(&self) -> usize {
    self.tests.values().filter(|tags| !tags.is_empty()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Cacheable for TagIndex {
  fn cache_key(&self) -> CacheKey {
    CacheKey::tag_index(&self.shard)
  }
}

/// Parse some text for bug tags and add them to the given tags index
///
/// Abbreviations that match no configured tracker are still recorded, against
/// a placeholder tracker. Returns the number of tags read from the text.
pub fn extract_tags(index: &mut TagIndex, text: &str, trackers: &TrackerRepo) -> usize {
  let found = parse_comment(text);

  for m in &found {
    let instance = trackers.resolve_or_placeholder(&m.bugref.tracker);
    if instance.is_placeholder() {
      debug!(tracker = %m.bugref.tracker, "tag refers to an unknown tracker");
    }

    let tag = Tag {
      test: m.test.to_string(),
      bugref: m.bugref.clone(),
      polarity: if m.negated {
        Polarity::Negative
      } else {
        Polarity::Positive
      },
      tracker: instance.name.clone(),
      provenance: m.source.to_string(),
    };
    index.merge(tag);
  }

  found.len()
}
