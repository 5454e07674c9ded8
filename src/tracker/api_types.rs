//! Serde-deserializable types matching tracker API responses.
//!
//! Item payloads stay as untyped JSON so that every field the tracker sends
//! ends up in the cache; only the envelopes are typed.

use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// Bugzilla REST
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct BugzillaLogin {
  pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct BugzillaBugs {
  #[serde(default)]
  pub bugs: Vec<Value>,
}

/// Error envelope, returned with or without an HTTP error status
#[derive(Debug, Deserialize)]
pub struct BugzillaFault {
  #[serde(default)]
  pub error: bool,
  pub code: Option<i64>,
  pub message: Option<String>,
}

/// Bug does not exist
pub const BUGZILLA_INVALID_BUG: i64 = 101;
/// Bug is private
pub const BUGZILLA_ACCESS_DENIED: i64 = 102;
/// Login required or token expired
pub const BUGZILLA_LOGIN_REQUIRED: i64 = 410;
pub const BUGZILLA_BAD_TOKEN: i64 = 32000;

/// The bug id as the tracker reports it, numbers and strings alike.
pub fn bugzilla_id(bug: &Value) -> Option<String> {
  match bug.get("id")? {
    Value::Number(n) => Some(n.to_string()),
    Value::String(s) => Some(s.clone()),
    _ => None,
  }
}

// ============================================================================
// Redmine
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RedmineIssue {
  pub issue: Value,
}

#[derive(Debug, Deserialize)]
pub struct RedmineAccount {
  pub user: Value,
}

// ============================================================================
// openQA
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenQaJob {
  pub job: Value,
}
