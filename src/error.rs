use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown tracker: {name}")]
  UnknownTracker { name: String },

  #[error("tracker {tracker} does not serve {kind} items")]
  Unsupported { tracker: String, kind: String },

  #[error("authentication failed for {tracker}: {message}")]
  Authentication { tracker: String, message: String },

  #[error("{tracker} has no item {id}")]
  NotFound { tracker: String, id: String },

  #[error("remote error from {tracker}: {message}")]
  Remote {
    tracker: String,
    message: String,
    status: Option<u16>,
  },

  #[error("request to {tracker} timed out after {ms}ms")]
  Timeout { tracker: String, ms: u64 },

  #[error("{failed} of {requested} requested items could not be fetched")]
  PartialFetch { failed: usize, requested: usize },

  #[error("invalid cache key: {0}")]
  InvalidKey(String),

  #[error("cache storage error: {0}")]
  Storage(String),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("configuration error: {0}")]
  Config(String),
}

impl Error {
  /// Name of the tracker the error came from, if it carries one.
  pub fn tracker(&self) -> Option<&str> {
    match self {
      Self::UnknownTracker { name } => Some(name),
      Self::Unsupported { tracker, .. }
      | Self::Authentication { tracker, .. }
      | Self::NotFound { tracker, .. }
      | Self::Remote { tracker, .. }
      | Self::Timeout { tracker, .. } => Some(tracker),
      _ => None,
    }
  }

  /// True when the session used for the request should be thrown away.
  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Authentication { .. })
  }

  /// Returns true for transient errors that may succeed on retry.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Timeout { .. } => true,
      // 4xx is the caller's problem, no status means the connection itself failed
      Self::Remote { status, .. } => status.map_or(true, |s| s >= 500),
      _ => false,
    }
  }

  /// Copy of this error for reporting one failure against several ids.
  ///
  /// Wrapped library errors are not `Clone`; they are carried over as text.
  pub(crate) fn duplicate(&self) -> Self {
    match self {
      Self::UnknownTracker { name } => Self::UnknownTracker { name: name.clone() },
      Self::Unsupported { tracker, kind } => Self::Unsupported {
        tracker: tracker.clone(),
        kind: kind.clone(),
      },
      Self::Authentication { tracker, message } => Self::Authentication {
        tracker: tracker.clone(),
        message: message.clone(),
      },
      Self::NotFound { tracker, id } => Self::NotFound {
        tracker: tracker.clone(),
        id: id.clone(),
      },
      Self::Remote {
        tracker,
        message,
        status,
      } => Self::Remote {
        tracker: tracker.clone(),
        message: message.clone(),
        status: *status,
      },
      Self::Timeout { tracker, ms } => Self::Timeout {
        tracker: tracker.clone(),
        ms: *ms,
      },
      Self::PartialFetch { failed, requested } => Self::PartialFetch {
        failed: *failed,
        requested: *requested,
      },
      Self::InvalidKey(key) => Self::InvalidKey(key.clone()),
      Self::Storage(msg) => Self::Storage(msg.clone()),
      Self::Config(msg) => Self::Config(msg.clone()),
      Self::Sqlite(e) => Self::Storage(e.to_string()),
      Self::Serialization(e) => Self::Storage(e.to_string()),
    }
  }

  pub(crate) fn remote(tracker: &str, err: reqwest::Error) -> Self {
    let status = err.status().map(|s| s.as_u16());
    match status {
      Some(401) | Some(403) => Self::Authentication {
        tracker: tracker.to_string(),
        message: err.to_string(),
      },
      _ => Self::Remote {
        tracker: tracker.to_string(),
        message: err.to_string(),
        status,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retryable_classification() {
    let timeout = Error::Timeout {
      tracker: "bsc".into(),
      ms: 10,
    };
    assert!(timeout.is_retryable());

    let server = Error::Remote {
      tracker: "bsc".into(),
      message: "boom".into(),
      status: Some(502),
    };
    assert!(server.is_retryable());

    let client = Error::Remote {
      tracker: "bsc".into(),
      message: "bad request".into(),
      status: Some(400),
    };
    assert!(!client.is_retryable());

    let missing = Error::NotFound {
      tracker: "bsc".into(),
      id: "1".into(),
    };
    assert!(!missing.is_retryable());
    assert_eq!(missing.tracker(), Some("bsc"));
  }

  #[test]
  fn auth_errors_are_flagged() {
    let err = Error::Authentication {
      tracker: "poo".into(),
      message: "bad key".into(),
    };
    assert!(err.is_auth());
    assert!(!err.is_retryable());
    assert_eq!(err.to_string(), "authentication failed for poo: bad key");
  }

  #[test]
  fn duplicate_keeps_classification() {
    let err = Error::Timeout {
      tracker: "osd".into(),
      ms: 250,
    };
    let copy = err.duplicate();
    assert!(copy.is_retryable());
    assert_eq!(copy.to_string(), err.to_string());

    let json = serde_json::from_str::<u32>("nope").unwrap_err();
    let copy = Error::Serialization(json).duplicate();
    assert!(matches!(copy, Error::Storage(_)));
  }
}
