//! Tracker specific login and query encoding.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{
  bugzilla_id, BugzillaBugs, BugzillaFault, BugzillaLogin, OpenQaJob, RedmineAccount,
  RedmineIssue, BUGZILLA_ACCESS_DENIED, BUGZILLA_BAD_TOKEN, BUGZILLA_INVALID_BUG,
  BUGZILLA_LOGIN_REQUIRED,
};
use super::session::{Credentials, Session, SessionHandle};
use super::{ItemKind, TrackerInstance, TrackerKind};
use crate::error::{Error, Result};

/// Per-id outcome of a query, in the order the ids were requested.
pub type QueryResult = Vec<(String, Result<Value>)>;

/// The remote half of a tracker: how to log in and how to fetch items.
///
/// An `Err` from [`Connector::query`] means the whole request failed and
/// applies to every id in it. An `Err(Error::Authentication)` additionally
/// tells the caller that the session is no longer usable.
pub trait Connector: Send + Sync + 'static {
  fn login(
    &self,
    instance: &Arc<TrackerInstance>,
    credentials: &Credentials,
  ) -> impl Future<Output = Result<Session>> + Send;

  fn query(
    &self,
    session: &Session,
    kind: ItemKind,
    ids: &[String],
  ) -> impl Future<Output = Result<QueryResult>> + Send;
}

/// Connector speaking each tracker's REST API over HTTP.
#[derive(Clone)]
pub struct HttpConnector {
  client: reqwest::Client,
}

impl HttpConnector {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("trackcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }

  fn url(instance: &TrackerInstance, path: &str) -> Result<Url> {
    let base = instance.endpoint.as_ref().ok_or_else(|| Error::Unsupported {
      tracker: instance.name.clone(),
      kind: "remote queries".to_string(),
    })?;

    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|e| Error::Config(format!("Bad url {}: {}", joined, e)))
  }

  // ==========================================================================
  // Bugzilla
  // ==========================================================================

  async fn bugzilla_login(
    &self,
    instance: &TrackerInstance,
    credentials: &Credentials,
  ) -> Result<SessionHandle> {
    match (&credentials.user, &credentials.secret) {
      (Some(user), Some(password)) => {
        let mut url = Self::url(instance, "rest/login")?;
        url
          .query_pairs_mut()
          .append_pair("login", user)
          .append_pair("password", password);

        let body = self.get_json(instance, url, None).await?;
        if let Some(e) = bugzilla_fault(instance, None, &body)? {
          return Err(e);
        }
        let login: BugzillaLogin = serde_json::from_value(body)?;
        Ok(SessionHandle::Token(login.token))
      }
      // A secret without a user is an API key
      (None, Some(key)) => Ok(SessionHandle::ApiKey(key.clone())),
      _ => Ok(SessionHandle::Anonymous),
    }
  }

  async fn bugzilla_query(&self, session: &Session, ids: &[String]) -> Result<QueryResult> {
    match self.bugzilla_request(session, ids).await {
      Ok(bugs) => {
        let mut found: HashMap<String, Value> = bugs
          .bugs
          .into_iter()
          .filter_map(|bug| bugzilla_id(&bug).map(|id| (id, bug)))
          .collect();

        Ok(
          ids
            .iter()
            .map(|id| {
              let result = found.remove(id).ok_or_else(|| Error::NotFound {
                tracker: session.instance().name.clone(),
                id: id.clone(),
              });
              (id.clone(), result)
            })
            .collect(),
        )
      }
      // One bad id fails the whole batch, so ask for each id on its own
      Err(e) if ids.len() > 1 && !e.is_auth() && !matches!(e, Error::Timeout { .. }) => {
        debug!(
          tracker = %session.instance().name,
          error = %e,
          "batch rejected, falling back to single requests"
        );
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
          match self.fetch_single(session, id).await {
            Err(e) if e.is_auth() => return Err(e),
            result => results.push((id.clone(), result)),
          }
        }
        Ok(results)
      }
      Err(e) => Err(e),
    }
  }

  async fn bugzilla_request(&self, session: &Session, ids: &[String]) -> Result<BugzillaBugs> {
    let instance = session.instance();
    let mut url = Self::url(instance, "rest/bug")?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("id", &ids.join(","));
      match session.handle() {
        SessionHandle::ApiKey(key) => {
          query.append_pair("Bugzilla_api_key", key);
        }
        SessionHandle::Token(token) => {
          query.append_pair("Bugzilla_token", token);
        }
        _ => {}
      }
    }

    let single = (ids.len() == 1).then(|| ids[0].as_str());
    let body = self.get_json(instance, url, single).await?;
    if let Some(e) = bugzilla_fault(instance, single, &body)? {
      return Err(e);
    }

    Ok(serde_json::from_value(body)?)
  }

  // ==========================================================================
  // Redmine
  // ==========================================================================

  async fn redmine_login(
    &self,
    instance: &TrackerInstance,
    credentials: &Credentials,
  ) -> Result<SessionHandle> {
    let Some(key) = &credentials.secret else {
      return Ok(SessionHandle::Anonymous);
    };

    let url = Self::url(instance, "my/account.json")?;
    let response = self
      .client
      .get(url)
      .header("X-Redmine-API-Key", key)
      .send()
      .await
      .map_err(|e| Error::remote(&instance.name, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(status_error(instance, None, status));
    }
    let account: RedmineAccount = response
      .json()
      .await
      .map_err(|e| Error::remote(&instance.name, e))?;
    debug!(tracker = %instance.name, user = %account.user["login"], "redmine key accepted");

    Ok(SessionHandle::ApiKey(key.clone()))
  }

  async fn redmine_issue(&self, session: &Session, id: &str) -> Result<Value> {
    let instance = session.instance();
    let url = Self::url(instance, &format!("issues/{}.json", id))?;
    let mut request = self.client.get(url);
    if let SessionHandle::ApiKey(key) = session.handle() {
      request = request.header("X-Redmine-API-Key", key);
    }

    let response = request
      .send()
      .await
      .map_err(|e| Error::remote(&instance.name, e))?;
    let status = response.status();
    if !status.is_success() {
      return Err(status_error(instance, Some(id), status));
    }

    let issue: RedmineIssue = response
      .json()
      .await
      .map_err(|e| Error::remote(&instance.name, e))?;
    Ok(issue.issue)
  }

  // ==========================================================================
  // openQA
  // ==========================================================================

  async fn openqa_job(&self, session: &Session, id: &str) -> Result<Value> {
    let instance = session.instance();
    let url = Self::url(instance, &format!("api/v1/jobs/{}", id))?;

    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| Error::remote(&instance.name, e))?;
    let status = response.status();
    if !status.is_success() {
      return Err(status_error(instance, Some(id), status));
    }

    let job: OpenQaJob = response
      .json()
      .await
      .map_err(|e| Error::remote(&instance.name, e))?;
    Ok(job.job)
  }

  // ==========================================================================
  // Jira
  // ==========================================================================

  fn jira_login(instance: &TrackerInstance, credentials: &Credentials) -> Result<SessionHandle> {
    let (Some(user), Some(token)) = (&credentials.user, &credentials.secret) else {
      return Err(Error::Authentication {
        tracker: instance.name.clone(),
        message: "jira needs a user and an API token".to_string(),
      });
    };
    let url = instance.endpoint.as_ref().ok_or_else(|| Error::Config(format!(
      "tracker {} has no url",
      instance.name
    )))?;

    let credentials = gouqi::Credentials::Basic(user.clone(), token.clone());
    let client = gouqi::r#async::Jira::new(url.as_str(), credentials).map_err(|e| {
      Error::Authentication {
        tracker: instance.name.clone(),
        message: format!("Failed to create Jira client: {}", e),
      }
    })?;

    Ok(SessionHandle::Jira(client))
  }

  async fn jira_issue(&self, session: &Session, key: &str) -> Result<Value> {
    let instance = session.instance();
    let SessionHandle::Jira(client) = session.handle() else {
      return Err(Error::Authentication {
        tracker: instance.name.clone(),
        message: "session carries no Jira client".to_string(),
      });
    };

    match client.issues().get(key).await {
      Ok(issue) => Ok(serde_json::json!({
        "key": issue.key,
        "fields": issue.fields,
      })),
      Err(gouqi::Error::Unauthorized) => Err(Error::Authentication {
        tracker: instance.name.clone(),
        message: "credentials rejected".to_string(),
      }),
      Err(gouqi::Error::NotFound) => Err(Error::NotFound {
        tracker: instance.name.clone(),
        id: key.to_string(),
      }),
      Err(e) => Err(Error::Remote {
        tracker: instance.name.clone(),
        message: format!("Failed to get issue {}: {}", key, e),
        status: None,
      }),
    }
  }

  // ==========================================================================
  // Shared helpers
  // ==========================================================================

  /// GET a JSON body, leaving the interpretation of error envelopes to the caller.
  async fn get_json(&self, instance: &TrackerInstance, url: Url, id: Option<&str>) -> Result<Value> {
    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| Error::remote(&instance.name, e))?;

    let status = response.status();
    match response.json::<Value>().await {
      Ok(body) => Ok(body),
      Err(_) if !status.is_success() => Err(status_error(instance, id, status)),
      Err(e) => Err(Error::remote(&instance.name, e)),
    }
  }

  /// Fetch one item from a tracker without batch support.
  async fn fetch_single(&self, session: &Session, id: &str) -> Result<Value> {
    match session.instance().kind {
      TrackerKind::Redmine => self.redmine_issue(session, id).await,
      TrackerKind::Jira => self.jira_issue(session, id).await,
      TrackerKind::OpenQa => self.openqa_job(session, id).await,
      TrackerKind::Bugzilla => self
        .bugzilla_request(session, std::slice::from_ref(&id.to_string()))
        .await
        .and_then(|bugs| {
          bugs.bugs.into_iter().next().ok_or_else(|| Error::NotFound {
            tracker: session.instance().name.clone(),
            id: id.to_string(),
          })
        }),
      TrackerKind::Static => Err(Error::Unsupported {
        tracker: session.instance().name.clone(),
        kind: "remote queries".to_string(),
      }),
    }
  }
}

impl Connector for HttpConnector {
  async fn login(
    &self,
    instance: &Arc<TrackerInstance>,
    credentials: &Credentials,
  ) -> Result<Session> {
    let handle = match instance.kind {
      TrackerKind::Bugzilla => self.bugzilla_login(instance, credentials).await?,
      TrackerKind::Redmine => self.redmine_login(instance, credentials).await?,
      TrackerKind::Jira => Self::jira_login(instance, credentials)?,
      TrackerKind::OpenQa | TrackerKind::Static => SessionHandle::Anonymous,
    };

    Ok(Session::new(Arc::clone(instance), handle))
  }

  async fn query(&self, session: &Session, kind: ItemKind, ids: &[String]) -> Result<QueryResult> {
    let instance = session.instance();
    session.touch();

    if !instance.kind.serves(kind) {
      return Ok(
        ids
          .iter()
          .map(|id| {
            let err = Error::Unsupported {
              tracker: instance.name.clone(),
              kind: kind.to_string(),
            };
            (id.clone(), Err(err))
          })
          .collect(),
      );
    }

    if instance.kind == TrackerKind::Bugzilla {
      return self.bugzilla_query(session, ids).await;
    }

    // Stop at the first rejection, the session is useless for the rest
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
      match self.fetch_single(session, id).await {
        Err(e) if e.is_auth() => return Err(e),
        result => results.push((id.clone(), result)),
      }
    }
    Ok(results)
  }
}

/// Map an HTTP error status onto the error taxonomy.
fn status_error(instance: &TrackerInstance, id: Option<&str>, status: StatusCode) -> Error {
  match (status, id) {
    (StatusCode::UNAUTHORIZED, _) => Error::Authentication {
      tracker: instance.name.clone(),
      message: format!("HTTP {}", status),
    },
    (StatusCode::NOT_FOUND, Some(id)) => Error::NotFound {
      tracker: instance.name.clone(),
      id: id.to_string(),
    },
    _ => Error::Remote {
      tracker: instance.name.clone(),
      message: format!("HTTP {}", status),
      status: Some(status.as_u16()),
    },
  }
}

/// Interpret a Bugzilla error envelope, if the body is one.
fn bugzilla_fault(instance: &TrackerInstance, id: Option<&str>, body: &Value) -> Result<Option<Error>> {
  let fault = BugzillaFault::deserialize(body)?;
  if !fault.error {
    return Ok(None);
  }

  let message = fault.message.unwrap_or_else(|| "unknown error".to_string());
  let err = match (fault.code, id) {
    (Some(BUGZILLA_LOGIN_REQUIRED), _) | (Some(BUGZILLA_BAD_TOKEN), _) => Error::Authentication {
      tracker: instance.name.clone(),
      message,
    },
    (Some(BUGZILLA_INVALID_BUG), Some(id)) => Error::NotFound {
      tracker: instance.name.clone(),
      id: id.to_string(),
    },
    (Some(BUGZILLA_ACCESS_DENIED), _) => Error::Remote {
      tracker: instance.name.clone(),
      message: format!("access denied: {}", message),
      status: Some(403),
    },
    _ => Error::Remote {
      tracker: instance.name.clone(),
      message,
      status: None,
    },
  };

  Ok(Some(err))
}
