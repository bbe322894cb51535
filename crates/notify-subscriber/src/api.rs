//! REST collaborator used by [`NotificationSession`](crate::NotificationSession)
//! to refresh the authoritative item list and mark items read.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};

use crate::credentials::{CredentialProvider, bare_token};
use crate::types::{Error, Scope};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-assigned notification identifier. Deployments use either numeric
/// or string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationId {
    Num(i64),
    Str(String),
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationId::Num(n) => write!(f, "{n}"),
            NotificationId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for NotificationId {
    fn from(n: i64) -> Self {
        NotificationId::Num(n)
    }
}

impl From<&str> for NotificationId {
    fn from(s: &str) -> Self {
        NotificationId::Str(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Either a bare array or `{"items": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Bare(Vec<Notification>),
    Wrapped { items: Vec<Notification> },
}

impl ListResponse {
    fn into_items(self) -> Vec<Notification> {
        match self {
            ListResponse::Bare(items) | ListResponse::Wrapped { items } => items,
        }
    }
}

/// List and mutation calls issued by a notification session.
///
/// Retries are the implementation's concern; the session only logs failures.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn list(&self, scope: Scope) -> Result<Vec<Notification>, Error>;
    async fn mark_read(&self, id: &NotificationId) -> Result<(), Error>;
    async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), Error>;
}

/// [`NotificationApi`] over HTTP. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct RestNotificationApi {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    api_url: String,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl RestNotificationApi {
    /// `api_url` is the API root, e.g. `https://api.example.com/api`.
    pub fn new(
        api_url: impl Into<String>,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {e}")))?;
        let api_url = api_url.into().trim_end_matches('/').to_string();
        tracing::debug!(api_url = %api_url, "REST client initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                api_url,
                credentials,
            }),
        })
    }

    /// Build a request, attaching the current bearer credential when one exists.
    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.inner.api_url);
        let req = self.inner.client.request(method, url);
        let token = self
            .inner
            .credentials
            .as_ref()
            .and_then(|p| p.bearer_token())
            .as_deref()
            .and_then(bare_token);
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(op: &str, req: reqwest::RequestBuilder) -> Result<reqwest::Response, Error> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Api(format!("{op}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "{op} request failed: {body}");
            return Err(Error::Api(format!("{op} {status}: {body}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl NotificationApi for RestNotificationApi {
    async fn list(&self, scope: Scope) -> Result<Vec<Notification>, Error> {
        let req = self
            .request(Method::GET, "/notifications")
            .query(&[("scope", scope.as_str())]);
        let resp = Self::send("list", req).await?;
        let list: ListResponse = resp
            .json()
            .await
            .map_err(|e| Error::Api(format!("list decode: {e}")))?;
        Ok(list.into_items())
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<(), Error> {
        let path = format!("/notifications/{id}/read");
        Self::send("mark_read", self.request(Method::PATCH, &path)).await?;
        Ok(())
    }

    async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), Error> {
        let req = self
            .request(Method::PATCH, "/notifications/read-all")
            .json(&serde_json::json!({ "ids": ids }));
        Self::send("mark_all_read", req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticToken;
    use httpmock::Method::PATCH;
    use httpmock::prelude::*;

    fn api(server: &MockServer) -> RestNotificationApi {
        RestNotificationApi::new(
            server.url("/api/"),
            Some(Arc::new(StaticToken("Bearer tok".into()))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn list_sends_scope_and_bare_bearer() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/notifications")
                    .query_param("scope", "admin")
                    .header("authorization", "Bearer tok");
                then.status(200).json_body(serde_json::json!([
                    {"id": 1, "title": "Booking confirmed", "read": false},
                    {"id": "b-2", "message": "Showtime moved", "read": true, "type": "info"}
                ]));
            })
            .await;

        let items = api(&server).list(Scope::Admin).await.unwrap();

        mock.assert_async().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, NotificationId::Num(1));
        assert_eq!(items[1].id, NotificationId::Str("b-2".into()));
        assert_eq!(items[1].kind.as_deref(), Some("info"));
        assert!(items[1].read);
    }

    #[tokio::test]
    async fn list_accepts_wrapped_items() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/notifications");
                then.status(200)
                    .json_body(serde_json::json!({"items": [{"id": 7}]}));
            })
            .await;

        let items = api(&server).list(Scope::User).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "");
        assert!(!items[0].read);
    }

    #[tokio::test]
    async fn mark_read_patches_item() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH).path("/api/notifications/42/read");
                then.status(204);
            })
            .await;

        api(&server).mark_read(&NotificationId::Num(42)).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn mark_all_read_sends_ids() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/api/notifications/read-all")
                    .json_body(serde_json::json!({"ids": [1, "x"]}));
                then.status(200);
            })
            .await;

        api(&server)
            .mark_all_read(&[NotificationId::Num(1), NotificationId::from("x")])
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/notifications");
                then.status(500).body("boom");
            })
            .await;

        let err = api(&server).list(Scope::User).await.unwrap_err();
        assert!(matches!(err, Error::Api(ref msg) if msg.contains("500") && msg.contains("boom")));
    }

    #[tokio::test]
    async fn string_ids_are_path_segments() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH).path("/api/notifications/b-2/read");
                then.status(200);
            })
            .await;

        let api = RestNotificationApi::new(server.url("/api"), None).unwrap();
        api.mark_read(&NotificationId::from("b-2")).await.unwrap();
        mock.assert_async().await;
    }
}
