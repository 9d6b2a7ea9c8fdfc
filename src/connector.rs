//! The network seam: a dyn-compatible async connector trait and the reqwest
//! implementation used in production.
//!
//! Everything above this module depends only on [`Connector`], so tests and
//! demos swap the transport without touching stores or clients, and the
//! preloading layer wraps any connector transparently.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::rest::{Method, RestError, RestRequest};

/// Performs one REST round trip.
///
/// Implementations must be safe to call concurrently; the client and every
/// resolver share one connector.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Send `request` and return the decoded JSON body.
    ///
    /// # Errors
    ///
    /// Returns the server's [`RestError`] for non-2xx responses, or a
    /// `fetch_error` when the transport itself fails.
    async fn request(&self, request: RestRequest) -> Result<Value, RestError>;
}

/// HTTP connector backed by reqwest.
///
/// Holds a base URL and a shared, refreshable bearer token. The token is read
/// on every request; an empty string means "no auth header". Tokens rotate by
/// calling [`set_token`](HttpConnector::set_token) on any clone of the
/// connector's owner.
pub struct HttpConnector {
    client: reqwest::Client,
    base_url: String,
    token: Arc<RwLock<String>>,
}

impl HttpConnector {
    /// Connector for the API served under `base_url` (trailing slash ignored).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
            token: Arc::new(RwLock::new(String::new())),
        }
    }

    /// Replace the bearer token used for subsequent requests.
    ///
    /// An empty token disables the `Authorization` header.
    ///
    /// # Panics
    ///
    /// Panics if the token lock is poisoned (a writer panicked while holding
    /// it). This is treated as an invariant violation.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().expect("token RwLock poisoned") = token.into();
    }

    fn url_for(&self, request: &RestRequest) -> String {
        format!("{}{}", self.base_url, request.path)
    }

    fn current_token(&self) -> String {
        self.token.read().expect("token RwLock poisoned").clone()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn request(&self, request: RestRequest) -> Result<Value, RestError> {
        let url = self.url_for(&request);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let token = self.current_token();
        if !token.is_empty() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|error| {
            tracing::debug!(url = %url, error = %error, "transport failure");
            RestError::fetch_error(error.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|error| {
                RestError::fetch_error(format!("invalid JSON response: {error}"))
            });
        }

        // Prefer the structured error body when the server sent one.
        let fallback = RestError::new(
            status.as_u16().to_string(),
            status.canonical_reason().unwrap_or("HTTP error"),
        );
        match response.json::<RestError>().await {
            Ok(error) => Err(error),
            Err(_) => Err(fallback),
        }
    }
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The token is deliberately omitted.
        f.debug_struct("HttpConnector")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::test_fixtures::MockConnector;
    use super::*;

    #[tokio::test]
    async fn mock_routes_by_method_and_path() {
        let connector = MockConnector::new();
        connector.respond_get("/a", Ok(json!({"kind": "read"})));
        connector.respond_post("/a", Ok(json!({"kind": "write"})));

        let read = connector
            .request(RestRequest::get("/a"))
            .await
            .expect("GET should succeed");
        let write = connector
            .request(RestRequest::post("/a", json!({})))
            .await
            .expect("POST should succeed");

        assert_eq!(read, json!({"kind": "read"}));
        assert_eq!(write, json!({"kind": "write"}));
        assert_eq!(connector.calls(), 2);
        assert_eq!(connector.calls_to("/a"), 2);
    }

    #[tokio::test]
    async fn mock_answers_unrouted_requests_with_not_found() {
        let connector = MockConnector::new();
        let error = connector
            .request(RestRequest::get("/missing"))
            .await
            .expect_err("unrouted request should fail");
        assert_eq!(error.code, "not_found");
    }

    #[test]
    fn http_connector_builds_urls_without_double_slashes() {
        let connector = HttpConnector::new("https://example.com/wp-json/");
        let request = RestRequest::get("/insights/v1/core/site/data/info");
        assert_eq!(
            connector.url_for(&request),
            "https://example.com/wp-json/insights/v1/core/site/data/info"
        );
    }

    #[test]
    fn token_rotation_is_visible_to_later_requests() {
        let connector = HttpConnector::new("https://example.com");
        assert_eq!(connector.current_token(), "");

        connector.set_token("abc");
        assert_eq!(connector.current_token(), "abc");

        connector.set_token("");
        assert_eq!(connector.current_token(), "");
    }

    #[test]
    fn debug_output_omits_the_token() {
        let connector = HttpConnector::new("https://example.com");
        connector.set_token("secret");
        let rendered = format!("{connector:?}");
        assert!(rendered.contains("example.com"));
        assert!(!rendered.contains("secret"));
    }
}
