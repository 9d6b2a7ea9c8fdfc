//! REST addressing, the wire error shape, and the caching REST client.
//!
//! Every read and write in this crate goes through [`RestClient`], which
//! layers the TTL request cache over a [`Connector`]. Reads are addressed by
//! [`Datapoint`] (a `(group, name)` pair rendered as
//! `/insights/v1/{group}/data/{name}`) plus a JSON parameter object; the
//! parameters are canonicalized so equal reads share one cache entry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cache::{CacheItemOptions, RequestCache};
use crate::canon;
use crate::connector::Connector;

/// API namespace prefix for all datapoint paths.
pub const API_ROOT: &str = "/insights/v1";

/// Address of one REST read/write surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Datapoint {
    /// Owning group, e.g. `modules/analytics` or `core/user`.
    pub group: &'static str,
    /// Datapoint name within the group, e.g. `settings`.
    pub name: &'static str,
}

impl Datapoint {
    /// Const constructor so modules can declare datapoints as constants.
    pub const fn new(group: &'static str, name: &'static str) -> Self {
        Self { group, name }
    }

    /// Request path: `/insights/v1/{group}/data/{name}`.
    pub fn path(&self) -> String {
        format!("{API_ROOT}/{}/data/{}", self.group, self.name)
    }

    /// Cache key prefix shared by every parameterization of this datapoint.
    pub(crate) fn key_prefix(&self) -> String {
        format!("{}::{}", self.group, self.name)
    }
}

impl fmt::Display for Datapoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// HTTP method of a [`RestRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// One outgoing request as seen by a [`Connector`].
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    /// Absolute path without the host, e.g. `/insights/v1/core/site/data/info`.
    pub path: String,
    /// Query pairs in dispatch order; values are pre-rendered strings.
    pub query: Vec<(String, String)>,
    /// JSON body for writes.
    pub body: Option<Value>,
}

impl RestRequest {
    /// A bare GET for `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// A POST of `body` to `path`.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// Append one query pair.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// First query value for `key`, if present.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Path plus canonically ordered query string.
    ///
    /// Used for preload matching, so that two requests differing only in
    /// query-pair order address the same preloaded entry.
    pub fn normalized_path(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let mut pairs = self.query.clone();
        pairs.sort();
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}?{}", self.path, query.join("&"))
    }
}

/// Wire error shape: `{ code, message, data }`.
///
/// REST failures are delivered as values through this type so callers can
/// render an inline error state; nothing in this crate panics on one. The
/// same shape round-trips through serde for error bodies sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RestError {
    /// Machine-readable error code, e.g. `internal_error`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RestError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Fallback for transport failures that carry no structured body.
    pub(crate) fn fetch_error(message: impl Into<String>) -> Self {
        Self::new("fetch_error", message)
    }
}

/// Read options for [`RestClient::get`].
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// Consult and populate the request cache.
    pub use_cache: bool,
    /// Time-to-live for a freshly cached response.
    pub ttl: Duration,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl GetOptions {
    /// Skip the cache entirely, for callers needing strong freshness.
    pub fn uncached() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    /// Cached read with a custom time-to-live.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }
}

/// Typed REST client: a connector plus the shared request cache.
///
/// Cheap to clone; all clones share the same connector and cache.
#[derive(Clone)]
pub struct RestClient {
    connector: Arc<dyn Connector>,
    cache: RequestCache,
}

impl RestClient {
    pub fn new(connector: Arc<dyn Connector>, cache: RequestCache) -> Self {
        Self { connector, cache }
    }

    /// The shared request cache.
    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    /// Read a datapoint.
    ///
    /// `params` must be a JSON object (or `null` for none); it becomes the
    /// query string. With `options.use_cache` a fresh cached response is
    /// returned without touching the network, and a successful network
    /// response is cached for `options.ttl`. Error responses are never
    /// cached.
    ///
    /// # Errors
    ///
    /// Returns the server's [`RestError`] for non-2xx responses, or a
    /// `fetch_error` for transport failures.
    ///
    /// # Panics
    ///
    /// Panics if `params` is neither an object nor `null`.
    pub async fn get(
        &self,
        datapoint: Datapoint,
        params: Value,
        options: GetOptions,
    ) -> Result<Value, RestError> {
        let key = request_key(datapoint, &params);
        if options.use_cache
            && let Some(hit) = self.cache.get_item(&key).await
            && !hit.is_error
        {
            tracing::debug!(key = %key, "request cache hit");
            return Ok(hit.value);
        }

        let request = RestRequest {
            method: Method::Get,
            path: datapoint.path(),
            query: query_pairs(&params),
            body: None,
        };
        let value = self.connector.request(request).await?;
        if options.use_cache {
            self.cache
                .set_item(&key, value.clone(), CacheItemOptions::ttl(options.ttl))
                .await;
        }
        Ok(value)
    }

    /// Write to a datapoint.
    ///
    /// The body is wrapped as `{"data": body}` on the wire. On success every
    /// cached read of this datapoint is invalidated, since the server state
    /// behind it has changed.
    ///
    /// # Errors
    ///
    /// Returns the server's [`RestError`] or a transport `fetch_error`.
    pub async fn post(&self, datapoint: Datapoint, body: Value) -> Result<Value, RestError> {
        let request = RestRequest {
            method: Method::Post,
            path: datapoint.path(),
            query: Vec::new(),
            body: Some(json!({ "data": body })),
        };
        let value = self.connector.request(request).await?;
        self.cache.invalidate_prefix(&datapoint.key_prefix()).await;
        Ok(value)
    }

    /// Drop every cached read of `datapoint`, regardless of parameters.
    pub async fn invalidate(&self, datapoint: Datapoint) {
        self.cache.invalidate_prefix(&datapoint.key_prefix()).await;
    }

    /// Drop every cached read for a whole group (used after settings saves).
    pub async fn invalidate_group(&self, group: &str) {
        self.cache.invalidate_prefix(&format!("{group}::")).await;
    }
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient").finish_non_exhaustive()
    }
}

/// Cache key for one `(datapoint, params)` read.
pub(crate) fn request_key(datapoint: Datapoint, params: &Value) -> String {
    format!("{}::{}", datapoint.key_prefix(), canon::canonical(params))
}

/// Render a parameter object as query pairs.
///
/// String values pass through verbatim; everything else is rendered as
/// canonical JSON so nested parameters stay stable.
///
/// # Panics
///
/// Panics if `params` is neither a JSON object nor `null`; that is a
/// programmer error at the call site, not a runtime condition.
pub(crate) fn query_pairs(params: &Value) -> Vec<(String, String)> {
    match params {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    other => canon::canonical(other),
                };
                (key.clone(), rendered)
            })
            .collect(),
        other => panic!("request parameters must be a JSON object or null, got {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::test_fixtures::MockConnector;

    const INFO: Datapoint = Datapoint::new("core/site", "info");

    fn client(connector: &Arc<MockConnector>) -> RestClient {
        RestClient::new(connector.clone() as Arc<dyn Connector>, RequestCache::in_memory())
    }

    #[test]
    fn datapoint_path_and_prefix() {
        let dp = Datapoint::new("modules/analytics", "settings");
        assert_eq!(dp.path(), "/insights/v1/modules/analytics/data/settings");
        assert_eq!(dp.key_prefix(), "modules/analytics::settings");
        assert_eq!(dp.to_string(), "modules/analytics/settings");
    }

    #[test]
    fn request_key_ignores_parameter_order() {
        let first = request_key(INFO, &json!({"a": 1, "b": 2}));
        let second = request_key(INFO, &json!({"b": 2, "a": 1}));
        assert_eq!(first, second);

        let different = request_key(INFO, &json!({"a": 1, "b": 3}));
        assert_ne!(first, different);
    }

    #[test]
    fn normalized_path_sorts_query_pairs() {
        let request = RestRequest::get("/insights/v1/core/site/data/info")
            .with_query("zeta", "1")
            .with_query("alpha", "2");
        assert_eq!(
            request.normalized_path(),
            "/insights/v1/core/site/data/info?alpha=2&zeta=1"
        );
    }

    #[test]
    fn query_pairs_render_strings_verbatim_and_rest_as_json() {
        let pairs = query_pairs(&json!({
            "slug": "analytics",
            "count": 3,
            "nested": {"b": 2, "a": 1},
        }));
        assert!(pairs.contains(&("slug".to_string(), "analytics".to_string())));
        assert!(pairs.contains(&("count".to_string(), "3".to_string())));
        assert!(pairs.contains(&("nested".to_string(), r#"{"a":1,"b":2}"#.to_string())));
    }

    #[test]
    fn query_pairs_null_is_empty() {
        assert!(query_pairs(&Value::Null).is_empty());
    }

    #[test]
    #[should_panic(expected = "must be a JSON object or null")]
    fn query_pairs_reject_scalars() {
        query_pairs(&json!(42));
    }

    #[test]
    fn rest_error_serde_matches_wire_shape() {
        let error = RestError::new("internal_error", "boom");
        let raw = serde_json::to_value(&error).expect("serialization should succeed");
        assert_eq!(raw, json!({"code": "internal_error", "message": "boom"}));

        let parsed: RestError = serde_json::from_value(json!({
            "code": "invalid_param",
            "message": "bad slug",
            "data": {"status": 400},
        }))
        .expect("deserialization should succeed");
        assert_eq!(parsed.code, "invalid_param");
        assert_eq!(parsed.data, Some(json!({"status": 400})));
        assert_eq!(parsed.to_string(), "invalid_param: bad slug");
    }

    #[tokio::test]
    async fn get_serves_second_read_from_cache() {
        let connector = MockConnector::new();
        connector.respond_get(INFO.path(), Ok(json!({"version": 1})));
        let client = client(&connector);

        let first = client
            .get(INFO, Value::Null, GetOptions::default())
            .await
            .expect("first get should succeed");
        let second = client
            .get(INFO, Value::Null, GetOptions::default())
            .await
            .expect("second get should succeed");

        assert_eq!(first, second);
        assert_eq!(connector.calls(), 1, "second read should come from cache");
    }

    #[tokio::test]
    async fn uncached_get_always_hits_the_connector() {
        let connector = MockConnector::new();
        connector.respond_get(INFO.path(), Ok(json!({"version": 1})));
        let client = client(&connector);

        for _ in 0..2 {
            client
                .get(INFO, Value::Null, GetOptions::uncached())
                .await
                .expect("get should succeed");
        }
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn errors_are_returned_and_never_cached() {
        let connector = MockConnector::new();
        connector.respond_get(INFO.path(), Err(RestError::new("internal_error", "down")));
        let client = client(&connector);

        for _ in 0..2 {
            let error = client
                .get(INFO, Value::Null, GetOptions::default())
                .await
                .expect_err("get should fail");
            assert_eq!(error.code, "internal_error");
        }
        assert_eq!(connector.calls(), 2, "error responses must not be cached");
    }

    #[tokio::test]
    async fn post_invalidates_cached_reads_for_the_datapoint() {
        let connector = MockConnector::new();
        connector.respond_get(INFO.path(), Ok(json!({"version": 1})));
        connector.respond_post(INFO.path(), Ok(json!({"ok": true})));
        let client = client(&connector);

        client
            .get(INFO, Value::Null, GetOptions::default())
            .await
            .expect("get should succeed");
        client
            .post(INFO, json!({"version": 2}))
            .await
            .expect("post should succeed");
        client
            .get(INFO, Value::Null, GetOptions::default())
            .await
            .expect("get should succeed");

        // get, post, then a fresh get because the write invalidated the entry.
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test]
    async fn post_wraps_body_under_data() {
        let connector = MockConnector::new();
        connector.respond_post(INFO.path(), Ok(json!({"ok": true})));
        let client = client(&connector);

        client
            .post(INFO, json!({"version": 2}))
            .await
            .expect("post should succeed");

        let requests = connector.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body, Some(json!({"data": {"version": 2}})));
    }
}
