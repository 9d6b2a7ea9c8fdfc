//! Single-use preloaded responses served ahead of the network.
//!
//! The host page can embed the responses for a handful of REST paths at load
//! time. [`PreloadingConnector`] consumes that embedded map: the first GET
//! matching a preloaded path is answered from it without a network round
//! trip, and the entry is removed. Every later request to the path falls
//! through to the wrapped connector. This is deliberately not a cache; it
//! only avoids refetching data the server already shipped once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::connector::Connector;
use crate::rest::{Method, RestError, RestRequest};

/// Connector layer serving one preloaded response per path.
///
/// Keys are normalized paths as produced by
/// [`RestRequest::normalized_path`]: the bare path, or `path?key=value&...`
/// with the query pairs sorted. Only GETs are matched, and a request carrying
/// a `timestamp` query argument bypasses the preload entirely (that argument
/// is this crate's cache-busting convention, so such callers want the
/// network).
pub struct PreloadingConnector {
    inner: Arc<dyn Connector>,
    preloaded: Mutex<HashMap<String, Value>>,
}

impl PreloadingConnector {
    pub fn new(inner: Arc<dyn Connector>, preloaded: HashMap<String, Value>) -> Self {
        Self {
            inner,
            preloaded: Mutex::new(preloaded),
        }
    }

    /// Number of preloaded paths not yet consumed.
    pub fn remaining(&self) -> usize {
        self.preloaded.lock().expect("preloaded mutex poisoned").len()
    }
}

#[async_trait]
impl Connector for PreloadingConnector {
    async fn request(&self, request: RestRequest) -> Result<Value, RestError> {
        if request.method == Method::Get && request.query_value("timestamp").is_none() {
            let key = request.normalized_path();
            let preloaded = self
                .preloaded
                .lock()
                .expect("preloaded mutex poisoned")
                .remove(&key);
            if let Some(body) = preloaded {
                tracing::debug!(path = %key, "served preloaded response");
                return Ok(body);
            }
        }
        self.inner.request(request).await
    }
}

impl fmt::Debug for PreloadingConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadingConnector")
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::connector::test_fixtures::MockConnector;

    fn preloading(
        network: &Arc<MockConnector>,
        entries: &[(&str, Value)],
    ) -> PreloadingConnector {
        let map = entries
            .iter()
            .map(|(path, body)| (path.to_string(), body.clone()))
            .collect();
        PreloadingConnector::new(network.clone() as Arc<dyn Connector>, map)
    }

    #[tokio::test]
    async fn first_get_is_served_from_preload_second_hits_network() {
        let network = MockConnector::new();
        network.respond_get("/a", Ok(json!({"from": "network"})));
        let connector = preloading(&network, &[("/a", json!({"from": "preload"}))]);

        let first = connector
            .request(RestRequest::get("/a"))
            .await
            .expect("first request should succeed");
        assert_eq!(first, json!({"from": "preload"}));
        assert_eq!(network.calls(), 0, "preloaded response must skip the network");
        assert_eq!(connector.remaining(), 0);

        let second = connector
            .request(RestRequest::get("/a"))
            .await
            .expect("second request should succeed");
        assert_eq!(second, json!({"from": "network"}));
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn timestamp_argument_bypasses_the_preload() {
        let network = MockConnector::new();
        network.respond_get("/a", Ok(json!({"from": "network"})));
        let connector = preloading(&network, &[("/a", json!({"from": "preload"}))]);

        let response = connector
            .request(RestRequest::get("/a").with_query("timestamp", "1700000000"))
            .await
            .expect("request should succeed");

        assert_eq!(response, json!({"from": "network"}));
        assert_eq!(connector.remaining(), 1, "the preload entry must survive");
    }

    #[tokio::test]
    async fn non_get_requests_pass_through() {
        let network = MockConnector::new();
        network.respond_post("/a", Ok(json!({"ok": true})));
        let connector = preloading(&network, &[("/a", json!({"from": "preload"}))]);

        connector
            .request(RestRequest::post("/a", json!({})))
            .await
            .expect("POST should succeed");

        assert_eq!(network.calls(), 1);
        assert_eq!(connector.remaining(), 1);
    }

    #[tokio::test]
    async fn matching_ignores_query_pair_order() {
        let network = MockConnector::new();
        let connector = preloading(&network, &[("/a?x=1&y=2", json!({"from": "preload"}))]);

        let response = connector
            .request(
                RestRequest::get("/a")
                    .with_query("y", "2")
                    .with_query("x", "1"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response, json!({"from": "preload"}));
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn unmatched_paths_fall_through() {
        let network = MockConnector::new();
        network.respond_get("/b", Ok(json!({"from": "network"})));
        let connector = preloading(&network, &[("/a", json!({"from": "preload"}))]);

        let response = connector
            .request(RestRequest::get("/b"))
            .await
            .expect("request should succeed");

        assert_eq!(response, json!({"from": "network"}));
        assert_eq!(connector.remaining(), 1);
    }
}
