//! End-to-end flows over the public surface: preloaded boot, settings
//! round-trips, provisioning submits, setup-flow resolution, dismissals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use statekit::analytics;
use statekit::analytics4::{self, Analytics4Settings};
use statekit::dismissal::{self, Dismissals};
use statekit::settings::SettingsModule;
use statekit::setup_flow::{self, GA4_SETUP_FEATURE, SetupFlowMode};
use statekit::{
    Connector, Method, PreloadingConnector, RegistryBuilder, RestError, RestRequest,
};

/// Scripted in-process server: one fixed response per method and path, plus
/// a journal of every request it was asked.
#[derive(Default)]
struct FakeServer {
    routes: Mutex<HashMap<(Method, String), Value>>,
    seen: Mutex<Vec<RestRequest>>,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route(&self, method: Method, path: impl Into<String>, body: Value) {
        self.routes
            .lock()
            .unwrap()
            .insert((method, path.into()), body);
    }

    fn hits(&self, path: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    fn requests(&self) -> Vec<RestRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeServer {
    async fn request(&self, request: RestRequest) -> Result<Value, RestError> {
        self.seen.lock().unwrap().push(request.clone());
        let body = self
            .routes
            .lock()
            .unwrap()
            .get(&(request.method, request.path.clone()))
            .cloned();
        body.ok_or_else(|| RestError::new("not_found", format!("no route for {}", request.path)))
    }
}

fn settings_path() -> String {
    Analytics4Settings::datapoint().path()
}

#[tokio::test]
async fn boot_serves_settings_from_the_preload() {
    let server = FakeServer::new();
    let preloaded = HashMap::from([(
        settings_path(),
        json!({"accountID": "100", "propertyID": "G-1"}),
    )]);
    let connector = Arc::new(PreloadingConnector::new(
        server.clone() as Arc<dyn Connector>,
        preloaded,
    ));
    let registry = RegistryBuilder::new()
        .connector(connector)
        .settings_module::<Analytics4Settings>()
        .build();

    let settings = registry.settings::<Analytics4Settings>();
    settings.load().await.expect("load should succeed");

    assert_eq!(
        settings.saved().await,
        Some(json!({"accountID": "100", "propertyID": "G-1"}))
    );
    assert_eq!(server.hits(&settings_path()), 0, "preload satisfied the read");

    settings.set(json!({"propertyID": "G-2"})).await;
    assert!(settings.have_changed().await);
    settings.rollback().await;
    assert!(!settings.have_changed().await);
    assert_eq!(
        settings.settings().await,
        Some(json!({"accountID": "100", "propertyID": "G-1"}))
    );
}

#[tokio::test]
async fn saving_settings_adopts_the_server_echo() {
    let server = FakeServer::new();
    server.route(
        Method::Get,
        settings_path(),
        json!({"accountID": "100", "propertyID": "G-1"}),
    );
    server.route(
        Method::Post,
        settings_path(),
        json!({"accountID": "100", "propertyID": "G-2", "ownerID": 7}),
    );

    let registry = RegistryBuilder::new()
        .connector(server.clone() as Arc<dyn Connector>)
        .settings_module::<Analytics4Settings>()
        .build();

    let settings = registry.settings::<Analytics4Settings>();
    settings.load().await.expect("load should succeed");
    settings.set(json!({"propertyID": "G-2"})).await;
    assert!(settings.have_changed().await);
    assert!(settings.can_submit().await);

    let echo = settings.save().await.expect("save should succeed");
    assert_eq!(echo["ownerID"], json!(7));
    assert!(!settings.have_changed().await, "the echo is the new baseline");
    assert_eq!(settings.settings().await, Some(echo));

    let requests = server.requests();
    let post = requests
        .iter()
        .find(|request| request.method == Method::Post)
        .expect("one POST should have been sent");
    assert_eq!(
        post.body,
        Some(json!({"data": {"accountID": "100", "propertyID": "G-2"}}))
    );
}

#[tokio::test]
async fn submit_provisions_a_property_when_the_sentinel_is_set() {
    let server = FakeServer::new();
    server.route(
        Method::Get,
        settings_path(),
        json!({"accountID": "100", "propertyID": ""}),
    );
    server.route(
        Method::Post,
        analytics4::CREATE_PROPERTY.path(),
        json!({"id": "G-777", "displayName": "Fresh"}),
    );
    server.route(
        Method::Post,
        settings_path(),
        json!({"accountID": "100", "propertyID": "G-777"}),
    );

    let registry = RegistryBuilder::new()
        .connector(server.clone() as Arc<dyn Connector>)
        .register(analytics4::analytics4_store())
        .settings_module::<Analytics4Settings>()
        .build();

    let settings = registry.settings::<Analytics4Settings>();
    settings.load().await.expect("load should succeed");
    settings
        .set(json!({"propertyID": analytics4::PROPERTY_CREATE}))
        .await;

    settings
        .submit_with(&analytics4::submit_pipeline())
        .await
        .expect("submit should succeed");

    assert_eq!(
        settings.saved().await,
        Some(json!({"accountID": "100", "propertyID": "G-777"}))
    );

    let paths: Vec<String> = server
        .requests()
        .iter()
        .filter(|request| request.method == Method::Post)
        .map(|request| request.path.clone())
        .collect();
    assert_eq!(
        paths,
        [analytics4::CREATE_PROPERTY.path(), settings_path()],
        "provisioning precedes the save"
    );
}

#[tokio::test]
async fn setup_flow_decides_from_fetched_stores() {
    let server = FakeServer::new();
    server.route(
        Method::Get,
        analytics4::PROPERTIES.path(),
        json!([{"id": "G-1", "displayName": "Site"}]),
    );
    server.route(Method::Get, analytics::PROPERTIES.path(), json!([]));

    let registry = RegistryBuilder::new()
        .connector(server.clone() as Arc<dyn Connector>)
        .feature(GA4_SETUP_FEATURE)
        .register(analytics::analytics_store())
        .register(analytics4::analytics4_store())
        .build();

    let mode = setup_flow::resolve_setup_flow_mode(&registry).await;
    assert_eq!(mode, Some(SetupFlowMode::Ga4));

    // Resolutions are remembered, so deciding again costs no requests.
    let again = setup_flow::resolve_setup_flow_mode(&registry).await;
    assert_eq!(again, Some(SetupFlowMode::Ga4));
    assert_eq!(server.hits(&analytics4::PROPERTIES.path()), 1);
    assert_eq!(server.hits(&analytics::PROPERTIES.path()), 1);
}

#[tokio::test]
async fn dismissing_a_tour_starts_the_cooldown() {
    let server = FakeServer::new();
    server.route(
        Method::Post,
        dismissal::DISMISS_TOUR.path(),
        json!(["welcome"]),
    );

    let registry = RegistryBuilder::new()
        .connector(server.clone() as Arc<dyn Connector>)
        .register(dismissal::dismissals_store())
        .build();

    let tours = dismissal::dismiss_tour(&registry, "welcome")
        .await
        .expect("dismiss should succeed");
    assert_eq!(tours, ["welcome"]);

    let state = registry.store::<Dismissals>().state().await;
    assert_eq!(state.is_tour_dismissed("welcome"), Some(true));
    assert!(dismissal::tour_cooldown_active(&registry, dismissal::TOUR_COOLDOWN).await);
}

#[tokio::test]
async fn store_changes_notify_watchers() {
    let server = FakeServer::new();
    let registry = RegistryBuilder::new()
        .connector(server.clone() as Arc<dyn Connector>)
        .settings_module::<Analytics4Settings>()
        .build();

    let settings = registry.settings::<Analytics4Settings>();
    let mut versions = settings.store().changed();
    settings.set(json!({"accountID": "100"})).await;
    versions.changed().await.expect("store is alive");
    assert_eq!(
        settings.settings().await,
        Some(json!({"accountID": "100"}))
    );
}
