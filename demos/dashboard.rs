//! Dashboard boot sequence against a scripted in-process server.
//!
//! Walks the whole stack once: settings served from preloaded data, the
//! setup-flow decision over both analytics stores, a provisioning submit,
//! a tour dismissal, and a few connectivity probes.
//!
//! Run with `cargo run --example dashboard`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use statekit::analytics;
use statekit::analytics4::{self, Analytics4Settings};
use statekit::connectivity::HEALTH_CHECK;
use statekit::dismissal;
use statekit::settings::SettingsModule;
use statekit::setup_flow::{self, GA4_SETUP_FEATURE};
use statekit::{
    Connector, ConnectivityMonitor, Method, MonitorConfig, PreloadingConnector, Registry,
    RestError, RestRequest,
};

struct DemoServer;

#[async_trait]
impl Connector for DemoServer {
    async fn request(&self, request: RestRequest) -> Result<Value, RestError> {
        info!(method = ?request.method, path = %request.path, "server request");
        let body = match (request.method, request.path.as_str()) {
            (Method::Get, path) if path == analytics4::PROPERTIES.path() => {
                json!([{"id": "G-1", "displayName": "statekit.dev"}])
            }
            (Method::Get, path) if path == analytics::PROPERTIES.path() => json!([]),
            (Method::Get, path) if path == HEALTH_CHECK.path() => json!({"ok": true}),
            (Method::Post, path) if path == analytics4::CREATE_PROPERTY.path() => {
                json!({"id": "G-777", "displayName": "Provisioned"})
            }
            (Method::Post, path) if path == Analytics4Settings::datapoint().path() => {
                // Echo the submitted draft back with server bookkeeping added.
                let mut echo = request
                    .body
                    .as_ref()
                    .and_then(|body| body.get("data"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                if let Some(map) = echo.as_object_mut() {
                    map.insert("ownerID".into(), json!(1));
                }
                echo
            }
            (Method::Post, path) if path == dismissal::DISMISS_TOUR.path() => {
                let slug = request
                    .body
                    .as_ref()
                    .and_then(|body| body.pointer("/data/slug"))
                    .cloned()
                    .unwrap_or(Value::Null);
                json!([slug])
            }
            (_, path) => {
                return Err(RestError::new("not_found", format!("no route for {path}")));
            }
        };
        Ok(body)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,statekit=debug")),
        )
        .init();

    // The host page would embed this; here it spares the first settings GET.
    let preloaded = HashMap::from([(
        Analytics4Settings::datapoint().path(),
        json!({"accountID": "100", "propertyID": ""}),
    )]);
    let connector = Arc::new(PreloadingConnector::new(
        Arc::new(DemoServer) as Arc<dyn Connector>,
        preloaded,
    ));

    let registry = Registry::builder()
        .connector(connector)
        .feature(GA4_SETUP_FEATURE)
        .register(analytics::analytics_store())
        .register(analytics4::analytics4_store())
        .register(dismissal::dismissals_store())
        .settings_module::<Analytics4Settings>()
        .build();

    let settings = registry.settings::<Analytics4Settings>();
    settings.load().await?;
    info!(settings = %json!(settings.saved().await), "settings loaded from preload");

    let mode = setup_flow::resolve_setup_flow_mode(&registry).await;
    info!(
        mode = mode.map(|m| m.as_str()).unwrap_or("undecided"),
        "setup flow decided"
    );

    // Ask the submit pipeline to create the property before saving.
    settings
        .set(json!({"propertyID": analytics4::PROPERTY_CREATE}))
        .await;
    settings.submit_with(&analytics4::submit_pipeline()).await?;
    info!(settings = %json!(settings.saved().await), "settings saved");

    let tours = dismissal::dismiss_tour(&registry, "welcome-tour").await?;
    info!(
        dismissed = tours.len(),
        cooldown = dismissal::tour_cooldown_active(&registry, dismissal::TOUR_COOLDOWN).await,
        "tour dismissed"
    );

    let monitor = ConnectivityMonitor::spawn(
        registry.clone(),
        MonitorConfig {
            interval: Duration::from_secs(2),
            assume_online: true,
        },
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    info!(online = monitor.online(), "connectivity sampled");
    monitor.shutdown().await;

    Ok(())
}
