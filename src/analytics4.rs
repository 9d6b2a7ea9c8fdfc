//! GA4 Analytics module: property metadata, settings, and provisioning.
//!
//! Unlike the classic module, the GA4 property list doubles as a health
//! probe: a failed listing marks the admin API as broken, which the setup
//! flow uses to fall back to the legacy path. The module also supports
//! provisioning a property during submit via [`PROPERTY_CREATE`] and
//! [`submit_pipeline`].

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ValidationError;
use crate::registry::{Registry, ResolverCtx};
use crate::rest::{Datapoint, GetOptions, RestError};
use crate::settings::{SettingsModule, require_setting_str};
use crate::store::{Resolver, Store, StoreDefinition, StorePart};
use crate::submit::{SubmitPipeline, SubmitStep};

/// REST group of the GA4 module.
pub const GROUP: &str = "modules/analytics-4";

/// Datapoint listing the user's GA4 properties.
pub const PROPERTIES: Datapoint = Datapoint::new(GROUP, "properties");

/// Datapoint provisioning a new GA4 property.
pub const CREATE_PROPERTY: Datapoint = Datapoint::new(GROUP, "create-property");

/// Resolver name for the property list.
pub const GET_PROPERTIES: &str = "get_properties";

/// Sentinel `propertyID` meaning "provision a property during submit".
pub const PROPERTY_CREATE: &str = "property_create";

/// One GA4 property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property4 {
    pub id: String,
    pub display_name: String,
}

/// Module store state.
///
/// `admin_api_working` stays `None` until the first property listing settles;
/// a successful listing (even an empty one) proves the API works, a failed
/// one marks it broken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Analytics4 {
    pub properties: Option<Vec<Property4>>,
    pub admin_api_working: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum Analytics4Action {
    PropertiesReceived(Vec<Property4>),
    PropertyCreated(Property4),
    AdminApiChecked(bool),
}

impl Store for Analytics4 {
    const NAME: &'static str = "modules/analytics-4";
    type Action = Analytics4Action;

    fn reduce(mut state: Self, action: &Self::Action) -> Self {
        match action {
            Analytics4Action::PropertiesReceived(properties) => {
                state.properties = Some(properties.clone());
                state.admin_api_working = Some(true);
            }
            Analytics4Action::PropertyCreated(property) => {
                if let Some(properties) = state.properties.as_mut() {
                    properties.push(property.clone());
                }
                state.admin_api_working = Some(true);
            }
            Analytics4Action::AdminApiChecked(working) => {
                state.admin_api_working = Some(*working);
            }
        }
        state
    }
}

/// Store definition with the property-list resolver wired.
pub fn analytics4_store() -> StoreDefinition<Analytics4> {
    StoreDefinition::combine(vec![StorePart::new().resolver(
        GET_PROPERTIES,
        Resolver::new(|ctx: ResolverCtx<Analytics4>| async move {
            let result = ctx
                .rest
                .get(PROPERTIES, ctx.args.clone(), GetOptions::default())
                .await
                .and_then(|raw| {
                    serde_json::from_value::<Vec<Property4>>(raw).map_err(|e| {
                        RestError::new(
                            "invalid_response",
                            format!("malformed properties payload: {e}"),
                        )
                    })
                });
            match result {
                Ok(properties) => {
                    ctx.store
                        .dispatch(Analytics4Action::PropertiesReceived(properties))
                        .await;
                    Ok(())
                }
                Err(error) => {
                    // A listing that cannot be fetched or decoded counts as a
                    // broken admin API for the setup flow.
                    ctx.store
                        .dispatch(Analytics4Action::AdminApiChecked(false))
                        .await;
                    Err(error)
                }
            }
        }),
    )])
}

/// Settings module for GA4.
pub struct Analytics4Settings;

impl SettingsModule for Analytics4Settings {
    const GROUP: &'static str = GROUP;
    const STORE_NAME: &'static str = "modules/analytics-4/settings";

    fn non_comparable() -> &'static [&'static str] {
        &["ownerID"]
    }

    fn validate(settings: &Value) -> Result<(), ValidationError> {
        // The provisioning sentinel is a valid propertyID; the submit
        // pipeline replaces it before the save goes out.
        require_setting_str(settings, "propertyID")?;
        Ok(())
    }
}

/// Submit pipeline for GA4: provision a property when the draft asks for one.
///
/// The `create_property` step is a no-op unless the draft's `propertyID` is
/// [`PROPERTY_CREATE`]. When it is, the step posts to [`CREATE_PROPERTY`]
/// (forwarding the draft's `accountID` when present), records the created
/// property in the module store, and rewrites the draft's `propertyID` so the
/// subsequent save posts the real id.
///
/// Use with
/// [`SettingsHandle::submit_with`](crate::settings::SettingsHandle::submit_with)
/// on a registry that has both the GA4 module store and its settings store
/// registered.
pub fn submit_pipeline() -> SubmitPipeline {
    SubmitPipeline::new().step(SubmitStep::new(
        "create_property",
        |registry: Registry| async move {
            let settings = registry.settings::<Analytics4Settings>();
            let state = settings.state().await;
            if state.setting_str("propertyID") != Some(PROPERTY_CREATE) {
                return Ok(());
            }

            let mut body = serde_json::Map::new();
            if let Some(account) = state.setting("accountID") {
                body.insert("accountID".to_string(), account.clone());
            }
            let raw = registry.rest().post(CREATE_PROPERTY, Value::Object(body)).await?;
            let created: Property4 = serde_json::from_value(raw).map_err(|e| {
                RestError::new(
                    "invalid_response",
                    format!("malformed create-property response: {e}"),
                )
            })?;
            tracing::info!(property = %created.id, "provisioned GA4 property");

            registry
                .store::<Analytics4>()
                .dispatch(Analytics4Action::PropertyCreated(created.clone()))
                .await;
            settings.set(json!({"propertyID": created.id})).await;
            Ok(())
        },
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::connector::Connector;
    use crate::connector::test_fixtures::MockConnector;
    use crate::registry::RegistryBuilder;

    fn setup() -> (Registry, Arc<MockConnector>) {
        let connector = MockConnector::new();
        let registry = RegistryBuilder::new()
            .connector(connector.clone() as Arc<dyn Connector>)
            .register(analytics4_store())
            .settings_module::<Analytics4Settings>()
            .build();
        (registry, connector)
    }

    #[tokio::test]
    async fn successful_listing_marks_the_admin_api_working() {
        let (registry, connector) = setup();
        connector.respond_get(PROPERTIES.path(), Ok(json!([])));
        let analytics4 = registry.store::<Analytics4>();

        analytics4
            .resolve(GET_PROPERTIES, &Value::Null)
            .await
            .expect("resolve should succeed");

        let state = analytics4.state().await;
        assert_eq!(state.properties, Some(vec![]));
        assert_eq!(state.admin_api_working, Some(true));
    }

    #[tokio::test]
    async fn failed_listing_marks_the_admin_api_broken() {
        let (registry, connector) = setup();
        connector.respond_get(
            PROPERTIES.path(),
            Err(RestError::new("internal_error", "api down")),
        );
        let analytics4 = registry.store::<Analytics4>();

        analytics4
            .resolve(GET_PROPERTIES, &Value::Null)
            .await
            .expect_err("resolve should fail");

        let state = analytics4.state().await;
        assert_eq!(state.properties, None);
        assert_eq!(state.admin_api_working, Some(false));
    }

    #[tokio::test]
    async fn malformed_listing_also_counts_as_broken() {
        let (registry, connector) = setup();
        connector.respond_get(PROPERTIES.path(), Ok(json!({"not": "a list"})));
        let analytics4 = registry.store::<Analytics4>();

        let error = analytics4
            .resolve(GET_PROPERTIES, &Value::Null)
            .await
            .expect_err("resolve should fail");
        assert_eq!(error.code, "invalid_response");
        assert_eq!(analytics4.state().await.admin_api_working, Some(false));
    }

    #[tokio::test]
    async fn submit_provisions_a_property_for_the_sentinel() {
        let (registry, connector) = setup();
        connector.respond_post(
            CREATE_PROPERTY.path(),
            Ok(json!({"id": "G-123", "displayName": "New property"})),
        );
        connector.respond_post(
            Analytics4Settings::datapoint().path(),
            Ok(json!({"propertyID": "G-123", "accountID": "100", "ownerID": 1})),
        );
        let analytics4 = registry.store::<Analytics4>();
        analytics4
            .dispatch(Analytics4Action::PropertiesReceived(vec![]))
            .await;
        let settings = registry.settings::<Analytics4Settings>();
        settings
            .set(json!({"propertyID": PROPERTY_CREATE, "accountID": "100"}))
            .await;

        settings
            .submit_with(&submit_pipeline())
            .await
            .expect("submit should succeed");

        // The sentinel was replaced before the save went out.
        let saved = settings.saved().await.expect("settings should be saved");
        assert_eq!(saved["propertyID"], "G-123");

        // The creation request forwarded the account and the new property
        // joined the module's list.
        let requests = connector.requests();
        let create = requests
            .iter()
            .find(|request| request.path == CREATE_PROPERTY.path())
            .expect("create-property should have been called");
        assert_eq!(create.body, Some(json!({"data": {"accountID": "100"}})));
        assert_eq!(
            analytics4.state().await.properties.map(|p| p.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn submit_skips_provisioning_for_a_real_property() {
        let (registry, connector) = setup();
        connector.respond_post(
            Analytics4Settings::datapoint().path(),
            Ok(json!({"propertyID": "G-9", "ownerID": 1})),
        );
        let settings = registry.settings::<Analytics4Settings>();
        settings.set(json!({"propertyID": "G-9"})).await;

        settings
            .submit_with(&submit_pipeline())
            .await
            .expect("submit should succeed");

        assert_eq!(connector.calls_to(&CREATE_PROPERTY.path()), 0);
    }

    #[test]
    fn the_sentinel_passes_validation() {
        assert_eq!(
            Analytics4Settings::validate(&json!({"propertyID": PROPERTY_CREATE})),
            Ok(())
        );
        assert_eq!(
            Analytics4Settings::validate(&json!({})),
            Err(ValidationError::MissingSetting("propertyID"))
        );
    }
}
