//! Classic Analytics module: property metadata and settings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::registry::ResolverCtx;
use crate::rest::{Datapoint, GetOptions, RestError};
use crate::settings::{SettingsModule, require_setting_str};
use crate::store::{Resolver, Store, StoreDefinition, StorePart};

/// REST group of the classic Analytics module.
pub const GROUP: &str = "modules/analytics";

/// Datapoint listing the user's properties.
pub const PROPERTIES: Datapoint = Datapoint::new(GROUP, "properties");

/// Resolver name for the property list.
pub const GET_PROPERTIES: &str = "get_properties";

/// One classic Analytics property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: String,
    pub name: String,
    pub account_id: String,
}

/// Module store state: the property list, `None` until fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Analytics {
    pub properties: Option<Vec<Property>>,
}

impl Analytics {
    pub fn property_by_id(&self, id: &str) -> Option<&Property> {
        self.properties
            .as_ref()?
            .iter()
            .find(|property| property.id == id)
    }
}

#[derive(Debug, Clone)]
pub enum AnalyticsAction {
    PropertiesReceived(Vec<Property>),
}

impl Store for Analytics {
    const NAME: &'static str = "modules/analytics";
    type Action = AnalyticsAction;

    fn reduce(mut state: Self, action: &Self::Action) -> Self {
        match action {
            AnalyticsAction::PropertiesReceived(properties) => {
                state.properties = Some(properties.clone());
            }
        }
        state
    }
}

/// Store definition with the property-list resolver wired.
///
/// The resolver forwards its arguments (for example an `accountID` filter)
/// to the REST read.
pub fn analytics_store() -> StoreDefinition<Analytics> {
    StoreDefinition::combine(vec![StorePart::new().resolver(
        GET_PROPERTIES,
        Resolver::new(|ctx: ResolverCtx<Analytics>| async move {
            let raw = ctx
                .rest
                .get(PROPERTIES, ctx.args.clone(), GetOptions::default())
                .await?;
            let properties: Vec<Property> = serde_json::from_value(raw).map_err(|e| {
                RestError::new(
                    "invalid_response",
                    format!("malformed properties payload: {e}"),
                )
            })?;
            ctx.store
                .dispatch(AnalyticsAction::PropertiesReceived(properties))
                .await;
            Ok(())
        }),
    )])
}

/// Settings module for classic Analytics.
///
/// A complete configuration names the account, property, and view; `ownerID`
/// is server bookkeeping and excluded from change detection.
pub struct AnalyticsSettings;

impl SettingsModule for AnalyticsSettings {
    const GROUP: &'static str = GROUP;
    const STORE_NAME: &'static str = "modules/analytics/settings";

    fn non_comparable() -> &'static [&'static str] {
        &["ownerID"]
    }

    fn validate(settings: &Value) -> Result<(), ValidationError> {
        require_setting_str(settings, "accountID")?;
        require_setting_str(settings, "propertyID")?;
        require_setting_str(settings, "profileID")?;
        Ok(())
    }
}
