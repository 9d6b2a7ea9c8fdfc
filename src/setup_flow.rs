//! Setup-flow decision: which Analytics setup path to offer.
//!
//! The decision combines a feature flag with the state of both Analytics
//! module stores. It is deliberately a pure read over already-loaded state
//! ([`setup_flow_mode`]); [`resolve_setup_flow_mode`] is the fetching variant
//! that loads the property lists first.

use serde_json::Value;
use std::fmt;

use crate::analytics::{self, Analytics};
use crate::analytics4::{self, Analytics4};
use crate::registry::Registry;

/// Feature flag gating the GA4 setup flow entirely.
pub const GA4_SETUP_FEATURE: &str = "ga4setup";

/// Which setup path to offer the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFlowMode {
    /// Pre-GA4 flow: feature disabled or the GA4 admin API is broken.
    Legacy,
    /// No GA4 properties exist yet; set up classic Analytics.
    Ua,
    /// No classic properties exist; set up GA4 directly.
    Ga4,
    /// Both kinds of property exist; set up GA4 alongside classic.
    Ga4Transitional,
}

impl SetupFlowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupFlowMode::Legacy => "legacy",
            SetupFlowMode::Ua => "ua",
            SetupFlowMode::Ga4 => "ga4",
            SetupFlowMode::Ga4Transitional => "ga4-transitional",
        }
    }
}

impl fmt::Display for SetupFlowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide the setup flow from already-loaded store state.
///
/// Returns `None` while a property list the decision depends on is still
/// unknown; callers render a loading state and try again after resolution.
/// The checks run in precedence order:
///
/// 1. Feature disabled: `Legacy`, without touching any store.
/// 2. GA4 admin API known broken: `Legacy`.
/// 3. GA4 property list unknown: undecided.
/// 4. No GA4 properties: `Ua`.
/// 5. Classic property list unknown: undecided.
/// 6. No classic properties: `Ga4`.
/// 7. Both kinds present: `Ga4Transitional`.
///
/// # Panics
///
/// Panics if the feature is enabled but either Analytics store is not
/// registered.
pub async fn setup_flow_mode(registry: &Registry) -> Option<SetupFlowMode> {
    if !registry.feature_enabled(GA4_SETUP_FEATURE) {
        return Some(SetupFlowMode::Legacy);
    }

    let ga4 = registry.store::<Analytics4>().state().await;
    if ga4.admin_api_working == Some(false) {
        return Some(SetupFlowMode::Legacy);
    }
    let ga4_properties = ga4.properties?;
    if ga4_properties.is_empty() {
        return Some(SetupFlowMode::Ua);
    }

    let ua = registry.store::<Analytics>().state().await;
    let ua_properties = ua.properties?;
    if ua_properties.is_empty() {
        return Some(SetupFlowMode::Ga4);
    }

    Some(SetupFlowMode::Ga4Transitional)
}

/// Load what the decision needs, then decide.
///
/// The GA4 property list is resolved first; the classic list is only fetched
/// when the decision still depends on it. Fetch failures are not propagated:
/// a failed GA4 listing marks the admin API broken (forcing `Legacy`), while
/// a failed classic listing leaves the mode undecided (`None`).
pub async fn resolve_setup_flow_mode(registry: &Registry) -> Option<SetupFlowMode> {
    if !registry.feature_enabled(GA4_SETUP_FEATURE) {
        return Some(SetupFlowMode::Legacy);
    }

    let _ = registry
        .store::<Analytics4>()
        .resolve(analytics4::GET_PROPERTIES, &Value::Null)
        .await;
    if let Some(mode) = setup_flow_mode(registry).await {
        return Some(mode);
    }

    let _ = registry
        .store::<Analytics>()
        .resolve(analytics::GET_PROPERTIES, &Value::Null)
        .await;
    setup_flow_mode(registry).await
}
