//! User dismissals: feature tours and dismissible items.
//!
//! Dismissals are optimistic: the local store records the dismissal before
//! the write goes out, so the UI element disappears immediately, and the
//! server's echo then becomes the authoritative list. Tours additionally
//! carry a cooldown so that dismissing one tour suppresses the next for a
//! while; items carry an optional expiry after which they reappear.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::registry::{Registry, ResolverCtx};
use crate::rest::{Datapoint, GetOptions, RestError};
use crate::store::{Resolver, Store, StoreDefinition, StorePart};

/// REST group owning the dismissal datapoints.
pub const GROUP: &str = "core/user";

pub const DISMISSED_TOURS: Datapoint = Datapoint::new(GROUP, "dismissed-tours");
pub const DISMISS_TOUR: Datapoint = Datapoint::new(GROUP, "dismiss-tour");
pub const DISMISSED_ITEMS: Datapoint = Datapoint::new(GROUP, "dismissed-items");
pub const DISMISS_ITEM: Datapoint = Datapoint::new(GROUP, "dismiss-item");

/// Resolver names.
pub const GET_DISMISSED_TOURS: &str = "get_dismissed_tours";
pub const GET_DISMISSED_ITEMS: &str = "get_dismissed_items";

/// Suppression window after any tour dismissal.
pub const TOUR_COOLDOWN: Duration = Duration::from_secs(2 * 60 * 60);

/// Store state: both lists stay `None` until fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dismissals {
    /// Slugs of dismissed feature tours.
    pub tours: Option<Vec<String>>,
    /// Unix seconds of the most recent tour dismissal in this session.
    pub last_tour_dismissed_at: Option<u64>,
    /// Dismissed item slugs mapped to their expiry in unix seconds;
    /// `0` means dismissed forever.
    pub items: Option<HashMap<String, u64>>,
}

impl Dismissals {
    /// Whether `slug`'s tour is dismissed; `None` until the list is known.
    pub fn is_tour_dismissed(&self, slug: &str) -> Option<bool> {
        self.tours
            .as_ref()
            .map(|tours| tours.iter().any(|tour| tour == slug))
    }

    /// Whether a tour was dismissed less than `cooldown` ago.
    pub fn tours_on_cooldown(&self, now: u64, cooldown: Duration) -> bool {
        match self.last_tour_dismissed_at {
            Some(at) => now < at + cooldown.as_secs(),
            None => false,
        }
    }

    /// Whether `slug` is dismissed at `now`; `None` until the list is known.
    pub fn is_item_dismissed(&self, slug: &str, now: u64) -> Option<bool> {
        self.items.as_ref().map(|items| match items.get(slug) {
            Some(0) => true,
            Some(expires_at) => now < *expires_at,
            None => false,
        })
    }
}

#[derive(Debug, Clone)]
pub enum DismissalAction {
    ToursReceived(Vec<String>),
    TourDismissed { slug: String, at: u64 },
    ItemsReceived(HashMap<String, u64>),
    ItemDismissed { slug: String, expires_at: u64 },
}

impl Store for Dismissals {
    const NAME: &'static str = "core/user";
    type Action = DismissalAction;

    fn reduce(mut state: Self, action: &Self::Action) -> Self {
        match action {
            DismissalAction::ToursReceived(tours) => {
                state.tours = Some(tours.clone());
            }
            DismissalAction::TourDismissed { slug, at } => {
                let tours = state.tours.get_or_insert_with(Vec::new);
                if !tours.iter().any(|tour| tour == slug) {
                    tours.push(slug.clone());
                }
                state.last_tour_dismissed_at = Some(*at);
            }
            DismissalAction::ItemsReceived(items) => {
                state.items = Some(items.clone());
            }
            DismissalAction::ItemDismissed { slug, expires_at } => {
                state
                    .items
                    .get_or_insert_with(HashMap::new)
                    .insert(slug.clone(), *expires_at);
            }
        }
        state
    }
}

/// Store definition with both list resolvers wired.
pub fn dismissals_store() -> StoreDefinition<Dismissals> {
    StoreDefinition::combine(vec![
        StorePart::new()
            .resolver(
                GET_DISMISSED_TOURS,
                Resolver::new(|ctx: ResolverCtx<Dismissals>| async move {
                    let raw = ctx
                        .rest
                        .get(DISMISSED_TOURS, Value::Null, GetOptions::default())
                        .await?;
                    let tours: Vec<String> = serde_json::from_value(raw).map_err(|e| {
                        RestError::new(
                            "invalid_response",
                            format!("malformed dismissed-tours payload: {e}"),
                        )
                    })?;
                    ctx.store
                        .dispatch(DismissalAction::ToursReceived(tours))
                        .await;
                    Ok(())
                }),
            )
            .resolver(
                GET_DISMISSED_ITEMS,
                Resolver::new(|ctx: ResolverCtx<Dismissals>| async move {
                    let raw = ctx
                        .rest
                        .get(DISMISSED_ITEMS, Value::Null, GetOptions::default())
                        .await?;
                    let items: HashMap<String, u64> =
                        serde_json::from_value(raw).map_err(|e| {
                            RestError::new(
                                "invalid_response",
                                format!("malformed dismissed-items payload: {e}"),
                            )
                        })?;
                    ctx.store
                        .dispatch(DismissalAction::ItemsReceived(items))
                        .await;
                    Ok(())
                }),
            ),
    ])
}

/// Dismiss a feature tour.
///
/// The dismissal is recorded locally first (starting the cooldown), then
/// posted; the server's echo, the full list of dismissed tours, replaces the
/// local list. On failure the optimistic entry stays so the tour does not
/// reappear mid-session, and the error is returned for reporting.
///
/// # Errors
///
/// Returns the POST's [`RestError`], or `invalid_response` for an
/// undecodable echo.
pub async fn dismiss_tour(registry: &Registry, slug: &str) -> Result<Vec<String>, RestError> {
    let store = registry.store::<Dismissals>();
    let at = registry.clock().now();
    store
        .dispatch(DismissalAction::TourDismissed {
            slug: slug.to_string(),
            at,
        })
        .await;

    let echo = registry
        .rest()
        .post(DISMISS_TOUR, json!({"slug": slug}))
        .await?;
    let tours: Vec<String> = serde_json::from_value(echo).map_err(|e| {
        RestError::new(
            "invalid_response",
            format!("malformed dismiss-tour response: {e}"),
        )
    })?;
    store
        .dispatch(DismissalAction::ToursReceived(tours.clone()))
        .await;
    registry.rest().invalidate(DISMISSED_TOURS).await;
    Ok(tours)
}

/// Dismiss an item, optionally only for `expires_in`.
///
/// `None` and a zero `expires_in` both dismiss forever; positive
/// durations under a second round up to one. The wire carries the
/// relative expiry in seconds (`0` for forever); the store keeps the
/// absolute expiry so [`Dismissals::is_item_dismissed`] is a plain
/// comparison.
///
/// # Errors
///
/// Returns the POST's [`RestError`], or `invalid_response` for an
/// undecodable echo.
pub async fn dismiss_item(
    registry: &Registry,
    slug: &str,
    expires_in: Option<Duration>,
) -> Result<HashMap<String, u64>, RestError> {
    let store = registry.store::<Dismissals>();
    let now = registry.clock().now();
    let (expiration, expires_at) = match expires_in {
        Some(duration) if !duration.is_zero() => {
            let seconds = duration.as_secs().max(1);
            (seconds, now + seconds)
        }
        _ => (0, 0),
    };
    store
        .dispatch(DismissalAction::ItemDismissed {
            slug: slug.to_string(),
            expires_at,
        })
        .await;

    let echo = registry
        .rest()
        .post(DISMISS_ITEM, json!({"slug": slug, "expiration": expiration}))
        .await?;
    let items: HashMap<String, u64> = serde_json::from_value(echo).map_err(|e| {
        RestError::new(
            "invalid_response",
            format!("malformed dismiss-item response: {e}"),
        )
    })?;
    store
        .dispatch(DismissalAction::ItemsReceived(items.clone()))
        .await;
    registry.rest().invalidate(DISMISSED_ITEMS).await;
    Ok(items)
}

/// Whether the tour cooldown is active right now.
pub async fn tour_cooldown_active(registry: &Registry, cooldown: Duration) -> bool {
    let now = registry.clock().now();
    registry
        .store::<Dismissals>()
        .select(|dismissals| dismissals.tours_on_cooldown(now, cooldown))
        .await
}

/// Whether `slug` is dismissed right now; `None` until the list is known.
pub async fn item_dismissed(registry: &Registry, slug: &str) -> Option<bool> {
    let now = registry.clock().now();
    registry
        .store::<Dismissals>()
        .select(|dismissals| dismissals.is_item_dismissed(slug, now))
        .await
}
