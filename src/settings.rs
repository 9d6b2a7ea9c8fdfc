//! Generic module-settings stores.
//!
//! Every connected module keeps its settings in the same shape: a `saved`
//! baseline mirroring the server and a `current` working copy carrying local
//! edits. [`settings_store`] builds the complete [`StoreDefinition`] for a
//! module from a small [`SettingsModule`] description (REST group, ignored
//! bookkeeping keys, validation rules), and [`SettingsHandle`] wraps the
//! registered store with the settings lifecycle: load, edit, validate, save,
//! roll back, submit.
//!
//! Settings objects stay as JSON values rather than typed structs on purpose;
//! the server owns the schema, and unknown keys must survive a load/save
//! round trip untouched.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SubmitError, ValidationError};
use crate::registry::{Registry, ResolverCtx, StoreHandle};
use crate::rest::{Datapoint, GetOptions, RestError};
use crate::store::{Resolver, Store, StoreDefinition, StorePart};
use crate::submit::SubmitPipeline;

/// Resolver name for the settings fetch.
pub const GET_SETTINGS: &str = "get_settings";

/// Step name carried by [`SubmitError::Step`] when the final save fails.
pub const SAVE_STEP: &str = "save_settings";

/// Static description of one module's settings store.
pub trait SettingsModule: Send + Sync + 'static {
    /// REST group owning the settings datapoint, e.g. `modules/analytics`.
    const GROUP: &'static str;

    /// Registry store name, e.g. `modules/analytics/settings`.
    const STORE_NAME: &'static str;

    /// The settings datapoint; `{GROUP}/data/settings` unless overridden.
    fn datapoint() -> Datapoint {
        Datapoint::new(Self::GROUP, "settings")
    }

    /// Keys ignored by change detection.
    ///
    /// Server-managed bookkeeping (owner ids, timestamps) changes without
    /// user intent and must not make a clean draft look dirty.
    fn non_comparable() -> &'static [&'static str] {
        &[]
    }

    /// Domain validation of a draft settings object.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] the draft violates.
    fn validate(settings: &Value) -> Result<(), ValidationError>;
}

/// Lifecycle state shared by every settings store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsState {
    /// Server baseline from the last fetch or save echo.
    pub saved: Option<Value>,
    /// Working copy carrying local edits; diverges from `saved` while dirty.
    pub current: Option<Value>,
    pub is_fetching: bool,
    pub is_saving: bool,
    /// Last fetch or save failure, cleared by the next successful save or
    /// by a rollback.
    pub error: Option<RestError>,
}

impl SettingsState {
    /// Whether the working copy differs from the baseline, ignoring `ignore`
    /// keys on both sides.
    ///
    /// No working copy means nothing changed; a working copy without a
    /// baseline (edits before the first fetch finished) always counts as
    /// changed.
    pub fn have_changed(&self, ignore: &[&str]) -> bool {
        match (self.current.as_ref(), self.saved.as_ref()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(current), Some(saved)) => strip(current, ignore) != strip(saved, ignore),
        }
    }

    /// One key of the working copy.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.current.as_ref()?.get(key)
    }

    /// One key of the working copy, as a string.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.setting(key)?.as_str()
    }
}

fn strip(value: &Value, ignore: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !ignore.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Shallow-merge `patch` over `base` (or an empty object).
fn merge_objects(base: Option<Value>, patch: &Value) -> Value {
    let mut merged = match base {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if let Value::Object(patch) = patch {
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Actions understood by every settings store.
#[derive(Debug, Clone)]
pub enum SettingsAction {
    /// Merge a partial settings object into the working copy.
    Set(Value),
    FetchStarted,
    FetchSucceeded(Value),
    FetchFailed(RestError),
    SaveStarted,
    /// Adopt the server echo as both baseline and working copy.
    SaveSucceeded(Value),
    SaveFailed(RestError),
    /// Discard local edits and any recorded error, restoring the baseline.
    Rollback,
}

fn apply_action(mut state: SettingsState, action: &SettingsAction) -> SettingsState {
    match action {
        SettingsAction::Set(patch) => {
            let base = state.current.take().or_else(|| state.saved.clone());
            state.current = Some(merge_objects(base, patch));
        }
        SettingsAction::FetchStarted => {
            state.is_fetching = true;
        }
        SettingsAction::FetchSucceeded(fetched) => {
            state.is_fetching = false;
            // Edits made while the fetch was in flight stay on top.
            state.current = Some(match state.current.take() {
                Some(edits) => merge_objects(Some(fetched.clone()), &edits),
                None => fetched.clone(),
            });
            state.saved = Some(fetched.clone());
        }
        SettingsAction::FetchFailed(error) => {
            state.is_fetching = false;
            state.error = Some(error.clone());
        }
        SettingsAction::SaveStarted => {
            state.is_saving = true;
        }
        SettingsAction::SaveSucceeded(echo) => {
            state.is_saving = false;
            state.error = None;
            state.saved = Some(echo.clone());
            state.current = Some(echo.clone());
        }
        SettingsAction::SaveFailed(error) => {
            state.is_saving = false;
            state.error = Some(error.clone());
        }
        SettingsAction::Rollback => {
            state.current = state.saved.clone();
            state.error = None;
        }
    }
    state
}

/// Store state for module `M`: the shared [`SettingsState`] tagged with the
/// module so each module gets its own store registration.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound(serialize = "", deserialize = ""))]
pub struct Settings<M: SettingsModule> {
    pub state: SettingsState,
    #[serde(skip)]
    marker: PhantomData<fn() -> M>,
}

impl<M: SettingsModule> Clone for Settings<M> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            marker: PhantomData,
        }
    }
}

impl<M: SettingsModule> Default for Settings<M> {
    fn default() -> Self {
        Self {
            state: SettingsState::default(),
            marker: PhantomData,
        }
    }
}

impl<M: SettingsModule> PartialEq for Settings<M> {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl<M: SettingsModule> fmt::Debug for Settings<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("module", &M::STORE_NAME)
            .field("state", &self.state)
            .finish()
    }
}

impl<M: SettingsModule> Store for Settings<M> {
    const NAME: &'static str = M::STORE_NAME;
    type Action = SettingsAction;

    fn reduce(mut settings: Self, action: &Self::Action) -> Self {
        settings.state = apply_action(settings.state, action);
        settings
    }
}

/// Store definition for module `M`'s settings, with the fetch resolver wired.
pub fn settings_store<M: SettingsModule>() -> StoreDefinition<Settings<M>> {
    StoreDefinition::combine(vec![StorePart::new().resolver(
        GET_SETTINGS,
        Resolver::new(|ctx: ResolverCtx<Settings<M>>| async move {
            ctx.store.dispatch(SettingsAction::FetchStarted).await;
            match ctx
                .rest
                .get(M::datapoint(), Value::Null, GetOptions::default())
                .await
            {
                Ok(settings) => {
                    ctx.store
                        .dispatch(SettingsAction::FetchSucceeded(settings))
                        .await;
                    Ok(())
                }
                Err(error) => {
                    ctx.store
                        .dispatch(SettingsAction::FetchFailed(error.clone()))
                        .await;
                    Err(error)
                }
            }
        }),
    )])
}

/// Settings lifecycle operations for module `M`, on top of its store handle.
pub struct SettingsHandle<M: SettingsModule> {
    store: StoreHandle<Settings<M>>,
    registry: Registry,
}

impl<M: SettingsModule> Clone for SettingsHandle<M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<M: SettingsModule> fmt::Debug for SettingsHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsHandle")
            .field("module", &M::STORE_NAME)
            .finish_non_exhaustive()
    }
}

impl<M: SettingsModule> SettingsHandle<M> {
    pub(crate) fn new(store: StoreHandle<Settings<M>>, registry: Registry) -> Self {
        Self { store, registry }
    }

    /// The underlying store handle, for resolution queries and subscriptions.
    pub fn store(&self) -> &StoreHandle<Settings<M>> {
        &self.store
    }

    /// Fetch the settings from the server, at most once.
    ///
    /// Concurrent and repeated calls share one fetch through the store's
    /// resolution tracking.
    ///
    /// # Errors
    ///
    /// Returns the fetch failure, which is also recorded in
    /// [`SettingsState::error`].
    pub async fn load(&self) -> Result<(), RestError> {
        self.store.resolve(GET_SETTINGS, &Value::Null).await
    }

    /// Clone of the lifecycle state.
    pub async fn state(&self) -> SettingsState {
        self.store.select(|settings| settings.state.clone()).await
    }

    /// The working copy, if any settings are known.
    pub async fn settings(&self) -> Option<Value> {
        self.store
            .select(|settings| settings.state.current.clone())
            .await
    }

    /// The server baseline, if fetched.
    pub async fn saved(&self) -> Option<Value> {
        self.store
            .select(|settings| settings.state.saved.clone())
            .await
    }

    /// Last recorded fetch or save failure.
    pub async fn error(&self) -> Option<RestError> {
        self.store
            .select(|settings| settings.state.error.clone())
            .await
    }

    /// Merge a partial settings object into the working copy.
    ///
    /// # Panics
    ///
    /// Panics if `patch` is not a JSON object.
    pub async fn set(&self, patch: Value) {
        if !patch.is_object() {
            panic!(
                "settings patch for '{}' must be a JSON object, got {patch}",
                M::STORE_NAME
            );
        }
        self.store.dispatch(SettingsAction::Set(patch)).await;
    }

    /// Whether the working copy differs from the baseline, ignoring the
    /// module's non-comparable keys.
    pub async fn have_changed(&self) -> bool {
        self.store
            .select(|settings| settings.state.have_changed(M::non_comparable()))
            .await
    }

    /// Discard local edits and any recorded error, restoring the baseline.
    pub async fn rollback(&self) {
        self.store.dispatch(SettingsAction::Rollback).await;
    }

    /// Whether the current draft could be submitted right now.
    ///
    /// # Errors
    ///
    /// [`ValidationError::SaveInFlight`] while a save is running,
    /// [`ValidationError::NoChanges`] for a clean draft, then whatever
    /// [`SettingsModule::validate`] rejects.
    pub async fn validate(&self) -> Result<(), ValidationError> {
        let state = self.state().await;
        if state.is_saving {
            return Err(ValidationError::SaveInFlight);
        }
        if !state.have_changed(M::non_comparable()) {
            return Err(ValidationError::NoChanges);
        }
        let current = state.current.as_ref().ok_or(ValidationError::NoChanges)?;
        M::validate(current)
    }

    /// `validate()` collapsed to a flag, for enabling a submit control.
    pub async fn can_submit(&self) -> bool {
        self.validate().await.is_ok()
    }

    /// Post the working copy and adopt the server's echo as the new baseline.
    ///
    /// The echo wins over the draft (the server may normalize values), the
    /// recorded error is cleared, and every cached read under the module's
    /// REST group is invalidated. On failure the draft and its changed state
    /// survive so the save can be retried.
    ///
    /// Concurrent saves race for one claim, taken under the store's lock;
    /// exactly one caller posts and the rest are rejected.
    ///
    /// # Errors
    ///
    /// `missing_settings` when there is no working copy, `save_in_flight`
    /// when a save is already running, otherwise the POST's [`RestError`].
    pub async fn save(&self) -> Result<Value, RestError> {
        let draft = self
            .store
            .try_dispatch(
                |settings| {
                    let state = &settings.state;
                    let Some(draft) = state.current.as_ref() else {
                        return Err(RestError::new("missing_settings", "no settings to save"));
                    };
                    if state.is_saving {
                        return Err(RestError::new(
                            "save_in_flight",
                            "a save is already in flight",
                        ));
                    }
                    Ok(draft.clone())
                },
                SettingsAction::SaveStarted,
            )
            .await?;

        tracing::debug!(module = M::GROUP, "saving settings");
        match self.registry.rest().post(M::datapoint(), draft).await {
            Ok(echo) => {
                self.store
                    .dispatch(SettingsAction::SaveSucceeded(echo.clone()))
                    .await;
                // Sibling datapoints of the group may derive from settings.
                self.registry.rest().invalidate_group(M::GROUP).await;
                Ok(echo)
            }
            Err(error) => {
                tracing::warn!(module = M::GROUP, error = %error, "settings save failed");
                self.store
                    .dispatch(SettingsAction::SaveFailed(error.clone()))
                    .await;
                Err(error)
            }
        }
    }

    /// Validate, then save.
    ///
    /// # Errors
    ///
    /// [`SubmitError::NotSubmittable`] when validation rejects the draft,
    /// or [`SubmitError::Step`] named [`SAVE_STEP`] when the save fails.
    pub async fn submit_changes(&self) -> Result<(), SubmitError> {
        self.submit_with(&SubmitPipeline::new()).await
    }

    /// Validate, run `pipeline`, then save.
    ///
    /// Steps run after validation and before the save, so a step may still
    /// rewrite the draft (for example replacing a create-sentinel with a
    /// freshly provisioned id) and the save posts the rewritten draft.
    ///
    /// # Errors
    ///
    /// [`SubmitError::NotSubmittable`] when validation rejects the draft,
    /// or [`SubmitError::Step`] naming the failing pipeline step or the
    /// final save.
    pub async fn submit_with(&self, pipeline: &SubmitPipeline) -> Result<(), SubmitError> {
        self.validate().await.map_err(SubmitError::NotSubmittable)?;
        pipeline.run(&self.registry).await?;
        self.save().await.map_err(|source| SubmitError::Step {
            step: SAVE_STEP,
            source,
        })?;
        Ok(())
    }
}

/// Require `field` to be a non-empty string setting.
///
/// Shared by module `validate` implementations.
///
/// # Errors
///
/// [`ValidationError::MissingSetting`] when absent or `null`, otherwise
/// [`ValidationError::InvalidSetting`] for empty or non-string values.
pub fn require_setting_str<'a>(
    settings: &'a Value,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    match settings.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingSetting(field)),
        Some(Value::String(text)) if text.is_empty() => Err(ValidationError::InvalidSetting {
            field,
            reason: "must not be empty".to_string(),
        }),
        Some(Value::String(text)) => Ok(text),
        Some(_) => Err(ValidationError::InvalidSetting {
            field,
            reason: "must be a string".to_string(),
        }),
    }
}
