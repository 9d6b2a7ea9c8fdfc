//! The registry: typed store instances, dispatch, and resolution tracking.
//!
//! A [`Registry`] is built once per surface (dashboard, CLI invocation, test)
//! from a [`RegistryBuilder`] and owns every registered store's live state,
//! the shared [`RestClient`], and the enabled feature flags. There is no
//! global instance; anything that needs state receives a registry or a
//! [`StoreHandle`] cloned from one.
//!
//! Resolution tracking is what makes reads cheap to call from anywhere:
//! [`StoreHandle::resolve`] runs a named resolver at most once per distinct
//! argument set, collapsing concurrent callers onto a single in-flight run
//! and replaying the recorded outcome (success or failure) to everyone else.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{RwLock, watch};

use crate::cache::{Clock, MemoryBackend, RequestCache, SystemClock};
use crate::canon;
use crate::connector::Connector;
use crate::rest::{RestClient, RestError};
use crate::settings::{Settings, SettingsHandle, SettingsModule};
use crate::store::{Resolver, Store, StoreDefinition};

/// Identity of one resolution: a resolver name plus canonicalized arguments.
///
/// Arguments are stored canonicalized (sorted object keys, compact rendering)
/// so that argument objects that differ only in key order share a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResolutionKey {
    selector: &'static str,
    args: String,
}

impl ResolutionKey {
    fn new(selector: &'static str, args: &Value) -> Self {
        Self {
            selector,
            args: canon::canonical(args),
        }
    }
}

/// Lifecycle of one resolution record.
///
/// `InFlight` holds the receiver side of the owning run's completion channel;
/// waiters clone it. A dropped sender (the owning caller was cancelled) is
/// how waiters detect an abandoned run.
#[derive(Debug, Clone)]
enum ResolutionState {
    InFlight(watch::Receiver<bool>),
    Finished,
    Failed(RestError),
}

/// Per-store slot owned by the registry.
struct StoreCell<S: Store> {
    state: RwLock<S>,
    definition: StoreDefinition<S>,
    resolutions: Mutex<HashMap<ResolutionKey, ResolutionState>>,
    /// Bumped on every dispatch; `subscribe()` feeds [`StoreHandle::changed`].
    version: watch::Sender<u64>,
}

/// What [`StoreHandle::resolve`] decided to do after inspecting the record.
enum Claim<S: Store> {
    Run(Resolver<S>, watch::Sender<bool>),
    Wait(watch::Receiver<bool>),
}

/// Type-erased store map keyed by store name.
///
/// Each value is an `Arc<StoreCell<S>>` behind `Box<dyn Any + Send + Sync>`;
/// [`Registry::store`] downcasts back to the typed cell.
type StoreMap = HashMap<&'static str, Box<dyn Any + Send + Sync>>;

struct RegistryInner {
    stores: StoreMap,
    rest: RestClient,
    features: HashSet<String>,
    clock: Arc<dyn Clock>,
    /// Sorted for stable `Debug` output and introspection.
    store_names: Vec<&'static str>,
}

/// Shared handle to one registry instance.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped, and clones see
/// the same stores, cache, and resolution records.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("stores", &self.inner.store_names)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Entry point for assembling a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Typed handle to a registered store.
    ///
    /// # Panics
    ///
    /// Panics if no store named `S::NAME` was registered, or if the store
    /// registered under that name has a different state type. Both are
    /// wiring mistakes, not runtime conditions.
    pub fn store<S: Store>(&self) -> StoreHandle<S> {
        let boxed = self
            .inner
            .stores
            .get(S::NAME)
            .unwrap_or_else(|| panic!("store '{}' is not registered", S::NAME));
        let cell = boxed
            .downcast_ref::<Arc<StoreCell<S>>>()
            .unwrap_or_else(|| {
                panic!("store '{}' is registered with a different state type", S::NAME)
            })
            .clone();
        StoreHandle {
            cell,
            registry: self.clone(),
        }
    }

    /// Settings-aware wrapper around the store for module `M`.
    ///
    /// # Panics
    ///
    /// Panics if `M`'s settings store was not registered.
    pub fn settings<M: SettingsModule>(&self) -> SettingsHandle<M> {
        SettingsHandle::new(self.store::<Settings<M>>(), self.clone())
    }

    /// The shared REST client.
    pub fn rest(&self) -> &RestClient {
        &self.inner.rest
    }

    /// Whether a named feature flag was enabled at build time.
    pub fn feature_enabled(&self, name: &str) -> bool {
        self.inner.features.contains(name)
    }

    /// Names of every registered store, sorted.
    pub fn store_names(&self) -> &[&'static str] {
        &self.inner.store_names
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }
}

/// Builder for configuring and assembling a [`Registry`].
///
/// Collects the connector, request cache, clock, feature flags, and store
/// definitions, then assembles them on [`build`](RegistryBuilder::build).
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use statekit::{HttpConnector, RegistryBuilder, StoreDefinition};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// # struct Prefs { dark_mode: bool }
/// # impl statekit::Store for Prefs {
/// #     const NAME: &'static str = "core/user/prefs";
/// #     type Action = ();
/// #     fn reduce(state: Self, _action: &Self::Action) -> Self { state }
/// # }
///
/// let registry = RegistryBuilder::new()
///     .connector(Arc::new(HttpConnector::new("https://example.com/api")))
///     .register(StoreDefinition::<Prefs>::new())
///     .build();
/// ```
pub struct RegistryBuilder {
    stores: StoreMap,
    store_names: Vec<&'static str>,
    connector: Option<Arc<dyn Connector>>,
    cache: Option<RequestCache>,
    clock: Arc<dyn Clock>,
    features: HashSet<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            stores: HashMap::new(),
            store_names: Vec::new(),
            connector: None,
            cache: None,
            clock: Arc::new(SystemClock),
            features: HashSet::new(),
        }
    }

    /// Set the connector all REST traffic goes through.
    ///
    /// Wrap it in a [`PreloadingConnector`](crate::preload::PreloadingConnector)
    /// first to serve server-rendered responses without a network round trip.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the default in-memory request cache.
    pub fn cache(mut self, cache: RequestCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the system clock. The default cache (when
    /// [`cache`](RegistryBuilder::cache) is not called) shares this clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable a feature flag for this registry instance.
    pub fn feature(mut self, name: impl Into<String>) -> Self {
        self.features.insert(name.into());
        self
    }

    /// Register a store.
    ///
    /// # Panics
    ///
    /// Panics if a store named `S::NAME` is already registered.
    pub fn register<S: Store>(mut self, definition: StoreDefinition<S>) -> Self {
        if self.stores.contains_key(S::NAME) {
            panic!("store '{}' is already registered", S::NAME);
        }
        let initial = definition.initial.clone();
        let (version, _) = watch::channel(0u64);
        let cell = Arc::new(StoreCell {
            state: RwLock::new(initial),
            definition,
            resolutions: Mutex::new(HashMap::new()),
            version,
        });
        self.stores.insert(S::NAME, Box::new(cell));
        self.store_names.push(S::NAME);
        self
    }

    /// Register the settings store for module `M`.
    ///
    /// Shorthand for `register(settings_store::<M>())`.
    pub fn settings_module<M: SettingsModule>(self) -> Self {
        self.register(crate::settings::settings_store::<M>())
    }

    /// Assemble the registry.
    ///
    /// When no cache was provided, an in-memory one sharing the builder's
    /// clock is created.
    ///
    /// # Panics
    ///
    /// Panics if no connector was configured.
    pub fn build(mut self) -> Registry {
        let connector = self
            .connector
            .take()
            .expect("RegistryBuilder requires a connector; call connector() before build()");
        let cache = self.cache.unwrap_or_else(|| {
            RequestCache::new(Arc::new(MemoryBackend::new()), Arc::clone(&self.clock))
        });
        let rest = RestClient::new(connector, cache);
        self.store_names.sort_unstable();

        tracing::debug!(stores = ?self.store_names, "registry assembled");

        Registry {
            inner: Arc::new(RegistryInner {
                stores: self.stores,
                rest,
                features: self.features,
                clock: self.clock,
                store_names: self.store_names,
            }),
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("stores", &self.store_names)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

/// Typed handle to one registered store.
///
/// Handles are cheap clones of shared state; every handle to the same store
/// observes the same dispatches and resolution records.
pub struct StoreHandle<S: Store> {
    cell: Arc<StoreCell<S>>,
    registry: Registry,
}

impl<S: Store> Clone for StoreHandle<S> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            registry: self.registry.clone(),
        }
    }
}

impl<S: Store> fmt::Debug for StoreHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store", &S::NAME)
            .finish_non_exhaustive()
    }
}

impl<S: Store> StoreHandle<S> {
    /// Name of the underlying store.
    pub fn name(&self) -> &'static str {
        S::NAME
    }

    /// The registry this handle belongs to.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Fold `action` through the store's reducers and bump the version.
    ///
    /// Reducers see the state by value; no `&mut` access ever escapes the
    /// store's lock.
    pub async fn dispatch(&self, action: S::Action) {
        {
            let mut state = self.cell.state.write().await;
            let current = std::mem::take(&mut *state);
            *state = self.cell.definition.apply(current, &action);
        }
        self.cell.version.send_modify(|version| *version += 1);
    }

    /// Fold `action` only if `check` accepts the current state.
    ///
    /// Check and fold happen under one write acquisition, so no other
    /// dispatch can land between the check's answer and the action. On
    /// `Err` the state is untouched and the version does not tick.
    ///
    /// # Errors
    ///
    /// Returns the check's rejection verbatim.
    pub async fn try_dispatch<T, E>(
        &self,
        check: impl FnOnce(&S) -> Result<T, E>,
        action: S::Action,
    ) -> Result<T, E> {
        let result = {
            let mut state = self.cell.state.write().await;
            let result = check(&state);
            if result.is_ok() {
                let current = std::mem::take(&mut *state);
                *state = self.cell.definition.apply(current, &action);
            }
            result
        };
        if result.is_ok() {
            self.cell.version.send_modify(|version| *version += 1);
        }
        result
    }

    /// Clone of the current state.
    pub async fn state(&self) -> S {
        self.cell.state.read().await.clone()
    }

    /// Project out of the current state without cloning all of it.
    pub async fn select<T>(&self, selector: impl FnOnce(&S) -> T) -> T {
        let state = self.cell.state.read().await;
        selector(&state)
    }

    /// Watch channel that ticks on every dispatch to this store.
    ///
    /// The value is a monotonic dispatch counter; subscribers typically only
    /// care that it changed.
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.cell.version.subscribe()
    }

    /// Run the named resolver at most once for this argument set.
    ///
    /// The first caller claims the run; concurrent callers wait for it and
    /// share its outcome. Once a resolution has finished (or failed), later
    /// calls return the recorded outcome without running the resolver again,
    /// until [`invalidate_resolution`](StoreHandle::invalidate_resolution) or
    /// [`clear_error`](StoreHandle::clear_error) discards the record.
    ///
    /// A claiming caller that is cancelled mid-run leaves a dangling record;
    /// waiters detect the dead completion channel, discard the record, and
    /// one of them claims a fresh run. Dropping every caller therefore never
    /// wedges a resolution.
    ///
    /// # Errors
    ///
    /// Returns the resolver's [`RestError`], fresh or recorded.
    ///
    /// # Panics
    ///
    /// Panics if the store has no resolver named `selector`.
    pub async fn resolve(&self, selector: &'static str, args: &Value) -> Result<(), RestError> {
        let key = ResolutionKey::new(selector, args);
        loop {
            let claim = {
                let mut resolutions = self
                    .cell
                    .resolutions
                    .lock()
                    .expect("resolutions mutex poisoned");
                match resolutions.get(&key) {
                    Some(ResolutionState::Finished) => return Ok(()),
                    Some(ResolutionState::Failed(error)) => return Err(error.clone()),
                    Some(ResolutionState::InFlight(receiver)) => Claim::Wait(receiver.clone()),
                    None => {
                        let resolver = self
                            .cell
                            .definition
                            .resolvers
                            .get(selector)
                            .unwrap_or_else(|| {
                                panic!("store '{}' has no resolver named '{selector}'", S::NAME)
                            })
                            .clone();
                        let (done_tx, done_rx) = watch::channel(false);
                        resolutions.insert(key.clone(), ResolutionState::InFlight(done_rx));
                        Claim::Run(resolver, done_tx)
                    }
                }
            };

            match claim {
                Claim::Run(resolver, done) => {
                    return self.run_resolver(resolver, selector, &key, args, done).await;
                }
                Claim::Wait(mut receiver) => {
                    if receiver.changed().await.is_ok() {
                        // The owner finished; loop to read the recorded outcome.
                        continue;
                    }
                    // The owning caller was dropped without completing. Discard
                    // the record, but only if it still holds the dead channel;
                    // another waiter may already have claimed a fresh run.
                    let mut resolutions = self
                        .cell
                        .resolutions
                        .lock()
                        .expect("resolutions mutex poisoned");
                    if let Some(ResolutionState::InFlight(stored)) = resolutions.get(&key)
                        && stored.has_changed().is_err()
                    {
                        tracing::debug!(
                            store = S::NAME,
                            selector,
                            "abandoned resolution discarded"
                        );
                        resolutions.remove(&key);
                    }
                }
            }
        }
    }

    async fn run_resolver(
        &self,
        resolver: Resolver<S>,
        selector: &'static str,
        key: &ResolutionKey,
        args: &Value,
        done: watch::Sender<bool>,
    ) -> Result<(), RestError> {
        tracing::debug!(store = S::NAME, selector, "running resolver");
        let ctx = ResolverCtx {
            store: self.clone(),
            rest: self.registry.rest().clone(),
            registry: self.registry.clone(),
            args: args.clone(),
        };
        let result = resolver.call(ctx).await;

        {
            let mut resolutions = self
                .cell
                .resolutions
                .lock()
                .expect("resolutions mutex poisoned");
            match &result {
                Ok(()) => {
                    resolutions.insert(key.clone(), ResolutionState::Finished);
                }
                Err(error) => {
                    tracing::warn!(
                        store = S::NAME,
                        selector,
                        error = %error,
                        "resolver failed"
                    );
                    resolutions.insert(key.clone(), ResolutionState::Failed(error.clone()));
                }
            }
        }
        // Wake waiters after the record is in place.
        let _ = done.send(true);
        result
    }

    /// Whether a resolution for `(selector, args)` is currently in flight.
    pub fn is_resolving(&self, selector: &'static str, args: &Value) -> bool {
        matches!(
            self.resolution(selector, args),
            Some(ResolutionState::InFlight(_))
        )
    }

    /// Whether a resolution for `(selector, args)` finished successfully.
    pub fn has_finished(&self, selector: &'static str, args: &Value) -> bool {
        matches!(self.resolution(selector, args), Some(ResolutionState::Finished))
    }

    /// The recorded failure for `(selector, args)`, if its last run failed.
    pub fn error_for(&self, selector: &'static str, args: &Value) -> Option<RestError> {
        match self.resolution(selector, args) {
            Some(ResolutionState::Failed(error)) => Some(error),
            _ => None,
        }
    }

    /// Discard a recorded failure so the next [`resolve`](StoreHandle::resolve)
    /// retries. Returns whether a failure was recorded.
    pub fn clear_error(&self, selector: &'static str, args: &Value) -> bool {
        let key = ResolutionKey::new(selector, args);
        let mut resolutions = self
            .cell
            .resolutions
            .lock()
            .expect("resolutions mutex poisoned");
        if matches!(resolutions.get(&key), Some(ResolutionState::Failed(_))) {
            resolutions.remove(&key);
            return true;
        }
        false
    }

    /// Discard the resolution record for `(selector, args)`.
    ///
    /// The next [`resolve`](StoreHandle::resolve) runs the resolver again. A
    /// run already in flight is not cancelled; it records its outcome when it
    /// completes.
    pub fn invalidate_resolution(&self, selector: &'static str, args: &Value) {
        let key = ResolutionKey::new(selector, args);
        self.cell
            .resolutions
            .lock()
            .expect("resolutions mutex poisoned")
            .remove(&key);
    }

    /// Discard every resolution record for `selector`, across all argument
    /// sets.
    pub fn invalidate_resolutions(&self, selector: &'static str) {
        self.cell
            .resolutions
            .lock()
            .expect("resolutions mutex poisoned")
            .retain(|key, _| key.selector != selector);
    }

    fn resolution(&self, selector: &'static str, args: &Value) -> Option<ResolutionState> {
        let key = ResolutionKey::new(selector, args);
        self.cell
            .resolutions
            .lock()
            .expect("resolutions mutex poisoned")
            .get(&key)
            .cloned()
    }
}

/// Context handed to a running resolver.
pub struct ResolverCtx<S: Store> {
    /// Handle to the store the resolver belongs to.
    pub store: StoreHandle<S>,
    /// The shared REST client.
    pub rest: RestClient,
    /// The whole registry, for resolvers that read other stores.
    pub registry: Registry,
    /// Arguments this resolution was requested with.
    pub args: Value,
}

impl<S: Store> fmt::Debug for ResolverCtx<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverCtx")
            .field("store", &S::NAME)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}
