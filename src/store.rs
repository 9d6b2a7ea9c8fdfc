//! Store definitions: state types, reducers, and resolvers.
//!
//! A store is declared by implementing the [`Store`] trait on its state type
//! and describing its behaviour with a [`StoreDefinition`]. Definitions are
//! built from [`StorePart`]s so that independent features can each contribute
//! initial state, extra reducers, and resolvers to the same store, mirroring
//! how a dashboard assembles one settings store from several fragments.
//!
//! Definitions are passed to
//! [`RegistryBuilder::register`](crate::registry::RegistryBuilder::register);
//! the registry owns the live state and runs the reducers and resolvers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::registry::ResolverCtx;
use crate::rest::RestError;

/// Boxed future used by type-erased async callbacks.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// State type of a registered store.
///
/// The state must round-trip through JSON because initial states from
/// multiple [`StorePart`]s are merged as JSON objects before the typed state
/// is constructed.
///
/// # Examples
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use statekit::Store;
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Prefs {
///     dark_mode: bool,
/// }
///
/// enum PrefsAction {
///     ToggleDarkMode,
/// }
///
/// impl Store for Prefs {
///     const NAME: &'static str = "core/user/prefs";
///     type Action = PrefsAction;
///
///     fn reduce(mut state: Self, action: &Self::Action) -> Self {
///         match action {
///             PrefsAction::ToggleDarkMode => state.dark_mode = !state.dark_mode,
///         }
///         state
///     }
/// }
/// ```
pub trait Store:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Registry-wide unique store name, e.g. `"modules/analytics/settings"`.
    const NAME: &'static str;

    /// Actions understood by this store's reducers.
    type Action: Send + 'static;

    /// Base reducer: fold `action` into `state`.
    ///
    /// Takes the state by value and returns the next state; the registry
    /// never exposes `&mut` state to reducers.
    fn reduce(state: Self, action: &Self::Action) -> Self;
}

/// Additional reducer contributed by a [`StorePart`].
///
/// Plain function pointers keep parts copyable and comparable in tests;
/// reducers needing captured state belong in a resolver or handle instead.
pub type ReducerFn<S> = fn(S, &<S as Store>::Action) -> S;

/// Named async routine that fetches data for a store exactly once.
///
/// Resolvers receive a [`ResolverCtx`] with the owning store's handle, the
/// shared REST client, and the registry. The registry guarantees at-most-once
/// execution per distinct argument set; see
/// [`StoreHandle::resolve`](crate::registry::StoreHandle::resolve).
pub struct Resolver<S: Store> {
    run: Arc<dyn Fn(ResolverCtx<S>) -> BoxFuture<'static, Result<(), RestError>> + Send + Sync>,
}

impl<S: Store> Resolver<S> {
    /// Wrap an async closure as a resolver.
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(ResolverCtx<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RestError>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |ctx| Box::pin(run(ctx))),
        }
    }

    pub(crate) fn call(&self, ctx: ResolverCtx<S>) -> BoxFuture<'static, Result<(), RestError>> {
        (self.run)(ctx)
    }
}

impl<S: Store> Clone for Resolver<S> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<S: Store> fmt::Debug for Resolver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

/// One feature's contribution to a store: an initial-state fragment, extra
/// reducers, and named resolvers.
pub struct StorePart<S: Store> {
    initial: serde_json::Map<String, Value>,
    reducers: Vec<ReducerFn<S>>,
    resolvers: Vec<(&'static str, Resolver<S>)>,
}

impl<S: Store> StorePart<S> {
    pub fn new() -> Self {
        Self {
            initial: serde_json::Map::new(),
            reducers: Vec::new(),
            resolvers: Vec::new(),
        }
    }

    /// Contribute an initial-state fragment.
    ///
    /// The fragment is shallow-merged over the state built so far when the
    /// parts are combined.
    ///
    /// # Panics
    ///
    /// Panics if `state` is not a JSON object.
    pub fn initial_state(mut self, state: Value) -> Self {
        match state {
            Value::Object(map) => {
                self.initial = map;
                self
            }
            other => panic!(
                "initial state for store '{}' must be a JSON object, got {other}",
                S::NAME
            ),
        }
    }

    /// Contribute a reducer, run after the base [`Store::reduce`] and any
    /// reducers from earlier parts.
    pub fn reducer(mut self, reducer: ReducerFn<S>) -> Self {
        self.reducers.push(reducer);
        self
    }

    /// Contribute a named resolver.
    pub fn resolver(mut self, name: &'static str, resolver: Resolver<S>) -> Self {
        self.resolvers.push((name, resolver));
        self
    }
}

impl<S: Store> Default for StorePart<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Store> fmt::Debug for StorePart<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorePart")
            .field("reducers", &self.reducers.len())
            .field(
                "resolvers",
                &self.resolvers.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Complete description of a store, ready for registration.
pub struct StoreDefinition<S: Store> {
    pub(crate) initial: S,
    pub(crate) reducers: Vec<ReducerFn<S>>,
    pub(crate) resolvers: HashMap<&'static str, Resolver<S>>,
}

impl<S: Store> StoreDefinition<S> {
    /// Definition with the default initial state and only the base reducer.
    pub fn new() -> Self {
        Self::combine(Vec::new())
    }

    /// Combine several parts into one definition.
    ///
    /// The initial state starts from `S::default()` serialized to JSON; each
    /// part's fragment is then shallow-merged over it in registration order,
    /// so a later part silently wins when two parts set the same top-level
    /// key (the override is logged at debug level). Resolver names are
    /// different: two parts registering the same resolver name is a
    /// programming error and panics.
    ///
    /// Reducers run in order: the base [`Store::reduce`] first, then each
    /// part's reducers in the order the parts were given.
    ///
    /// # Panics
    ///
    /// Panics if `S::default()` does not serialize to a JSON object, if the
    /// merged object no longer deserializes into `S`, or if two parts
    /// register a resolver under the same name.
    pub fn combine(parts: Vec<StorePart<S>>) -> Self {
        let mut initial = match serde_json::to_value(S::default()) {
            Ok(Value::Object(map)) => map,
            Ok(_) => panic!("store '{}' state must serialize to a JSON object", S::NAME),
            Err(e) => panic!("store '{}' default state failed to serialize: {e}", S::NAME),
        };
        let mut reducers: Vec<ReducerFn<S>> = vec![S::reduce];
        let mut resolvers: HashMap<&'static str, Resolver<S>> = HashMap::new();

        for part in parts {
            for (key, value) in part.initial {
                if initial.insert(key.clone(), value).is_some() {
                    tracing::debug!(
                        store = S::NAME,
                        key = %key,
                        "initial state key overridden by a later part"
                    );
                }
            }
            reducers.extend(part.reducers);
            for (name, resolver) in part.resolvers {
                if resolvers.insert(name, resolver).is_some() {
                    panic!(
                        "duplicate resolver '{name}' registered for store '{}'",
                        S::NAME
                    );
                }
            }
        }

        let initial: S = serde_json::from_value(Value::Object(initial)).unwrap_or_else(|e| {
            panic!("combined initial state for store '{}' is invalid: {e}", S::NAME)
        });

        Self {
            initial,
            reducers,
            resolvers,
        }
    }

    /// Fold `action` through every reducer in order.
    pub(crate) fn apply(&self, state: S, action: &S::Action) -> S {
        self.reducers
            .iter()
            .fold(state, |state, reducer| reducer(state, action))
    }
}

impl<S: Store> Default for StoreDefinition<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Store> fmt::Debug for StoreDefinition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut resolvers: Vec<&str> = self.resolvers.keys().copied().collect();
        resolvers.sort_unstable();
        f.debug_struct("StoreDefinition")
            .field("store", &S::NAME)
            .field("reducers", &self.reducers.len())
            .field("resolvers", &resolvers)
            .finish()
    }
}
