//! Client-side data stores with resolver-driven fetching, request caching,
//! and settings lifecycles for REST-backed dashboards.

mod canon;

pub mod analytics;
pub mod analytics4;
pub mod cache;
pub mod connectivity;
pub mod connector;
pub mod dismissal;
pub mod error;
pub mod preload;
pub mod registry;
pub mod rest;
pub mod settings;
pub mod setup_flow;
pub mod store;
pub mod submit;

pub use cache::{
    CacheBackend, CacheHit, CacheItemOptions, Clock, FileBackend, MemoryBackend, RequestCache,
    SystemClock,
};
pub use connectivity::{ConnectivityMonitor, MonitorConfig};
pub use connector::{Connector, HttpConnector};
pub use error::{SubmitError, ValidationError};
pub use preload::PreloadingConnector;
pub use registry::{Registry, RegistryBuilder, ResolverCtx, StoreHandle};
pub use rest::{Datapoint, GetOptions, Method, RestClient, RestError, RestRequest};
pub use settings::{Settings, SettingsHandle, SettingsModule, SettingsState};
pub use setup_flow::SetupFlowMode;
pub use store::{ReducerFn, Resolver, Store, StoreDefinition, StorePart};
pub use submit::{SubmitPipeline, SubmitStep};
