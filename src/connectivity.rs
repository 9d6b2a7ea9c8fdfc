//! Background internet-connectivity monitor.
//!
//! A spawned task probes a health datapoint on a fixed interval and
//! publishes the verdict through a watch channel, so interested parties see
//! transitions without polling. Probes bypass both the request cache and any
//! preloaded data by carrying a `timestamp` argument; a stale "online" from
//! page-load time would defeat the point.
//!
//! There is no in-flight cancellation: a shutdown requested mid-probe takes
//! effect once that probe settles.

use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::Registry;
use crate::rest::{Datapoint, GetOptions};

/// Datapoint probed to decide whether the network is reachable.
pub const HEALTH_CHECK: Datapoint = Datapoint::new("core/site", "health-check");

/// Probe cadence and assumed start state.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between probes. The first probe fires immediately on spawn.
    pub interval: Duration,
    /// Verdict reported before the first probe settles.
    pub assume_online: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            assume_online: true,
        }
    }
}

/// Handle to the spawned monitor task.
///
/// Dropping the handle does not stop the task; call [`shutdown`] to end it.
///
/// [`shutdown`]: ConnectivityMonitor::shutdown
#[derive(Debug)]
pub struct ConnectivityMonitor {
    online: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    /// Spawns the probe loop on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn spawn(registry: Registry, config: MonitorConfig) -> Self {
        let (online_tx, online_rx) = watch::channel(config.assume_online);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                let online = probe(&registry).await;
                if online != *online_tx.borrow() {
                    tracing::info!(online, "connectivity changed");
                    let _ = online_tx.send(online);
                }
            }
        });

        Self {
            online: online_rx,
            shutdown: shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Latest probe verdict, or the assumed start state before the first one.
    pub fn online(&self) -> bool {
        *self.online.borrow()
    }

    /// Watch receiver notified on every online/offline transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.clone()
    }

    /// Stops the probe loop and waits for the task to finish.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn probe(registry: &Registry) -> bool {
    let timestamp = registry.clock().now();
    let result = registry
        .rest()
        .get(
            HEALTH_CHECK,
            json!({ "timestamp": timestamp }),
            GetOptions::uncached(),
        )
        .await;
    match result {
        Ok(_) => true,
        Err(error) => {
            tracing::debug!(code = %error.code, "connectivity probe failed");
            false
        }
    }
}
