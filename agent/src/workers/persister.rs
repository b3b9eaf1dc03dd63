//! Persister worker: snapshots agent state to disk

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::canary::CanaryController;
use crate::storage::state::StateStore;

/// Persister worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between snapshots
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Write the current state once; failures are logged
pub async fn snapshot(store: &StateStore, canary: &CanaryController) {
    if let Err(e) = store.save(canary.list()).await {
        error!("Failed to persist state: {}", e);
    }
}

/// Run the persister worker. The final snapshot on shutdown is taken by the
/// application state once deployments and rollout actors have stopped.
pub async fn run<S, F>(
    options: &Options,
    store: &Arc<StateStore>,
    canary: &Arc<CanaryController>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Persister worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Persister worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        snapshot(store, canary).await;
    }
}
