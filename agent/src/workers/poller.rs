//! Polling worker: deploys when the remote branch moves

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deploy::git::GitRepo;
use crate::deploy::Orchestrator;
use crate::triggers::poll::{check_once, PollOutcome};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Poller worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,

    /// Initial delay before first poll
    pub initial_delay: Duration,

    /// Backoff after failed remote lookups
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
            cooldown: CooldownOptions {
                base_delay: Duration::from_secs(5),
                ..CooldownOptions::default()
            },
        }
    }
}

/// Run the poller worker
pub async fn run<S, F>(
    options: &Options,
    git: &GitRepo,
    orchestrator: &Arc<Orchestrator>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(
        "Poller worker starting, checking origin/{} every {:?}",
        git.branch(),
        options.interval
    );

    let mut delay = options.initial_delay;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Poller worker shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }

        delay = match check_once(git, orchestrator).await {
            Ok(outcome) => {
                if let PollOutcome::Triggered { id, .. } = outcome {
                    debug!(id, "Poll started a deployment");
                }
                failures = 0;
                options.interval
            }
            Err(e) => {
                let backoff = calc_exp_backoff(&options.cooldown, failures).max(options.interval);
                failures = failures.saturating_add(1);
                warn!("Poll failed ({} in a row), retrying in {:?}: {}", failures, backoff, e);
                backoff
            }
        };
    }
}
