//! Restoring a previously deployed revision

use std::sync::Arc;

use tracing::{error, info};

use crate::deploy::docker::ComposeStack;
use crate::deploy::git::{short, GitRepo};
use crate::deploy::health::{wait_healthy, HealthProbe, HealthSettings};
use crate::errors::AgentError;
use crate::notify::{Dispatcher, Severity};

/// Resets the checkout to a known revision and redeploys it
pub struct RollbackController {
    git: GitRepo,
    stack: ComposeStack,
    probe: Arc<dyn HealthProbe>,
    health: HealthSettings,
    dispatcher: Arc<Dispatcher>,
}

impl RollbackController {
    pub fn new(
        git: GitRepo,
        stack: ComposeStack,
        probe: Arc<dyn HealthProbe>,
        health: HealthSettings,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            git,
            stack,
            probe,
            health,
            dispatcher,
        }
    }

    /// `git reset --hard`, build, restart and wait for health. Any failure is
    /// terminal; there is no further recovery.
    pub async fn rollback_to(&self, revision: &str) -> Result<(), AgentError> {
        info!("Rolling back to {}", short(revision));

        match self.redeploy(revision).await {
            Ok(()) => {
                info!("Rolled back to {}", short(revision));
                self.dispatcher.notify(
                    Severity::Warning,
                    "Deployment rolled back",
                    format!("Running revision {} again", short(revision)),
                );
                Ok(())
            }
            Err(e) => {
                error!("Rollback to {} failed: {}", short(revision), e);
                self.dispatcher.notify(
                    Severity::Critical,
                    "Rollback failed",
                    format!(
                        "Could not restore revision {}: {}. Manual intervention required.",
                        short(revision),
                        e
                    ),
                );
                Err(e)
            }
        }
    }

    async fn redeploy(&self, revision: &str) -> Result<(), AgentError> {
        self.git.reset_hard(revision).await?;
        self.stack.build().await?;
        self.stack.restart().await?;
        wait_healthy(self.probe.as_ref(), &self.health).await
    }
}
