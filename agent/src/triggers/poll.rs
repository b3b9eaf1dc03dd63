//! Remote head polling

use std::sync::Arc;

use tracing::{debug, info};

use crate::deploy::git::{short, GitRepo};
use crate::deploy::{DeployRequest, Orchestrator, TriggerOutcome};
use crate::errors::AgentError;
use crate::models::deployment::TriggerSource;

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A deployment was already running
    Busy,

    /// Local checkout matches the remote head
    UpToDate,

    /// Remote moved ahead and a deployment started
    Triggered { id: u64, remote: String },
}

/// Compare the remote branch head with the checkout and deploy on mismatch
pub async fn check_once(git: &GitRepo, orchestrator: &Arc<Orchestrator>) -> Result<PollOutcome, AgentError> {
    if orchestrator.is_deploying() {
        debug!("Deployment running, skipping poll");
        return Ok(PollOutcome::Busy);
    }

    let remote = git.remote_revision().await?;
    let local = git.current_revision().await?;
    if remote == local {
        debug!("Up to date at {}", short(&local));
        return Ok(PollOutcome::UpToDate);
    }

    info!(
        "origin/{} moved from {} to {}",
        git.branch(),
        short(&local),
        short(&remote)
    );
    match orchestrator.trigger(DeployRequest::new(TriggerSource::Poll)) {
        Ok(TriggerOutcome::Started { id }) => Ok(PollOutcome::Triggered { id, remote }),
        // Lost the race against another trigger
        Ok(TriggerOutcome::Queued) | Err(AgentError::DeploymentInProgress) => Ok(PollOutcome::Busy),
        Err(e) => Err(e),
    }
}
