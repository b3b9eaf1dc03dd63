//! Push webhook classification

use serde::Deserialize;

use crate::errors::AgentError;

/// Fields of a push event payload the agent looks at
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Head revision after the push
    #[serde(default)]
    pub after: Option<String>,

    #[serde(default)]
    pub pusher: Option<Pusher>,

    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub id: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// What to do with a webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    /// `ping` event
    Pong,

    /// Push to the tracked branch
    Deploy {
        revision: Option<String>,
        pusher: Option<String>,
    },

    /// Accepted but nothing to do
    Ignore(String),
}

/// Decide what a delivery means for the tracked `branch`
pub fn classify(event: Option<&str>, body: &[u8], branch: &str) -> Result<WebhookAction, AgentError> {
    match event {
        Some("ping") => Ok(WebhookAction::Pong),
        Some("push") => {
            let payload: PushPayload = serde_json::from_slice(body)
                .map_err(|e| AgentError::ValidationError(format!("invalid push payload: {}", e)))?;

            let tracked = format!("refs/heads/{}", branch);
            if payload.git_ref != tracked {
                return Ok(WebhookAction::Ignore(format!(
                    "push to {} is not {}",
                    payload.git_ref, tracked
                )));
            }

            let revision = payload
                .head_commit
                .map(|c| c.id)
                .or(payload.after);
            Ok(WebhookAction::Deploy {
                revision,
                pusher: payload.pusher.and_then(|p| p.name),
            })
        }
        Some(other) => Ok(WebhookAction::Ignore(format!("event {} not handled", other))),
        None => Ok(WebhookAction::Ignore("no event type".to_string())),
    }
}
