//! Server state

use std::sync::Arc;

use secrecy::SecretString;

use crate::app::options::AuthOptions;
use crate::app::state::AppState;
use crate::authn::signature::{self, copy_secret};
use crate::errors::AgentError;

/// Server state shared across handlers
pub struct ServerState {
    pub app: Arc<AppState>,
    webhook_secret: Option<SecretString>,
    webhook_require_secret: bool,
    api_secret: Option<SecretString>,
}

impl ServerState {
    pub fn new(app: Arc<AppState>, auth: &AuthOptions) -> Self {
        Self {
            app,
            webhook_secret: auth.webhook_secret.as_ref().map(copy_secret),
            webhook_require_secret: auth.webhook_require_secret,
            api_secret: auth.api_secret.as_ref().map(copy_secret),
        }
    }

    /// Verify a webhook delivery. Without a configured secret deliveries are
    /// accepted unless secrets are required.
    pub fn verify_webhook(&self, body: &[u8], signature_header: Option<&str>) -> Result<(), AgentError> {
        match &self.webhook_secret {
            Some(secret) => signature::verify(secret, body, signature_header),
            None if self.webhook_require_secret => Err(AgentError::AuthError(
                "webhook secret required but not configured".to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Check the caller's secret for a mutating call, when one is configured
    pub fn authorize(&self, supplied: Option<&str>) -> Result<(), AgentError> {
        match &self.api_secret {
            Some(secret) => signature::check_secret(secret, supplied),
            None => Ok(()),
        }
    }
}
