//! Liveness probing of the deployed application

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::AgentError;

/// Health check settings
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Overall time allowed for the application to become healthy
    pub timeout: Duration,

    /// Delay between probes
    pub interval: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(2),
        }
    }
}

/// A single liveness probe
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns true when the application answered successfully
    async fn probe(&self) -> bool;
}

/// Probes an HTTP endpoint; any 2xx counts as healthy
pub struct HttpHealthProbe {
    client: Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: &str) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!("Health check {} returned {}", self.url, response.status());
                false
            }
            Err(e) => {
                debug!("Health check {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// Poll until the probe succeeds or the overall timeout elapses. A probe still
/// in flight at the deadline is abandoned and counts as unhealthy.
pub async fn wait_healthy(probe: &dyn HealthProbe, settings: &HealthSettings) -> Result<(), AgentError> {
    let deadline = Instant::now() + settings.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, probe.probe()).await {
            Ok(true) => {
                info!("Application healthy after {} probe(s)", attempts);
                return Ok(());
            }
            Ok(false) => {}
            Err(_) => {
                debug!("Health probe still pending at the deadline");
                break;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(settings.interval.min(deadline - now)).await;
    }

    warn!("Application not healthy after {} probe(s)", attempts);
    Err(AgentError::DeployError(format!(
        "health check did not pass within {:?}",
        settings.timeout
    )))
}
