//! Infrastructure behind a canary rollout: containers, traffic split, metrics

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::canary::metrics::SideMetrics;
use crate::deploy::docker::Containers;
use crate::errors::AgentError;

/// Which side of a rollout metrics are collected for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Canary,
    Stable,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Canary => f.write_str("canary"),
            Variant::Stable => f.write_str("stable"),
        }
    }
}

/// Operations a rollout needs from the container platform
#[async_trait]
pub trait CanaryBackend: Send + Sync {
    /// Start the canary instance of `app` from `image`
    async fn deploy_canary(&self, app: &str, rollout_id: &str, image: &str) -> Result<(), AgentError>;

    /// Tear the canary instance down; missing instances are not an error
    async fn remove_canary(&self, app: &str) -> Result<(), AgentError>;

    /// Route `canary_percent` of the traffic for `app` to the canary
    async fn set_traffic_split(&self, app: &str, canary_percent: u32) -> Result<(), AgentError>;

    /// Replace the stable instance of `app` with `image`
    async fn promote(&self, app: &str, image: &str) -> Result<(), AgentError>;

    /// Observe one side of the rollout
    async fn collect_metrics(&self, app: &str, variant: Variant) -> Result<SideMetrics, AgentError>;
}

/// Name of the canary container for an application
pub fn canary_container(app: &str) -> String {
    format!("{}-canary", app)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrafficSplit<'a> {
    app: &'a str,
    canary_percent: u32,
    stable_percent: u32,
}

/// Backend running canaries as sibling docker containers
pub struct DockerCanaryBackend {
    containers: Containers,
    client: Client,
    traffic_api_url: Option<String>,
    metrics_url: Option<String>,
}

impl DockerCanaryBackend {
    pub fn new(
        containers: Containers,
        traffic_api_url: Option<String>,
        metrics_url: Option<String>,
    ) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            containers,
            client,
            traffic_api_url: traffic_api_url.map(|u| u.trim_end_matches('/').to_string()),
            metrics_url: metrics_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }
}

#[async_trait]
impl CanaryBackend for DockerCanaryBackend {
    async fn deploy_canary(&self, app: &str, rollout_id: &str, image: &str) -> Result<(), AgentError> {
        let labels = [("pullagent.app", app), ("pullagent.rollout", rollout_id), ("pullagent.variant", "canary")];
        self.containers
            .run(&canary_container(app), image, &labels)
            .await
            .map_err(|e| AgentError::CanaryError(format!("deploy canary for {}: {}", app, e)))
    }

    async fn remove_canary(&self, app: &str) -> Result<(), AgentError> {
        self.containers.remove(&canary_container(app)).await
    }

    async fn set_traffic_split(&self, app: &str, canary_percent: u32) -> Result<(), AgentError> {
        let Some(base) = &self.traffic_api_url else {
            info!(app, canary_percent, "traffic split (no traffic API configured)");
            return Ok(());
        };

        let body = TrafficSplit {
            app,
            canary_percent,
            stable_percent: 100 - canary_percent.min(100),
        };
        let url = format!("{}/{}", base, app);
        let response = self.client.put(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::CanaryError(format!(
                "traffic API {} returned {}",
                url,
                response.status()
            )));
        }
        debug!(app, canary_percent, "traffic split applied");
        Ok(())
    }

    async fn promote(&self, app: &str, image: &str) -> Result<(), AgentError> {
        let labels = [("pullagent.app", app), ("pullagent.variant", "stable")];
        self.containers
            .run(app, image, &labels)
            .await
            .map_err(|e| AgentError::CanaryError(format!("promote {} to {}: {}", app, image, e)))
    }

    async fn collect_metrics(&self, app: &str, variant: Variant) -> Result<SideMetrics, AgentError> {
        let Some(base) = &self.metrics_url else {
            return Err(AgentError::CanaryError(
                "no metrics source configured (CANARY_METRICS_URL)".to_string(),
            ));
        };

        let url = format!("{}/{}/{}", base, app, variant);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::CanaryError(format!(
                "metrics source {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json::<SideMetrics>().await?)
    }
}
