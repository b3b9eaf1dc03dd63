//! Canary rollout configuration

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

/// Configuration of one progressive-delivery campaign.
///
/// Unknown fields are rejected; `id`, `app` and `canaryImage` are required and
/// everything else has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RolloutConfig {
    /// Rollout id, chosen by the caller
    pub id: String,

    /// Application (stable container name) the rollout applies to
    pub app: String,

    /// Image under test
    pub canary_image: String,

    /// Image currently serving, informational unless promotion fails
    #[serde(default)]
    pub stable_image: Option<String>,

    /// Canary traffic share right after start
    #[serde(default = "default_initial_percent")]
    pub initial_percent: u32,

    /// Canary share at which the rollout waits for promotion
    #[serde(default = "default_target_percent")]
    pub target_percent: u32,

    /// Traffic added per step
    #[serde(default = "default_increment_percent")]
    pub increment_percent: u32,

    /// Minimum time between two steps
    #[serde(default = "default_increment_interval_minutes")]
    pub increment_interval_minutes: u64,

    /// Canary error rate (percent) above which the rollout is rolled back
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Canary average latency (ms) above which the rollout is rolled back
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: f64,

    /// Roll back on threshold breach; when false the rollout pauses instead
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
}

fn default_initial_percent() -> u32 {
    10
}

fn default_target_percent() -> u32 {
    100
}

fn default_increment_percent() -> u32 {
    10
}

fn default_increment_interval_minutes() -> u64 {
    5
}

fn default_error_rate_threshold() -> f64 {
    5.0
}

fn default_latency_threshold_ms() -> f64 {
    1000.0
}

fn default_true() -> bool {
    true
}

/// Upper bound for `incrementIntervalMinutes`, one week
pub const MAX_INCREMENT_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Docker container name: `[A-Za-z0-9][A-Za-z0-9_.-]*`
fn is_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Docker image reference, `registry/name:tag` or `name@sha256:digest`
fn is_image_reference(image: &str) -> bool {
    let mut chars = image.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/' | ':' | '@'))
}

impl RolloutConfig {
    /// Build a config with defaults for everything but the required fields
    pub fn new(id: &str, app: &str, canary_image: &str) -> Self {
        Self {
            id: id.to_string(),
            app: app.to_string(),
            canary_image: canary_image.to_string(),
            stable_image: None,
            initial_percent: default_initial_percent(),
            target_percent: default_target_percent(),
            increment_percent: default_increment_percent(),
            increment_interval_minutes: default_increment_interval_minutes(),
            error_rate_threshold: default_error_rate_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
            auto_rollback: true,
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let invalid = |msg: String| Err(AgentError::ValidationError(msg));

        if self.id.trim().is_empty() {
            return invalid("id must not be empty".to_string());
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return invalid(format!("id {:?} may only contain [A-Za-z0-9._-]", self.id));
        }
        if self.app.trim().is_empty() {
            return invalid("app must not be empty".to_string());
        }
        if !is_container_name(&self.app) {
            return invalid(format!("app {:?} is not a valid container name", self.app));
        }
        if self.canary_image.trim().is_empty() {
            return invalid("canaryImage must not be empty".to_string());
        }
        if !is_image_reference(&self.canary_image) {
            return invalid(format!(
                "canaryImage {:?} is not a valid image reference",
                self.canary_image
            ));
        }
        if let Some(stable) = &self.stable_image {
            if !is_image_reference(stable) {
                return invalid(format!("stableImage {:?} is not a valid image reference", stable));
            }
        }
        if self.target_percent > 100 {
            return invalid(format!("targetPercent {} exceeds 100", self.target_percent));
        }
        if self.initial_percent > self.target_percent {
            return invalid(format!(
                "initialPercent {} exceeds targetPercent {}",
                self.initial_percent, self.target_percent
            ));
        }
        if self.increment_percent == 0 {
            return invalid("incrementPercent must be greater than 0".to_string());
        }
        if self.increment_interval_minutes > MAX_INCREMENT_INTERVAL_MINUTES {
            return invalid(format!(
                "incrementIntervalMinutes {} exceeds {}",
                self.increment_interval_minutes, MAX_INCREMENT_INTERVAL_MINUTES
            ));
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 100.0) {
            return invalid(format!(
                "errorRateThreshold {} must be in (0, 100]",
                self.error_rate_threshold
            ));
        }
        if !(self.latency_threshold_ms > 0.0 && self.latency_threshold_ms.is_finite()) {
            return invalid(format!(
                "latencyThresholdMs {} must be positive",
                self.latency_threshold_ms
            ));
        }
        Ok(())
    }
}
