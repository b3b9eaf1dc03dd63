//! Canary metric samples

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Traffic and pod health observed for one side (canary or stable)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideMetrics {
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub healthy_pods: u32,
    pub total_pods: u32,
}

impl SideMetrics {
    /// Error rate in percent, 0 when no requests were served
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.errors as f64 / self.requests as f64 * 100.0
    }
}

/// Metrics for one side with the derived error rate, as stored on a rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideSample {
    #[serde(flatten)]
    pub metrics: SideMetrics,
    pub error_rate: f64,
}

impl From<SideMetrics> for SideSample {
    fn from(metrics: SideMetrics) -> Self {
        let error_rate = metrics.error_rate();
        Self {
            metrics,
            error_rate,
        }
    }
}

/// One observation cycle of a rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub canary: SideSample,
    pub stable: SideSample,
}

impl MetricSample {
    pub fn new(canary: SideMetrics, stable: SideMetrics) -> Self {
        Self::at(Utc::now(), canary, stable)
    }

    pub fn at(timestamp: DateTime<Utc>, canary: SideMetrics, stable: SideMetrics) -> Self {
        Self {
            timestamp,
            canary: canary.into(),
            stable: stable.into(),
        }
    }
}
