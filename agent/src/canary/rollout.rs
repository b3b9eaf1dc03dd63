//! Canary rollout state and per-tick analysis

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::canary::config::RolloutConfig;
use crate::canary::fsm::{RolloutEvent, RolloutFsm, RolloutStatus};
use crate::canary::metrics::MetricSample;
use crate::errors::AgentError;

/// Samples retained per rollout
pub const MAX_SAMPLES: usize = 100;

/// Why a rollout was rolled back (or paused, when auto-rollback is off)
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackReason {
    ErrorRate { observed: f64, threshold: f64 },
    Latency { observed: f64, threshold: f64 },
    Manual(String),
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackReason::ErrorRate { observed, threshold } => write!(
                f,
                "error rate {:.2}% exceeds threshold {:.2}%",
                observed, threshold
            ),
            RollbackReason::Latency { observed, threshold } => write!(
                f,
                "average latency {:.0}ms exceeds threshold {:.0}ms",
                observed, threshold
            ),
            RollbackReason::Manual(reason) if reason.is_empty() => f.write_str("manual"),
            RollbackReason::Manual(reason) => write!(f, "manual: {}", reason),
        }
    }
}

/// Outcome of evaluating one sample
#[derive(Debug, Clone, PartialEq)]
pub enum TickDecision {
    /// Not analyzing in the current state, sample discarded
    Idle,
    /// Paused: sample recorded, no action
    Observed,
    /// Healthy, nothing due this tick
    Hold,
    /// Healthy and an increment is due; apply with [`CanaryRollout::apply_increment`]
    Advance { to: u32 },
    /// Threshold breached, rollout is now rolling back
    Rollback(RollbackReason),
    /// Threshold breached with auto-rollback disabled, rollout is now paused
    Breach(RollbackReason),
}

/// One progressive-delivery campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryRollout {
    pub id: String,
    pub config: RolloutConfig,
    pub current_percent: u32,
    pub status: RolloutStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_increment_at: DateTime<Utc>,
    pub rollback_reason: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: VecDeque<MetricSample>,
    #[serde(default)]
    pub consecutive_sample_failures: u32,
}

impl CanaryRollout {
    pub fn new(config: RolloutConfig) -> Self {
        let now = Utc::now();
        Self {
            id: config.id.clone(),
            config,
            current_percent: 0,
            status: RolloutStatus::Initializing,
            started_at: now,
            ended_at: None,
            last_increment_at: now,
            rollback_reason: None,
            error: None,
            metrics: VecDeque::new(),
            consecutive_sample_failures: 0,
        }
    }

    fn transition(&mut self, event: RolloutEvent) -> Result<RolloutStatus, AgentError> {
        let mut fsm = RolloutFsm::restore(self.status, self.error.clone());
        let status = fsm
            .process(event)
            .map_err(|e| AgentError::InvalidTransition(format!("rollout {}: {}", self.id, e)))?;
        self.status = status;
        self.error = fsm.error().map(str::to_string);
        if status.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        Ok(status)
    }

    /// Canary is running with the initial split
    pub fn mark_initialized(&mut self, now: DateTime<Utc>) -> Result<(), AgentError> {
        self.transition(RolloutEvent::Initialized)?;
        self.current_percent = self.config.initial_percent;
        self.last_increment_at = now;
        info!(
            rollout = %self.id,
            percent = self.current_percent,
            "canary progressing"
        );
        Ok(())
    }

    /// Most recent samples, newest last
    pub fn recent_samples(&self, limit: usize) -> Vec<MetricSample> {
        let skip = self.metrics.len().saturating_sub(limit);
        self.metrics.iter().skip(skip).cloned().collect()
    }

    fn record_sample(&mut self, sample: MetricSample) {
        if self.metrics.len() == MAX_SAMPLES {
            self.metrics.pop_front();
        }
        self.metrics.push_back(sample);
        self.consecutive_sample_failures = 0;
    }

    /// Count a failed metric collection, returning the current streak
    pub fn record_sample_failure(&mut self) -> u32 {
        self.consecutive_sample_failures += 1;
        self.consecutive_sample_failures
    }

    /// Share the next increment would move to
    pub fn next_percent(&self) -> u32 {
        (self.current_percent + self.config.increment_percent).min(self.config.target_percent)
    }

    /// An interval that does not fit a `TimeDelta` is never due
    fn increment_due(&self, now: DateTime<Utc>) -> bool {
        let interval = i64::try_from(self.config.increment_interval_minutes)
            .ok()
            .and_then(chrono::TimeDelta::try_minutes);
        match interval {
            Some(interval) => now - self.last_increment_at >= interval,
            None => false,
        }
    }

    /// Error rate is checked before latency; the first breach wins
    fn breach(&self, sample: &MetricSample) -> Option<RollbackReason> {
        let canary = &sample.canary;
        if canary.error_rate > self.config.error_rate_threshold {
            return Some(RollbackReason::ErrorRate {
                observed: canary.error_rate,
                threshold: self.config.error_rate_threshold,
            });
        }
        if canary.metrics.avg_latency_ms > self.config.latency_threshold_ms {
            return Some(RollbackReason::Latency {
                observed: canary.metrics.avg_latency_ms,
                threshold: self.config.latency_threshold_ms,
            });
        }
        None
    }

    /// Evaluate one tick's sample
    pub fn evaluate(&mut self, sample: MetricSample, now: DateTime<Utc>) -> TickDecision {
        if !self.status.is_analyzing() {
            return TickDecision::Idle;
        }

        let breach = self.breach(&sample);
        self.record_sample(sample);

        if self.status == RolloutStatus::Paused {
            return TickDecision::Observed;
        }

        if let Some(reason) = breach {
            if self.config.auto_rollback {
                warn!(rollout = %self.id, "{}, rolling back", reason);
                // Status is progressing here, so this transition cannot fail
                if self.begin_rollback(&reason).is_ok() {
                    return TickDecision::Rollback(reason);
                }
                return TickDecision::Idle;
            }
            warn!(rollout = %self.id, "{}, auto-rollback disabled, pausing", reason);
            if self.transition(RolloutEvent::Pause).is_ok() {
                return TickDecision::Breach(reason);
            }
            return TickDecision::Idle;
        }

        if self.current_percent < self.config.target_percent && self.increment_due(now) {
            return TickDecision::Advance {
                to: self.next_percent(),
            };
        }

        debug!(rollout = %self.id, percent = self.current_percent, "canary healthy, holding");
        TickDecision::Hold
    }

    /// Commit a traffic increase after the split was applied. Returns true when
    /// the target was reached and the rollout is now waiting for promotion.
    pub fn apply_increment(&mut self, to: u32, now: DateTime<Utc>) -> Result<bool, AgentError> {
        if self.status != RolloutStatus::Progressing {
            return Err(AgentError::InvalidTransition(format!(
                "rollout {} is {}, cannot progress",
                self.id, self.status
            )));
        }
        if to < self.current_percent || to > self.config.target_percent {
            return Err(AgentError::ValidationError(format!(
                "rollout {}: cannot move from {}% to {}% (target {}%)",
                self.id, self.current_percent, to, self.config.target_percent
            )));
        }

        self.current_percent = to;
        self.last_increment_at = now;
        info!(rollout = %self.id, percent = to, "canary traffic increased");

        if to == self.config.target_percent {
            self.transition(RolloutEvent::TargetReached)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn pause(&mut self) -> Result<(), AgentError> {
        self.transition(RolloutEvent::Pause)?;
        Ok(())
    }

    /// Resume without catching up on increments missed while paused
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), AgentError> {
        self.transition(RolloutEvent::Resume)?;
        self.last_increment_at = now;
        Ok(())
    }

    /// Enter rolling back; the canary share drops to 0 immediately
    pub fn begin_rollback(&mut self, reason: &RollbackReason) -> Result<(), AgentError> {
        self.transition(RolloutEvent::BeginRollback)?;
        self.current_percent = 0;
        self.rollback_reason = Some(reason.to_string());
        Ok(())
    }

    pub fn finish_rollback(&mut self) -> Result<(), AgentError> {
        self.transition(RolloutEvent::RolledBack)?;
        Ok(())
    }

    /// Enter promoting, from any state that allows it
    pub fn begin_promotion(&mut self) -> Result<(), AgentError> {
        if self.status != RolloutStatus::Promoting {
            self.transition(RolloutEvent::BeginPromotion)?;
        }
        Ok(())
    }

    /// The canary now serves as stable, so it no longer holds a share
    pub fn finish_promotion(&mut self) -> Result<(), AgentError> {
        self.transition(RolloutEvent::Promoted)?;
        self.current_percent = 0;
        Ok(())
    }

    pub fn fail(&mut self, error: &str) -> Result<(), AgentError> {
        self.transition(RolloutEvent::Fail(error.to_string()))?;
        Ok(())
    }
}
