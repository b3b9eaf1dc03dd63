//! Finite State Machine for canary rollouts

use serde::{Deserialize, Serialize};

/// Rollout status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Canary instance being deployed
    Initializing,

    /// Traffic shifting, thresholds evaluated every tick
    Progressing,

    /// Metrics sampled but not acted upon
    Paused,

    /// Target share reached, waiting for an explicit promote
    Promoting,

    /// Canary image now serves as stable
    Promoted,

    /// Canary being torn down
    RollingBack,

    /// Canary removed, all traffic on stable
    RolledBack,

    /// Unrecoverable operational error
    Failed,
}

impl RolloutStatus {
    /// Terminal states stop the analysis loop
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutStatus::Promoted | RolloutStatus::RolledBack | RolloutStatus::Failed
        )
    }

    /// States in which ticks collect metrics
    pub fn is_analyzing(&self) -> bool {
        matches!(self, RolloutStatus::Progressing | RolloutStatus::Paused)
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutStatus::Initializing => "initializing",
            RolloutStatus::Progressing => "progressing",
            RolloutStatus::Paused => "paused",
            RolloutStatus::Promoting => "promoting",
            RolloutStatus::Promoted => "promoted",
            RolloutStatus::RollingBack => "rolling_back",
            RolloutStatus::RolledBack => "rolled_back",
            RolloutStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Rollout event
#[derive(Debug, Clone)]
pub enum RolloutEvent {
    /// Canary instance running and initial split applied
    Initialized,

    /// Operator pause, or threshold breach with auto-rollback disabled
    Pause,

    /// Operator resume
    Resume,

    /// Current share reached the target
    TargetReached,

    /// Operator promote requested before the target was reached
    BeginPromotion,

    /// Stable image replaced and canary removed
    Promoted,

    /// Threshold breach or operator rollback
    BeginRollback,

    /// Canary removed and split reset
    RolledBack,

    /// Operational error
    Fail(String),
}

/// Rollout FSM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutFsm {
    status: RolloutStatus,
    error: Option<String>,
}

impl RolloutFsm {
    /// Create a new FSM in initializing state
    pub fn new() -> Self {
        Self {
            status: RolloutStatus::Initializing,
            error: None,
        }
    }

    /// Resume from a persisted status
    pub fn restore(status: RolloutStatus, error: Option<String>) -> Self {
        Self { status, error }
    }

    pub fn status(&self) -> RolloutStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: RolloutEvent) -> Result<RolloutStatus, String> {
        use RolloutEvent as E;
        use RolloutStatus as S;

        let new_status = match (self.status, &event) {
            // From Initializing
            (S::Initializing, E::Initialized) => S::Progressing,

            // Progressing <-> Paused
            (S::Progressing, E::Pause) => S::Paused,
            (S::Paused, E::Resume) => S::Progressing,

            // Towards promotion
            (S::Progressing, E::TargetReached) => S::Promoting,
            (S::Progressing | S::Paused, E::BeginPromotion) => S::Promoting,
            (S::Promoting, E::Promoted) => S::Promoted,

            // Rollback
            (S::Progressing | S::Paused | S::Promoting, E::BeginRollback) => S::RollingBack,
            (S::RollingBack, E::RolledBack) => S::RolledBack,

            // Any live state can fail
            (status, E::Fail(err)) if !status.is_terminal() => {
                self.error = Some(err.clone());
                S::Failed
            }

            // Invalid transitions
            (status, event) => {
                return Err(format!("Invalid transition: {} -> {:?}", status, event));
            }
        };

        self.status = new_status;
        Ok(new_status)
    }
}

impl Default for RolloutFsm {
    fn default() -> Self {
        Self::new()
    }
}
