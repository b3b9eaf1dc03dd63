//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What started a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Webhook,
    Poll,
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerSource::Webhook => "webhook",
            TriggerSource::Poll => "poll",
            TriggerSource::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Overall deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Running,
    Success,
    Failed,
}

/// Deployment phase names, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Pull,
    Build,
    Restart,
    Health,
    Rollback,
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseName::Pull => "pull",
            PhaseName::Build => "build",
            PhaseName::Restart => "restart",
            PhaseName::Health => "health",
            PhaseName::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Phase status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Running,
    Completed,
    Failed,
}

/// One step of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub name: PhaseName,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One attempt to move the running system to a new revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Monotonic id derived from the creation time in milliseconds
    pub id: u64,
    pub trigger: TriggerSource,
    pub previous_revision: Option<String>,
    pub new_revision: Option<String>,
    pub status: DeploymentStatus,
    pub phases: Vec<Phase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,

    /// Requested with `force` while another deployment was running
    #[serde(default)]
    pub forced: bool,

    /// Target revision of a manual rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_target: Option<String>,
}

impl Deployment {
    pub fn new(id: u64, trigger: TriggerSource) -> Self {
        Self {
            id,
            trigger,
            previous_revision: None,
            new_revision: None,
            status: DeploymentStatus::Running,
            phases: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            error: None,
            forced: false,
            rollback_target: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == DeploymentStatus::Running
    }

    /// Phase currently executing, if any
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases
            .last()
            .filter(|p| p.status == PhaseStatus::Running)
    }

    pub fn phase(&self, name: PhaseName) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Start a new phase. Ignored once the deployment has finished.
    pub fn begin_phase(&mut self, name: PhaseName) {
        if !self.is_running() {
            return;
        }
        self.phases.push(Phase {
            name,
            status: PhaseStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });
    }

    /// Mark the running phase completed
    pub fn complete_phase(&mut self) {
        self.close_phase(PhaseStatus::Completed, None);
    }

    /// Mark the running phase failed and record the error on the deployment
    pub fn fail_phase(&mut self, error: &str) {
        if !self.is_running() {
            return;
        }
        self.close_phase(PhaseStatus::Failed, Some(error.to_string()));
        if self.error.is_none() {
            self.error = Some(error.to_string());
        }
    }

    fn close_phase(&mut self, status: PhaseStatus, error: Option<String>) {
        if !self.is_running() {
            return;
        }
        if let Some(phase) = self
            .phases
            .last_mut()
            .filter(|p| p.status == PhaseStatus::Running)
        {
            phase.status = status;
            phase.finished_at = Some(Utc::now());
            phase.error = error;
        }
    }

    /// Finish the deployment. Afterwards the record no longer changes.
    pub fn finish(&mut self, status: DeploymentStatus) {
        if !self.is_running() || status == DeploymentStatus::Running {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}
