//! In-memory agent state and its JSON snapshot

use std::collections::VecDeque;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::canary::rollout::CanaryRollout;
use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::models::deployment::Deployment;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Contents of `state.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub last_revision: Option<String>,

    /// Oldest first
    #[serde(default)]
    pub deployment_history: Vec<Deployment>,

    #[serde(default)]
    pub canary_rollouts: Vec<CanaryRollout>,
}

/// Bounded deployment history; the oldest entry is evicted first
#[derive(Debug, Clone)]
pub struct DeploymentHistory {
    capacity: usize,
    entries: VecDeque<Deployment>,
}

impl DeploymentHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, deployment: Deployment) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(deployment);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent first
    pub fn recent(&self, limit: usize) -> Vec<Deployment> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn last(&self) -> Option<&Deployment> {
        self.entries.back()
    }

    fn oldest_first(&self) -> Vec<Deployment> {
        self.entries.iter().cloned().collect()
    }
}

struct Inner {
    last_revision: Option<String>,
    history: DeploymentHistory,
    current: Option<Deployment>,
    consecutive_failures: u32,
}

/// Revision, history and failure counter shared by the orchestrator, the HTTP
/// API and the persister
pub struct StateStore {
    file: File,
    inner: RwLock<Inner>,
}

impl StateStore {
    pub fn new(file: File, history_capacity: usize) -> Self {
        Self {
            file,
            inner: RwLock::new(Inner {
                last_revision: None,
                history: DeploymentHistory::new(history_capacity),
                current: None,
                consecutive_failures: 0,
            }),
        }
    }

    /// Load `state.json` if present and return the persisted rollouts. A
    /// corrupt file is logged and ignored.
    pub async fn load(&self) -> Result<Vec<CanaryRollout>, AgentError> {
        if !self.file.exists().await {
            debug!("No state file at {}", self.file.path().display());
            return Ok(Vec::new());
        }

        let persisted: PersistedState = match self.file.read_json().await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(
                    "Ignoring unreadable state file {}: {}",
                    self.file.path().display(),
                    e
                );
                return Ok(Vec::new());
            }
        };

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.last_revision = persisted.last_revision;
        for deployment in persisted.deployment_history {
            inner.history.push(deployment);
        }
        info!(
            "Loaded state: revision {:?}, {} deployment(s), {} rollout(s)",
            inner.last_revision,
            inner.history.len(),
            persisted.canary_rollouts.len()
        );
        Ok(persisted.canary_rollouts)
    }

    pub fn last_revision(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_revision
            .clone()
    }

    pub fn set_last_revision(&self, revision: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .last_revision = Some(revision.to_string());
    }

    /// Deployment currently running, if any
    pub fn current(&self) -> Option<Deployment> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .clone()
    }

    /// Publish the progress of the running deployment
    pub fn set_current(&self, deployment: &Deployment) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).current = Some(deployment.clone());
    }

    /// Move a finished deployment from current into history
    pub fn record(&self, deployment: Deployment) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.current.as_ref().map(|d| d.id) == Some(deployment.id) {
            inner.current = None;
        }
        inner.history.push(deployment);
    }

    /// Most recent first
    pub fn history(&self, limit: usize) -> Vec<Deployment> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .recent(limit)
    }

    pub fn last_deployment(&self) -> Option<Deployment> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .last()
            .cloned()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }

    /// Count a failed deployment, returning the new streak
    pub fn record_failure(&self) -> u32 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        inner.consecutive_failures
    }

    pub fn reset_failures(&self) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures = 0;
    }

    pub fn snapshot(&self, canary_rollouts: Vec<CanaryRollout>) -> PersistedState {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        PersistedState {
            last_revision: inner.last_revision.clone(),
            deployment_history: inner.history.oldest_first(),
            canary_rollouts,
        }
    }

    /// Write the snapshot to disk
    pub async fn save(&self, canary_rollouts: Vec<CanaryRollout>) -> Result<(), AgentError> {
        let state = self.snapshot(canary_rollouts);
        self.file.write_json_atomic(&state).await?;
        debug!("State saved to {}", self.file.path().display());
        Ok(())
    }
}
