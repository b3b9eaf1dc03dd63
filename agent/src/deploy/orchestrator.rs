//! Deployment orchestration: pull, build, restart, health, rollback
//!
//! All triggers funnel into [`Orchestrator::trigger`]. A gate admits exactly one
//! deployment at a time; a forced manual request that arrives while one is
//! running is queued and executed by the same task once the current deployment
//! finishes, before the gate opens again.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::deploy::docker::ComposeStack;
use crate::deploy::git::{short, GitRepo};
use crate::deploy::health::{wait_healthy, HealthProbe, HealthSettings};
use crate::deploy::rollback::RollbackController;
use crate::errors::AgentError;
use crate::models::deployment::{Deployment, DeploymentStatus, PhaseName, TriggerSource};
use crate::notify::{Dispatcher, Severity};
use crate::storage::state::StateStore;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Roll back to the previous revision when a deployment fails
    pub rollback_enabled: bool,

    /// Consecutive failures before operators are asked to intervene
    pub max_retries: u32,

    /// Health check settings for deployments and rollbacks
    pub health: HealthSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rollback_enabled: true,
            max_retries: 3,
            health: HealthSettings::default(),
        }
    }
}

/// A request to deploy the head of the tracked branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployRequest {
    pub trigger: TriggerSource,

    /// Queue behind a running deployment instead of being rejected
    pub force: bool,

    /// Do not roll back on failure
    pub skip_rollback: bool,
}

impl DeployRequest {
    pub fn new(trigger: TriggerSource) -> Self {
        Self {
            trigger,
            force: false,
            skip_rollback: false,
        }
    }
}

/// Result of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The deployment started with this id
    Started { id: u64 },

    /// A deployment is running; this one runs right after it
    Queued,
}

#[derive(Debug, Clone)]
enum Job {
    Deploy { request: DeployRequest, queued: bool },
    Rollback { revision: String },
}

#[derive(Default)]
struct Gate {
    running: bool,
    queued: Option<DeployRequest>,
}

/// Runs deployments one at a time
pub struct Orchestrator {
    settings: Settings,
    git: GitRepo,
    stack: ComposeStack,
    probe: Arc<dyn HealthProbe>,
    rollback: RollbackController,
    store: Arc<StateStore>,
    dispatcher: Arc<Dispatcher>,
    gate: Mutex<Gate>,
    busy: watch::Sender<bool>,
    last_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        git: GitRepo,
        stack: ComposeStack,
        probe: Arc<dyn HealthProbe>,
        store: Arc<StateStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let rollback = RollbackController::new(
            git.clone(),
            stack.clone(),
            probe.clone(),
            settings.health.clone(),
            dispatcher.clone(),
        );
        let (busy, _) = watch::channel(false);
        let last_id = store.last_deployment().map(|d| d.id).unwrap_or(0);

        Arc::new(Self {
            settings,
            git,
            stack,
            probe,
            rollback,
            store,
            dispatcher,
            gate: Mutex::new(Gate::default()),
            busy,
            last_id: AtomicU64::new(last_id),
        })
    }

    /// Millisecond timestamp, strictly greater than any id handed out before
    fn next_id(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let previous = self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    pub fn is_deploying(&self) -> bool {
        self.gate.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    /// Wait until no deployment is running or queued
    pub async fn wait_idle(&self) {
        let mut busy = self.busy.subscribe();
        // The sender lives as long as self
        let _ = busy.wait_for(|running| !*running).await;
    }

    /// Close the gate, or fail when a deployment is running
    fn acquire(&self, request: Option<DeployRequest>) -> Result<bool, AgentError> {
        let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if gate.running {
            return match request {
                Some(request) if request.force => {
                    if gate.queued.replace(request).is_some() {
                        debug!("Replacing previously queued forced deployment");
                    }
                    Ok(false)
                }
                _ => Err(AgentError::DeploymentInProgress),
            };
        }
        gate.running = true;
        self.busy.send_replace(true);
        Ok(true)
    }

    /// Start a deployment of the tracked branch
    pub fn trigger(self: &Arc<Self>, request: DeployRequest) -> Result<TriggerOutcome, AgentError> {
        if !self.acquire(Some(request))? {
            info!(trigger = %request.trigger, "Deployment in progress, forced request queued");
            return Ok(TriggerOutcome::Queued);
        }

        let id = self.next_id();
        info!(id, trigger = %request.trigger, "Deployment triggered");
        let this = self.clone();
        tokio::spawn(async move {
            this.drain(
                Job::Deploy {
                    request,
                    queued: false,
                },
                id,
            )
            .await
        });
        Ok(TriggerOutcome::Started { id })
    }

    /// Start a manual rollback to `revision` under the deployment gate
    pub fn rollback_to(self: &Arc<Self>, revision: &str) -> Result<u64, AgentError> {
        self.acquire(None)?;

        let id = self.next_id();
        info!(id, "Manual rollback to {} triggered", short(revision));
        let this = self.clone();
        let job = Job::Rollback {
            revision: revision.to_string(),
        };
        tokio::spawn(async move { this.drain(job, id).await });
        Ok(id)
    }

    /// Run `first`, then whatever was queued meanwhile, then open the gate
    async fn drain(&self, first: Job, id: u64) {
        let mut next = Some((first, id));

        while let Some((job, id)) = next.take() {
            match job {
                Job::Deploy { request, queued } => {
                    self.deploy(id, request, queued).await;
                }
                Job::Rollback { revision } => {
                    self.manual_rollback(id, &revision).await;
                }
            }

            let queued = {
                let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
                let queued = gate.queued.take();
                if queued.is_none() {
                    gate.running = false;
                    self.busy.send_replace(false);
                }
                queued
            };

            next = queued.map(|request| {
                let id = self.next_id();
                info!(id, "Starting queued forced deployment");
                (
                    Job::Deploy {
                        request,
                        queued: true,
                    },
                    id,
                )
            });
        }
    }

    /// Revision running before this attempt
    async fn previous_revision(&self) -> Option<String> {
        match self.git.current_revision().await {
            Ok(revision) => Some(revision),
            Err(e) => {
                warn!("Could not read current revision: {}", e);
                self.store.last_revision()
            }
        }
    }

    /// Run one phase, recording its outcome on the deployment
    async fn phase<T>(
        &self,
        deployment: &mut Deployment,
        name: PhaseName,
        work: impl Future<Output = Result<T, AgentError>>,
    ) -> Result<T, AgentError> {
        deployment.begin_phase(name);
        self.store.set_current(deployment);
        debug!(id = deployment.id, phase = %name, "Phase started");

        let result = work.await;
        match &result {
            Ok(_) => deployment.complete_phase(),
            Err(e) => {
                error!(id = deployment.id, phase = %name, "Phase failed: {}", e);
                deployment.fail_phase(&format!("{} failed: {}", name, e));
            }
        }
        self.store.set_current(deployment);
        result
    }

    async fn run_phases(&self, deployment: &mut Deployment) -> Result<(), AgentError> {
        let revision = self.phase(deployment, PhaseName::Pull, self.git.pull()).await?;
        deployment.new_revision = Some(revision);

        self.phase(deployment, PhaseName::Build, self.stack.build()).await?;
        self.phase(deployment, PhaseName::Restart, self.stack.restart())
            .await?;
        self.phase(
            deployment,
            PhaseName::Health,
            wait_healthy(self.probe.as_ref(), &self.settings.health),
        )
        .await
    }

    async fn deploy(&self, id: u64, request: DeployRequest, queued: bool) -> Deployment {
        let mut deployment = Deployment::new(id, request.trigger);
        deployment.forced = queued;
        deployment.previous_revision = self.previous_revision().await;
        self.store.set_current(&deployment);

        self.dispatcher.notify(
            Severity::Info,
            "Deployment started",
            format!(
                "Deployment {} ({}) from {}",
                id,
                request.trigger,
                deployment
                    .previous_revision
                    .as_deref()
                    .map(short)
                    .unwrap_or("unknown revision")
            ),
        );

        match self.run_phases(&mut deployment).await {
            Ok(()) => {
                deployment.finish(DeploymentStatus::Success);
                let revision = deployment.new_revision.clone().unwrap_or_default();
                self.store.set_last_revision(&revision);
                self.store.reset_failures();
                info!(id, "Deployment succeeded at {}", short(&revision));
                self.dispatcher.notify(
                    Severity::Success,
                    "Deployment succeeded",
                    format!(
                        "Deployment {} is running {} ({} ms)",
                        id,
                        short(&revision),
                        deployment.duration_ms.unwrap_or_default()
                    ),
                );
            }
            Err(e) => self.handle_failure(&mut deployment, request, &e).await,
        }

        self.store.record(deployment.clone());
        deployment
    }

    async fn handle_failure(&self, deployment: &mut Deployment, request: DeployRequest, err: &AgentError) {
        let failures = self.store.record_failure();
        warn!(id = deployment.id, failures, "Deployment failed: {}", err);
        self.dispatcher.notify(
            Severity::Error,
            "Deployment failed",
            format!(
                "Deployment {}: {}",
                deployment.id,
                deployment.error.as_deref().unwrap_or("unknown error")
            ),
        );
        if failures >= self.settings.max_retries {
            self.dispatcher.notify(
                Severity::Critical,
                "Manual intervention required",
                format!("{} consecutive deployments failed", failures),
            );
        }

        let target = match (&deployment.previous_revision, request.skip_rollback) {
            _ if !self.settings.rollback_enabled => {
                debug!("Rollback disabled");
                None
            }
            (_, true) => {
                info!(id = deployment.id, "Rollback skipped on request");
                None
            }
            (None, _) => {
                warn!(id = deployment.id, "No previous revision known, cannot roll back");
                None
            }
            (Some(revision), false) => Some(revision.clone()),
        };

        if let Some(revision) = target {
            // The rollback error lands on its phase; the deployment keeps the original error
            let restored = self
                .phase(deployment, PhaseName::Rollback, self.rollback.rollback_to(&revision))
                .await;
            if restored.is_ok() {
                self.store.set_last_revision(&revision);
            }
        }

        deployment.finish(DeploymentStatus::Failed);
    }

    async fn manual_rollback(&self, id: u64, revision: &str) -> Deployment {
        let mut deployment = Deployment::new(id, TriggerSource::Manual);
        deployment.rollback_target = Some(revision.to_string());
        deployment.previous_revision = self.previous_revision().await;
        self.store.set_current(&deployment);

        let result = self
            .phase(&mut deployment, PhaseName::Rollback, self.rollback.rollback_to(revision))
            .await;

        match result {
            Ok(()) => {
                deployment.new_revision = Some(revision.to_string());
                deployment.finish(DeploymentStatus::Success);
                self.store.set_last_revision(revision);
            }
            Err(_) => deployment.finish(DeploymentStatus::Failed),
        }

        self.store.record(deployment.clone());
        deployment
    }
}
