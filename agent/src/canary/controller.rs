//! Canary controller: one actor task per rollout
//!
//! Each rollout is owned by its actor. Control operations are sent as commands
//! over the actor's mailbox, so they are serialized per rollout and run in
//! parallel across rollouts. Readers get the latest state from a `watch`
//! snapshot without waiting on the actor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::canary::backend::{CanaryBackend, Variant};
use crate::canary::config::RolloutConfig;
use crate::canary::fsm::RolloutStatus;
use crate::canary::metrics::MetricSample;
use crate::canary::rollout::{CanaryRollout, RollbackReason, TickDecision};
use crate::errors::AgentError;
use crate::notify::{Dispatcher, Severity};

/// Controller options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between two analysis ticks of a rollout
    pub analysis_interval: Duration,

    /// Consecutive failed metric collections before a rollout fails
    pub max_sample_failures: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            analysis_interval: Duration::from_secs(30),
            max_sample_failures: 5,
        }
    }
}

type Reply = oneshot::Sender<Result<CanaryRollout, AgentError>>;

enum Command {
    Analyze(Reply),
    Progress(Reply),
    Pause(Reply),
    Resume(Reply),
    Promote(Reply),
    Rollback { reason: String, reply: Reply },
}

struct RolloutHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CanaryRollout>,
}

impl RolloutHandle {
    fn current(&self) -> CanaryRollout {
        self.snapshot.borrow().clone()
    }
}

/// Registry of rollouts and their actors
pub struct CanaryController {
    options: Options,
    backend: Arc<dyn CanaryBackend>,
    dispatcher: Arc<Dispatcher>,
    rollouts: RwLock<HashMap<String, RolloutHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CanaryController {
    pub fn new(options: Options, backend: Arc<dyn CanaryBackend>, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            options,
            backend,
            dispatcher,
            rollouts: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Validate the config, deploy the canary and start analysing it
    pub async fn start(&self, config: RolloutConfig) -> Result<CanaryRollout, AgentError> {
        config.validate()?;

        let mut rollout = CanaryRollout::new(config);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(rollout.clone());

        {
            let mut rollouts = self.rollouts.write().unwrap_or_else(|e| e.into_inner());
            for (id, handle) in rollouts.iter() {
                let existing = handle.snapshot.borrow();
                if existing.status.is_terminal() {
                    continue;
                }
                if *id == rollout.id {
                    return Err(AgentError::Conflict(format!(
                        "rollout {} is already {}",
                        id, existing.status
                    )));
                }
                if existing.config.app == rollout.config.app {
                    return Err(AgentError::Conflict(format!(
                        "app {} already has an active rollout ({})",
                        existing.config.app, id
                    )));
                }
            }
            rollouts.insert(
                rollout.id.clone(),
                RolloutHandle {
                    commands: commands_tx,
                    snapshot: snapshot_rx,
                },
            );
        }

        let config = rollout.config.clone();
        info!(
            rollout = %rollout.id,
            app = %config.app,
            image = %config.canary_image,
            "Starting canary rollout"
        );

        let deployed = async {
            self.backend
                .deploy_canary(&config.app, &rollout.id, &config.canary_image)
                .await?;
            self.backend
                .set_traffic_split(&config.app, config.initial_percent)
                .await
        }
        .await;

        if let Err(e) = deployed {
            error!(rollout = %rollout.id, "Canary start failed: {}", e);
            // Best effort, the canary may be half-started
            if let Err(cleanup) = self.backend.remove_canary(&config.app).await {
                warn!(rollout = %rollout.id, "Canary cleanup failed: {}", cleanup);
            }
            rollout.fail(&e.to_string())?;
            snapshot_tx.send_replace(rollout);
            self.dispatcher.notify(
                Severity::Error,
                format!("Canary {} failed to start", config.app),
                e.to_string(),
            );
            return Err(e);
        }

        rollout.mark_initialized(Utc::now())?;
        snapshot_tx.send_replace(rollout.clone());
        self.dispatcher.notify(
            Severity::Info,
            format!("Canary started for {}", config.app),
            format!(
                "Rollout {} sends {}% of traffic to {}",
                rollout.id, rollout.current_percent, config.canary_image
            ),
        );

        self.spawn_actor(rollout.clone(), commands_rx, snapshot_tx);
        Ok(rollout)
    }

    /// Re-register persisted rollouts after a restart
    pub fn restore(&self, persisted: Vec<CanaryRollout>) {
        for mut rollout in persisted {
            let (commands_tx, commands_rx) = mpsc::channel(16);
            let resume = match rollout.status {
                RolloutStatus::Progressing | RolloutStatus::Paused | RolloutStatus::Promoting => true,
                RolloutStatus::Initializing | RolloutStatus::RollingBack => {
                    warn!(rollout = %rollout.id, status = %rollout.status, "Rollout interrupted by restart");
                    if let Err(e) = rollout.fail("interrupted by restart") {
                        warn!(rollout = %rollout.id, "{}", e);
                    }
                    false
                }
                _ => false,
            };

            let (snapshot_tx, snapshot_rx) = watch::channel(rollout.clone());
            let id = rollout.id.clone();
            if resume {
                info!(rollout = %id, status = %rollout.status, "Resuming canary rollout");
                self.spawn_actor(rollout, commands_rx, snapshot_tx);
            }

            self.rollouts.write().unwrap_or_else(|e| e.into_inner()).insert(
                id,
                RolloutHandle {
                    commands: commands_tx,
                    snapshot: snapshot_rx,
                },
            );
        }
    }

    fn spawn_actor(
        &self,
        rollout: CanaryRollout,
        commands: mpsc::Receiver<Command>,
        snapshot: watch::Sender<CanaryRollout>,
    ) {
        let actor = RolloutActor {
            rollout,
            backend: self.backend.clone(),
            dispatcher: self.dispatcher.clone(),
            snapshot,
            max_sample_failures: self.options.max_sample_failures,
        };
        let period = self.options.analysis_interval.max(Duration::from_millis(10));
        let handle = tokio::spawn(actor.run(commands, period, self.shutdown_tx.subscribe()));
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    async fn command(
        &self,
        id: &str,
        make: impl FnOnce(Reply) -> Command,
    ) -> Result<CanaryRollout, AgentError> {
        let (commands, status) = {
            let rollouts = self.rollouts.read().unwrap_or_else(|e| e.into_inner());
            let handle = rollouts
                .get(id)
                .ok_or_else(|| AgentError::NotFound(format!("rollout {}", id)))?;
            let status = handle.snapshot.borrow().status;
            (handle.commands.clone(), status)
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(make(reply_tx)).await.is_err() {
            return Err(AgentError::InvalidTransition(format!(
                "rollout {} is {}",
                id, status
            )));
        }
        reply_rx
            .await
            .map_err(|_| AgentError::InvalidTransition(format!("rollout {} has ended", id)))?
    }

    /// Apply one increment now
    pub async fn progress(&self, id: &str) -> Result<CanaryRollout, AgentError> {
        self.command(id, Command::Progress).await
    }

    /// Run one analysis tick now
    pub async fn analyze(&self, id: &str) -> Result<CanaryRollout, AgentError> {
        self.command(id, Command::Analyze).await
    }

    pub async fn pause(&self, id: &str) -> Result<CanaryRollout, AgentError> {
        self.command(id, Command::Pause).await
    }

    pub async fn resume(&self, id: &str) -> Result<CanaryRollout, AgentError> {
        self.command(id, Command::Resume).await
    }

    pub async fn promote(&self, id: &str) -> Result<CanaryRollout, AgentError> {
        self.command(id, Command::Promote).await
    }

    pub async fn rollback(&self, id: &str, reason: Option<String>) -> Result<CanaryRollout, AgentError> {
        let reason = reason.unwrap_or_default();
        self.command(id, |reply| Command::Rollback { reason, reply })
            .await
    }

    pub fn get(&self, id: &str) -> Option<CanaryRollout> {
        let rollouts = self.rollouts.read().unwrap_or_else(|e| e.into_inner());
        rollouts.get(id).map(RolloutHandle::current)
    }

    /// All rollouts, oldest first
    pub fn list(&self) -> Vec<CanaryRollout> {
        let rollouts = self.rollouts.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<CanaryRollout> = rollouts.values().map(RolloutHandle::current).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Rollouts that have not reached a terminal state
    pub fn active(&self) -> Vec<CanaryRollout> {
        self.list()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect()
    }

    /// Most recent samples of a rollout, newest last
    pub fn metrics(&self, id: &str, limit: usize) -> Result<Vec<MetricSample>, AgentError> {
        self.get(id)
            .map(|r| r.recent_samples(limit))
            .ok_or_else(|| AgentError::NotFound(format!("rollout {}", id)))
    }

    /// Wait until the rollout reaches a status matching `done`
    pub async fn wait_for(
        &self,
        id: &str,
        done: impl Fn(RolloutStatus) -> bool,
    ) -> Result<CanaryRollout, AgentError> {
        let mut snapshot = {
            let rollouts = self.rollouts.read().unwrap_or_else(|e| e.into_inner());
            rollouts
                .get(id)
                .map(|h| h.snapshot.clone())
                .ok_or_else(|| AgentError::NotFound(format!("rollout {}", id)))?
        };
        let rollout = snapshot
            .wait_for(|r| done(r.status))
            .await
            .map_err(|_| AgentError::Internal(format!("rollout {} actor stopped", id)))?;
        Ok(rollout.clone())
    }

    /// Stop every actor; rollouts keep their state for the next start
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!("Canary actor panicked: {}", e);
            }
        }
        info!("Canary controller stopped");
    }
}

struct RolloutActor {
    rollout: CanaryRollout,
    backend: Arc<dyn CanaryBackend>,
    dispatcher: Arc<Dispatcher>,
    snapshot: watch::Sender<CanaryRollout>,
    max_sample_failures: u32,
}

impl RolloutActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.rollout.status.is_terminal() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        debug!(rollout = %self.rollout.id, "Tick: {}", e);
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!(rollout = %self.rollout.id, "Canary actor shutting down");
                    break;
                }
            }
            self.publish();
        }

        self.publish();
        debug!(rollout = %self.rollout.id, status = %self.rollout.status, "Canary actor stopped");
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.rollout.clone());
    }

    async fn handle(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Analyze(reply) => (self.tick().await, reply),
            Command::Progress(reply) => (self.progress().await, reply),
            Command::Pause(reply) => (self.pause(), reply),
            Command::Resume(reply) => (self.resume(), reply),
            Command::Promote(reply) => (self.promote().await, reply),
            Command::Rollback { reason, reply } => {
                let result = self.rollback(RollbackReason::Manual(reason)).await;
                (result, reply)
            }
        };
        // Caller may have gone away
        let _ = reply.send(result.map(|_| self.rollout.clone()));
    }

    async fn collect(&self) -> Result<MetricSample, AgentError> {
        let app = &self.rollout.config.app;
        let canary = self.backend.collect_metrics(app, Variant::Canary).await?;
        let stable = self.backend.collect_metrics(app, Variant::Stable).await?;
        Ok(MetricSample::new(canary, stable))
    }

    async fn tick(&mut self) -> Result<(), AgentError> {
        if !self.rollout.status.is_analyzing() {
            return Ok(());
        }

        let sample = match self.collect().await {
            Ok(sample) => sample,
            Err(e) => {
                let failures = self.rollout.record_sample_failure();
                warn!(
                    rollout = %self.rollout.id,
                    failures,
                    "Metric collection failed: {}", e
                );
                if failures >= self.max_sample_failures {
                    self.fail(&format!(
                        "metric collection failed {} times in a row: {}",
                        failures, e
                    ));
                }
                return Err(e);
            }
        };

        match self.rollout.evaluate(sample, Utc::now()) {
            TickDecision::Rollback(reason) => self.complete_rollback(&reason).await,
            TickDecision::Breach(reason) => {
                self.dispatcher.notify(
                    Severity::Warning,
                    format!("Canary {} paused", self.rollout.config.app),
                    format!("Rollout {}: {} (auto-rollback disabled)", self.rollout.id, reason),
                );
                Ok(())
            }
            TickDecision::Advance { to } => self.advance(to).await,
            TickDecision::Idle | TickDecision::Observed | TickDecision::Hold => Ok(()),
        }
    }

    async fn progress(&mut self) -> Result<(), AgentError> {
        if self.rollout.status != RolloutStatus::Progressing {
            return Err(AgentError::InvalidTransition(format!(
                "rollout {} is {}, cannot progress",
                self.rollout.id, self.rollout.status
            )));
        }
        self.advance(self.rollout.next_percent()).await
    }

    /// Move the backend split first, then commit the new share
    async fn advance(&mut self, to: u32) -> Result<(), AgentError> {
        self.backend
            .set_traffic_split(&self.rollout.config.app, to)
            .await?;

        if self.rollout.apply_increment(to, Utc::now())? {
            self.dispatcher.notify(
                Severity::Info,
                format!("Canary {} ready for promotion", self.rollout.config.app),
                format!(
                    "Rollout {} reached {}% without breaching thresholds",
                    self.rollout.id, to
                ),
            );
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), AgentError> {
        self.rollout.pause()?;
        info!(rollout = %self.rollout.id, "Canary paused");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), AgentError> {
        self.rollout.resume(Utc::now())?;
        info!(rollout = %self.rollout.id, "Canary resumed");
        Ok(())
    }

    async fn rollback(&mut self, reason: RollbackReason) -> Result<(), AgentError> {
        self.rollout.begin_rollback(&reason)?;
        self.complete_rollback(&reason).await
    }

    /// Tear the canary down once the rollout is rolling back
    async fn complete_rollback(&mut self, reason: &RollbackReason) -> Result<(), AgentError> {
        let app = self.rollout.config.app.clone();

        let teardown = async {
            self.backend.set_traffic_split(&app, 0).await?;
            self.backend.remove_canary(&app).await
        }
        .await;

        if let Err(e) = teardown {
            self.fail(&format!("rollback failed: {}", e));
            return Err(e);
        }

        self.rollout.finish_rollback()?;
        warn!(rollout = %self.rollout.id, "Canary rolled back: {}", reason);
        self.dispatcher.notify(
            Severity::Warning,
            format!("Canary {} rolled back", app),
            format!("Rollout {}: {}", self.rollout.id, reason),
        );
        Ok(())
    }

    async fn promote(&mut self) -> Result<(), AgentError> {
        self.rollout.begin_promotion()?;
        let app = self.rollout.config.app.clone();
        let image = self.rollout.config.canary_image.clone();

        let promoted = async {
            self.backend.promote(&app, &image).await?;
            self.backend.remove_canary(&app).await?;
            self.backend.set_traffic_split(&app, 0).await
        }
        .await;

        if let Err(e) = promoted {
            self.fail(&format!("promotion failed: {}", e));
            return Err(e);
        }

        self.rollout.finish_promotion()?;
        info!(rollout = %self.rollout.id, "Canary promoted: {} now runs {}", app, image);
        self.dispatcher.notify(
            Severity::Success,
            format!("Canary {} promoted", app),
            format!("Rollout {}: {} is now stable", self.rollout.id, image),
        );
        Ok(())
    }

    fn fail(&mut self, error: &str) {
        error!(rollout = %self.rollout.id, "Canary failed: {}", error);
        if let Err(e) = self.rollout.fail(error) {
            warn!(rollout = %self.rollout.id, "{}", e);
            return;
        }
        self.dispatcher.notify(
            Severity::Error,
            format!("Canary {} failed", self.rollout.config.app),
            format!("Rollout {}: {}", self.rollout.id, error),
        );
    }
}
