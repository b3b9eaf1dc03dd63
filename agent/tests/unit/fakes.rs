//! Test doubles for processes, health probes and the canary backend

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use pullagent::app::options::AppOptions;
use pullagent::app::state::{AppState, Components};
use pullagent::canary::backend::{CanaryBackend, Variant};
use pullagent::canary::metrics::SideMetrics;
use pullagent::deploy::command::{CommandOutput, CommandRunner, CommandSpec};
use pullagent::deploy::health::{HealthProbe, HealthSettings};
use pullagent::deploy::DeployRequest;
use pullagent::errors::AgentError;
use pullagent::models::deployment::Deployment;
use pullagent::notify::NotificationEvent;
use pullagent::storage::layout::StorageLayout;

pub const REV1: &str = "1111111111111111111111111111111111111111";
pub const REV2: &str = "2222222222222222222222222222222222222222";
pub const REV3: &str = "3333333333333333333333333333333333333333";

// ================================ COMMANDS ======================================= //

pub struct RunnerState {
    pub head: String,
    pub remote: String,
    pub failing: HashSet<String>,
    pub calls: Vec<String>,
    pub build_delay: Duration,
}

/// Simulates git and docker: `pull` moves HEAD to the remote head and
/// `reset --hard` moves it to the given revision. Steps listed in `failing`
/// (`pull`, `build`, `up`, `reset`) exit with status 1.
pub struct FakeRunner {
    state: Mutex<RunnerState>,
}

impl FakeRunner {
    pub fn new(head: &str, remote: &str) -> Self {
        Self {
            state: Mutex::new(RunnerState {
                head: head.to_string(),
                remote: remote.to_string(),
                failing: HashSet::new(),
                calls: Vec::new(),
                build_delay: Duration::ZERO,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap()
    }

    pub fn head(&self) -> String {
        self.state().head.clone()
    }

    pub fn set_remote(&self, remote: &str) {
        self.state().remote = remote.to_string();
    }

    pub fn fail(&self, step: &str) {
        self.state().failing.insert(step.to_string());
    }

    pub fn heal(&self, step: &str) {
        self.state().failing.remove(step);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, AgentError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(spec.display());
            if spec.program == "docker" && spec.args.iter().any(|a| a == "build") {
                state.build_delay
            } else {
                Duration::ZERO
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let step = match (spec.program.as_str(), args.as_slice()) {
            ("git", ["rev-parse", ..]) => return Ok(ok(&format!("{}\n", state.head))),
            ("git", ["ls-remote", _, refname]) => {
                return Ok(ok(&format!("{}\t{}\n", state.remote, refname)))
            }
            ("git", ["pull", ..]) => "pull",
            ("git", ["reset", "--hard", _]) => "reset",
            ("docker", [.., "build"]) => "build",
            ("docker", [.., "up", "-d", "--remove-orphans"]) => "up",
            _ => return Ok(ok("")),
        };

        if state.failing.contains(step) {
            return Ok(CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("{} failed\n", step),
            });
        }
        match step {
            "pull" => state.head = state.remote.clone(),
            "reset" => state.head = args[2].to_string(),
            _ => {}
        }
        Ok(ok(""))
    }
}

// ================================= HEALTH ======================================== //

/// Healthy unless the checked out revision is marked unhealthy
pub struct FakeProbe {
    runner: Arc<FakeRunner>,
    unhealthy: Mutex<HashSet<String>>,
}

impl FakeProbe {
    pub fn new(runner: Arc<FakeRunner>) -> Self {
        Self {
            runner,
            unhealthy: Mutex::new(HashSet::new()),
        }
    }

    pub fn mark_unhealthy(&self, revision: &str) {
        self.unhealthy.lock().unwrap().insert(revision.to_string());
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self) -> bool {
        let head = self.runner.head();
        !self.unhealthy.lock().unwrap().contains(&head)
    }
}

// ================================= CANARY ======================================== //

#[derive(Default)]
pub struct BackendState {
    pub canary: SideMetrics,
    pub stable: SideMetrics,
    pub fail_metrics: bool,
    pub fail_deploy: bool,
    pub deployed: Vec<(String, String)>,
    pub removed: Vec<String>,
    pub splits: Vec<(String, u32)>,
    pub promoted: Vec<(String, String)>,
}

/// Records every backend call; metrics are whatever the test sets
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

pub fn healthy_metrics() -> SideMetrics {
    SideMetrics {
        requests: 1000,
        errors: 5,
        avg_latency_ms: 120.0,
        p99_latency_ms: 350.0,
        healthy_pods: 1,
        total_pods: 1,
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState {
                canary: healthy_metrics(),
                stable: healthy_metrics(),
                ..Default::default()
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    pub fn split_percents(&self) -> Vec<u32> {
        self.state().splits.iter().map(|(_, p)| *p).collect()
    }
}

#[async_trait]
impl CanaryBackend for FakeBackend {
    async fn deploy_canary(&self, app: &str, _rollout_id: &str, image: &str) -> Result<(), AgentError> {
        let mut state = self.state();
        if state.fail_deploy {
            return Err(AgentError::CommandError("docker run failed".to_string()));
        }
        state.deployed.push((app.to_string(), image.to_string()));
        Ok(())
    }

    async fn remove_canary(&self, app: &str) -> Result<(), AgentError> {
        self.state().removed.push(app.to_string());
        Ok(())
    }

    async fn set_traffic_split(&self, app: &str, canary_percent: u32) -> Result<(), AgentError> {
        self.state().splits.push((app.to_string(), canary_percent));
        Ok(())
    }

    async fn promote(&self, app: &str, image: &str) -> Result<(), AgentError> {
        self.state().promoted.push((app.to_string(), image.to_string()));
        Ok(())
    }

    async fn collect_metrics(&self, _app: &str, variant: Variant) -> Result<SideMetrics, AgentError> {
        let state = self.state();
        if state.fail_metrics {
            return Err(AgentError::CanaryError("metrics endpoint unreachable".to_string()));
        }
        Ok(match variant {
            Variant::Canary => state.canary.clone(),
            Variant::Stable => state.stable.clone(),
        })
    }
}

// ================================= HARNESS ======================================= //

/// Options with fast health checks and manual canary ticks
pub fn test_options(dir: &Path) -> AppOptions {
    let mut options = AppOptions::default();
    options.storage.layout = StorageLayout::new(dir.join("data"));
    options.repository.path = dir.to_path_buf();
    options.orchestrator.health = HealthSettings {
        timeout: Duration::from_millis(100),
        interval: Duration::from_millis(10),
    };
    options.canary.analysis_interval = Duration::from_secs(3600);
    options
}

/// A fully wired application state on top of the fakes
pub struct Harness {
    pub runner: Arc<FakeRunner>,
    pub probe: Arc<FakeProbe>,
    pub backend: Arc<FakeBackend>,
    pub app: Arc<AppState>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(|_| {}).await
    }

    pub async fn with_options(configure: impl FnOnce(&mut AppOptions)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::start(dir, REV1, REV2, configure).await
    }

    pub async fn start(
        dir: TempDir,
        head: &str,
        remote: &str,
        configure: impl FnOnce(&mut AppOptions),
    ) -> Self {
        let mut options = test_options(dir.path());
        configure(&mut options);

        let runner = Arc::new(FakeRunner::new(head, remote));
        let probe = Arc::new(FakeProbe::new(runner.clone()));
        let backend = Arc::new(FakeBackend::new());
        let components = Components {
            runner: runner.clone(),
            probe: probe.clone(),
            canary_backend: backend.clone(),
            notifiers: Vec::new(),
        };

        let (app, _dispatcher_handle) =
            AppState::init(&options, components, std::future::pending::<()>())
                .await
                .unwrap();

        Self {
            runner,
            probe,
            backend,
            app: Arc::new(app),
            dir,
        }
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.app.orchestrator.wait_idle())
            .await
            .expect("deployment did not finish");
    }

    /// Trigger a deployment and wait for it to finish
    pub async fn deploy(&self, request: DeployRequest) -> Deployment {
        self.app.orchestrator.trigger(request).unwrap();
        self.wait_idle().await;
        self.app.store.last_deployment().unwrap()
    }
}

pub fn drain(events: &mut broadcast::Receiver<NotificationEvent>) -> Vec<NotificationEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}
