//! Application state management

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::authn::signature::copy_secret;
use crate::canary::backend::{CanaryBackend, DockerCanaryBackend};
use crate::canary::CanaryController;
use crate::deploy::command::{CommandRunner, ProcessRunner};
use crate::deploy::docker::{ComposeStack, Containers};
use crate::deploy::git::GitRepo;
use crate::deploy::health::{HealthProbe, HttpHealthProbe};
use crate::deploy::Orchestrator;
use crate::errors::AgentError;
use crate::notify::channels::{SlackNotifier, TelegramNotifier, WebhookNotifier};
use crate::notify::{Dispatcher, Notifier};
use crate::storage::state::StateStore;
use crate::workers::persister;

/// External collaborators of the agent, swappable in tests
pub struct Components {
    pub runner: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn HealthProbe>,
    pub canary_backend: Arc<dyn CanaryBackend>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
}

impl Components {
    /// Real processes, HTTP probes and configured notification channels
    pub fn from_options(options: &AppOptions) -> Result<Self, AgentError> {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        let probe = Arc::new(HttpHealthProbe::new(&options.health_check_url)?);

        let containers = Containers::new(runner.clone(), options.repository.restart_timeout);
        let canary_backend = Arc::new(DockerCanaryBackend::new(
            containers,
            options.canary_backend.traffic_api_url.clone(),
            options.canary_backend.metrics_url.clone(),
        )?);

        let channels = &options.notifications;
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        if let Some(url) = &channels.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(url)?));
        }
        if let Some(url) = &channels.slack_webhook_url {
            notifiers.push(Arc::new(SlackNotifier::new(copy_secret(url))?));
        }
        if let (Some(token), Some(chat_id)) = (&channels.telegram_bot_token, &channels.telegram_chat_id) {
            notifiers.push(Arc::new(TelegramNotifier::new(copy_secret(token), chat_id)?));
        }

        Ok(Self {
            runner,
            probe,
            canary_backend,
            notifiers,
        })
    }
}

/// Main application state
pub struct AppState {
    /// Persisted revision, history and failure counter
    pub store: Arc<StateStore>,

    /// Deployment pipeline behind the gate
    pub orchestrator: Arc<Orchestrator>,

    /// Canary rollouts
    pub canary: Arc<CanaryController>,

    /// Notification fan-out
    pub dispatcher: Arc<Dispatcher>,

    /// Deployed checkout
    pub git: GitRepo,
}

impl AppState {
    /// Initialize application state. The returned handle is the notification
    /// delivery worker, which stops once `shutdown_signal` resolves.
    pub async fn init(
        options: &AppOptions,
        components: Components,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(Self, JoinHandle<()>), AgentError> {
        info!("Initializing application state...");

        let (dispatcher, dispatcher_handle) =
            Dispatcher::start(&options.notify, components.notifiers, shutdown_signal);

        // Load persisted state
        options.storage.layout.setup().await?;
        let store = Arc::new(StateStore::new(
            options.storage.layout.state_file(),
            options.storage.history_capacity,
        ));
        let rollouts = store.load().await?;

        let repository = &options.repository;
        let git = GitRepo::new(
            components.runner.clone(),
            &repository.path,
            &repository.branch,
            repository.git_timeout,
        );
        if store.last_revision().is_none() {
            match git.current_revision().await {
                Ok(revision) => store.set_last_revision(&revision),
                Err(e) => warn!("Could not read checked out revision: {}", e),
            }
        }

        let stack = ComposeStack::new(
            components.runner.clone(),
            &repository.path,
            repository.compose_file.clone(),
            repository.build_timeout,
            repository.restart_timeout,
        );

        let orchestrator = Orchestrator::new(
            options.orchestrator.clone(),
            git.clone(),
            stack,
            components.probe,
            store.clone(),
            dispatcher.clone(),
        );

        let canary = Arc::new(CanaryController::new(
            options.canary.clone(),
            components.canary_backend,
            dispatcher.clone(),
        ));
        canary.restore(rollouts);

        let state = Self {
            store,
            orchestrator,
            canary,
            dispatcher,
            git,
        };
        Ok((state, dispatcher_handle))
    }

    /// Wait for the running deployment, stop rollout actors and write a final
    /// snapshot
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("Shutting down application state...");

        if self.orchestrator.is_deploying() {
            warn!("Waiting for the running deployment to finish...");
            self.orchestrator.wait_idle().await;
        }
        self.canary.shutdown().await;
        persister::snapshot(&self.store, &self.canary).await;
        Ok(())
    }
}
