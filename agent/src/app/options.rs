//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::canary::controller;
use crate::deploy::health::HealthSettings;
use crate::deploy::orchestrator;
use crate::notify;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{NotificationSettings, Settings};
use crate::workers::{persister, poller};

/// Main application options
#[derive(Debug, Default)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Server configuration
    pub server: ServerOptions,

    /// Deployed checkout and compose project
    pub repository: RepositoryOptions,

    /// Liveness endpoint of the deployed application
    pub health_check_url: String,

    /// Secrets guarding the HTTP API
    pub auth: AuthOptions,

    /// Enable polling worker
    pub enable_poller: bool,

    /// Poller worker options
    pub poller: poller::Options,

    /// Persister worker options
    pub persister: persister::Options,

    /// Deployment orchestrator settings
    pub orchestrator: orchestrator::Settings,

    /// Canary controller options
    pub canary: controller::Options,

    /// Canary backend endpoints
    pub canary_backend: CanaryBackendOptions,

    /// Notification dispatcher options
    pub notify: notify::Options,

    /// Notification channels
    pub notifications: NotificationSettings,
}

impl AppOptions {
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions {
                layout: StorageLayout::new(settings.data_dir),
                history_capacity: settings.history_capacity,
            },
            server: ServerOptions {
                host: settings.host,
                port: settings.port,
            },
            repository: RepositoryOptions {
                path: settings.repo_path,
                branch: settings.deploy_branch,
                compose_file: settings.compose_file,
                build_timeout: settings.build_timeout,
                ..Default::default()
            },
            health_check_url: settings.health_check_url,
            auth: AuthOptions {
                webhook_secret: settings.webhook_secret,
                webhook_require_secret: settings.webhook_require_secret,
                api_secret: settings.api_secret,
            },
            enable_poller: !settings.poll_interval.is_zero(),
            poller: poller::Options {
                interval: settings.poll_interval,
                ..Default::default()
            },
            persister: persister::Options::default(),
            orchestrator: orchestrator::Settings {
                rollback_enabled: settings.rollback_enabled,
                max_retries: settings.max_retries,
                health: HealthSettings {
                    timeout: settings.health_check_timeout,
                    interval: settings.health_check_interval,
                },
            },
            canary: controller::Options {
                analysis_interval: settings.canary.analysis_interval,
                ..Default::default()
            },
            canary_backend: CanaryBackendOptions {
                metrics_url: settings.canary.metrics_url,
                traffic_api_url: settings.canary.traffic_api_url,
            },
            notify: notify::Options::default(),
            notifications: settings.notifications,
        }
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown, including a running deployment
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(15 * 60),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Deployments kept in history
    pub history_capacity: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            history_capacity: crate::storage::state::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Deployed checkout
#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    pub path: PathBuf,
    pub branch: String,
    pub compose_file: Option<String>,

    /// Timeout of git commands
    pub git_timeout: Duration,

    /// Timeout of `docker compose build`
    pub build_timeout: Duration,

    /// Timeout of `docker compose up` and single container commands
    pub restart_timeout: Duration,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            branch: "main".to_string(),
            compose_file: None,
            git_timeout: Duration::from_secs(120),
            build_timeout: Duration::from_secs(600),
            restart_timeout: Duration::from_secs(120),
        }
    }
}

/// Secrets guarding the HTTP API
#[derive(Debug, Default)]
pub struct AuthOptions {
    /// HMAC secret for push webhooks
    pub webhook_secret: Option<SecretString>,

    /// Reject webhooks when no secret is configured
    pub webhook_require_secret: bool,

    /// Shared secret for mutating endpoints
    pub api_secret: Option<SecretString>,
}

/// Canary backend endpoints
#[derive(Debug, Clone, Default)]
pub struct CanaryBackendOptions {
    pub metrics_url: Option<String>,
    pub traffic_api_url: Option<String>,
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
        }
    }
}
