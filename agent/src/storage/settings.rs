//! Agent settings from the environment and an optional JSON file
//!
//! The JSON file is a flat object keyed by the same names as the environment
//! variables, e.g. `{"DEPLOY_BRANCH": "main", "PORT": 9000}`. Environment
//! variables take precedence over the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;
use url::Url;

use crate::errors::AgentError;
use crate::logs::LogLevel;

/// Notification channel settings
#[derive(Debug, Default)]
pub struct NotificationSettings {
    pub slack_webhook_url: Option<SecretString>,
    pub telegram_bot_token: Option<SecretString>,
    pub telegram_chat_id: Option<String>,
    pub webhook_url: Option<String>,
}

/// Canary controller settings
#[derive(Debug)]
pub struct CanarySettings {
    /// Time between analysis ticks
    pub analysis_interval: Duration,

    /// Base URL serving `GET /{app}/{canary|stable}` metrics
    pub metrics_url: Option<String>,

    /// Base URL accepting `PUT /{app}` traffic splits
    pub traffic_api_url: Option<String>,
}

impl Default for CanarySettings {
    fn default() -> Self {
        Self {
            analysis_interval: Duration::from_secs(30),
            metrics_url: None,
            traffic_api_url: None,
        }
    }
}

/// Agent settings
#[derive(Debug)]
pub struct Settings {
    /// Checkout deployed by the agent
    pub repo_path: PathBuf,

    /// Tracked branch
    pub deploy_branch: String,

    /// Compose file relative to the checkout, compose default when unset
    pub compose_file: Option<String>,

    /// HMAC secret for push webhooks
    pub webhook_secret: Option<SecretString>,

    /// Reject webhooks when no secret is configured
    pub webhook_require_secret: bool,

    /// Shared secret for mutating API calls
    pub api_secret: Option<SecretString>,

    /// Remote polling interval, zero disables polling
    pub poll_interval: Duration,

    pub health_check_url: String,
    pub health_check_timeout: Duration,
    pub health_check_interval: Duration,

    pub build_timeout: Duration,

    /// Consecutive failures before a critical notification
    pub max_retries: u32,

    pub rollback_enabled: bool,

    /// Deployments kept in history
    pub history_capacity: usize,

    /// Directory holding `state.json`
    pub data_dir: PathBuf,

    pub host: String,
    pub port: u16,

    pub log_level: LogLevel,
    pub log_json: bool,
    pub log_dir: Option<PathBuf>,

    pub notifications: NotificationSettings,
    pub canary: CanarySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            deploy_branch: "main".to_string(),
            compose_file: None,
            webhook_secret: None,
            webhook_require_secret: false,
            api_secret: None,
            poll_interval: Duration::from_secs(60),
            health_check_url: "http://localhost:3000/health".to_string(),
            health_check_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(2),
            build_timeout: Duration::from_secs(600),
            max_retries: 3,
            rollback_enabled: true,
            history_capacity: 50,
            data_dir: PathBuf::from("./data"),
            host: "0.0.0.0".to_string(),
            port: 9000,
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            notifications: NotificationSettings::default(),
            canary: CanarySettings::default(),
        }
    }
}

impl Settings {
    /// Read the optional config file, then the process environment
    pub fn load(config_file: Option<&Path>) -> Result<Self, AgentError> {
        let file = match config_file {
            Some(path) => read_config_file(path)?,
            None => HashMap::new(),
        };
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| file.get(key).cloned()))
    }

    /// Build settings from a key lookup. Unset or empty keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut settings = Self::default();

        if let Some(v) = get("REPO_PATH") {
            settings.repo_path = PathBuf::from(v);
        }
        if let Some(v) = get("DEPLOY_BRANCH") {
            settings.deploy_branch = v;
        }
        settings.compose_file = get("COMPOSE_FILE");
        settings.webhook_secret = get("WEBHOOK_SECRET").map(SecretString::from);
        if let Some(v) = get("WEBHOOK_REQUIRE_SECRET") {
            settings.webhook_require_secret = parse_bool("WEBHOOK_REQUIRE_SECRET", &v)?;
        }
        settings.api_secret = get("API_SECRET").map(SecretString::from);
        if let Some(v) = get("POLL_INTERVAL") {
            settings.poll_interval = Duration::from_secs(parse("POLL_INTERVAL", &v)?);
        }
        if let Some(v) = get("HEALTH_CHECK_URL") {
            settings.health_check_url = v;
        }
        if let Some(v) = get("HEALTH_CHECK_TIMEOUT") {
            settings.health_check_timeout = Duration::from_secs(parse("HEALTH_CHECK_TIMEOUT", &v)?);
        }
        if let Some(v) = get("HEALTH_CHECK_INTERVAL") {
            settings.health_check_interval = Duration::from_secs(parse("HEALTH_CHECK_INTERVAL", &v)?);
        }
        if let Some(v) = get("BUILD_TIMEOUT") {
            settings.build_timeout = Duration::from_secs(parse("BUILD_TIMEOUT", &v)?);
        }
        if let Some(v) = get("MAX_RETRIES") {
            settings.max_retries = parse("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("ROLLBACK_ENABLED") {
            settings.rollback_enabled = parse_bool("ROLLBACK_ENABLED", &v)?;
        }
        if let Some(v) = get("HISTORY_CAPACITY") {
            settings.history_capacity = parse("HISTORY_CAPACITY", &v)?;
        }
        if let Some(v) = get("DATA_DIR") {
            settings.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("HOST") {
            settings.host = v;
        }
        if let Some(v) = get("PORT") {
            settings.port = parse("PORT", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            settings.log_level = v
                .parse()
                .map_err(|e: String| AgentError::ConfigError(format!("LOG_LEVEL: {}", e)))?;
        }
        if let Some(v) = get("LOG_JSON") {
            settings.log_json = parse_bool("LOG_JSON", &v)?;
        }
        settings.log_dir = get("LOG_DIR").map(PathBuf::from);

        settings.notifications = NotificationSettings {
            slack_webhook_url: get("SLACK_WEBHOOK_URL").map(SecretString::from),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN").map(SecretString::from),
            telegram_chat_id: get("TELEGRAM_CHAT_ID"),
            webhook_url: get("NOTIFY_WEBHOOK_URL"),
        };

        if let Some(v) = get("CANARY_ANALYSIS_INTERVAL") {
            settings.canary.analysis_interval =
                Duration::from_secs(parse("CANARY_ANALYSIS_INTERVAL", &v)?);
        }
        settings.canary.metrics_url = get("CANARY_METRICS_URL");
        settings.canary.traffic_api_url = get("TRAFFIC_API_URL");

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), AgentError> {
        let branch = &self.deploy_branch;
        if branch.starts_with('-') || branch.contains(char::is_whitespace) || branch.contains("..") {
            return Err(AgentError::ConfigError(format!(
                "DEPLOY_BRANCH {:?} is not a valid branch name",
                branch
            )));
        }

        validate_url("HEALTH_CHECK_URL", &self.health_check_url)?;
        if let Some(url) = &self.notifications.webhook_url {
            validate_url("NOTIFY_WEBHOOK_URL", url)?;
        }
        if let Some(url) = &self.canary.metrics_url {
            validate_url("CANARY_METRICS_URL", url)?;
        }
        if let Some(url) = &self.canary.traffic_api_url {
            validate_url("TRAFFIC_API_URL", url)?;
        }

        for (key, value) in [
            ("HEALTH_CHECK_TIMEOUT", self.health_check_timeout),
            ("HEALTH_CHECK_INTERVAL", self.health_check_interval),
            ("BUILD_TIMEOUT", self.build_timeout),
            ("CANARY_ANALYSIS_INTERVAL", self.canary.analysis_interval),
        ] {
            if value.is_zero() {
                return Err(AgentError::ConfigError(format!("{} must be greater than 0", key)));
            }
        }
        if self.max_retries == 0 {
            return Err(AgentError::ConfigError("MAX_RETRIES must be at least 1".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(AgentError::ConfigError(
                "HISTORY_CAPACITY must be at least 1".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(AgentError::ConfigError("PORT must not be 0".to_string()));
        }
        if self.notifications.telegram_bot_token.is_some()
            != self.notifications.telegram_chat_id.is_some()
        {
            return Err(AgentError::ConfigError(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Problems that do not prevent startup
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.webhook_secret.is_none() {
            if self.webhook_require_secret {
                warnings.push(
                    "WEBHOOK_SECRET is not set and WEBHOOK_REQUIRE_SECRET=true: all webhooks will be rejected"
                        .to_string(),
                );
            } else {
                warnings.push(
                    "WEBHOOK_SECRET is not set: webhook signatures are NOT verified".to_string(),
                );
            }
        }
        if self.api_secret.is_none() {
            warnings.push("API_SECRET is not set: control endpoints are unauthenticated".to_string());
        }
        warnings
    }

    pub fn log_warnings(&self) {
        for warning in self.warnings() {
            warn!("{}", warning);
        }
    }
}

fn read_config_file(path: &Path) -> Result<HashMap<String, String>, AgentError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        AgentError::ConfigError(format!("cannot read config file {}: {}", path.display(), e))
    })?;
    parse_config_file(&contents)
        .map_err(|e| AgentError::ConfigError(format!("config file {}: {}", path.display(), e)))
}

fn parse_config_file(contents: &str) -> Result<HashMap<String, String>, AgentError> {
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(contents)?;
    let mut values = HashMap::new();
    for (key, value) in object {
        let value = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(s) => s,
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(AgentError::ConfigError(format!(
                    "{} must be a string, number or boolean, got {}",
                    key, other
                )))
            }
        };
        values.insert(key, value);
    }
    Ok(values)
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, AgentError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| AgentError::ConfigError(format!("{}={:?}: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AgentError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AgentError::ConfigError(format!(
            "{}={:?}: expected true or false",
            key, value
        ))),
    }
}

fn validate_url(key: &str, value: &str) -> Result<(), AgentError> {
    let url = Url::parse(value)
        .map_err(|e| AgentError::ConfigError(format!("{}={:?}: {}", key, value, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AgentError::ConfigError(format!(
            "{}={:?}: only http and https are supported",
            key, value
        )));
    }
    Ok(())
}
