//! Notification channel adapters

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::errors::AgentError;
use crate::notify::{NotificationEvent, Notifier, Severity};

fn http_client() -> Result<Client, AgentError> {
    Ok(Client::builder().timeout(Duration::from_secs(10)).build()?)
}

async fn post_json(client: &Client, url: &str, body: &serde_json::Value) -> Result<(), AgentError> {
    let response = client.post(url).json(body).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(AgentError::ServerError(format!("{}: {}", status, text)));
    }
    Ok(())
}

/// Posts the raw event as JSON to an arbitrary endpoint
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, AgentError> {
        Ok(Self {
            client: http_client()?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), AgentError> {
        post_json(&self.client, &self.url, &serde_json::to_value(event)?).await
    }
}

/// Slack incoming webhook
pub struct SlackNotifier {
    client: Client,
    webhook_url: SecretString,
}

impl SlackNotifier {
    pub fn new(webhook_url: SecretString) -> Result<Self, AgentError> {
        Ok(Self {
            client: http_client()?,
            webhook_url,
        })
    }

    fn color(severity: Severity) -> &'static str {
        match severity {
            Severity::Info => "#439fe0",
            Severity::Success => "good",
            Severity::Warning => "warning",
            Severity::Error | Severity::Critical => "danger",
        }
    }

    fn payload(event: &NotificationEvent) -> serde_json::Value {
        json!({
            "text": event.title,
            "attachments": [{
                "color": Self::color(event.severity),
                "text": event.body,
                "footer": format!("pullagent · {}", event.severity),
                "ts": event.timestamp.timestamp(),
            }]
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), AgentError> {
        post_json(
            &self.client,
            self.webhook_url.expose_secret(),
            &Self::payload(event),
        )
        .await
    }
}

/// Telegram bot `sendMessage`
pub struct TelegramNotifier {
    client: Client,
    bot_token: SecretString,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, chat_id: &str) -> Result<Self, AgentError> {
        Ok(Self {
            client: http_client()?,
            bot_token,
            chat_id: chat_id.to_string(),
        })
    }

    fn text(event: &NotificationEvent) -> String {
        format!(
            "[{}] {}\n{}",
            event.severity.to_string().to_uppercase(),
            event.title,
            event.body
        )
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), AgentError> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.bot_token.expose_secret()
        );
        let body = json!({
            "chat_id": self.chat_id,
            "text": Self::text(event),
            "disable_web_page_preview": true,
        });
        post_json(&self.client, &url, &body).await
    }
}
