//! Notification dispatch
//!
//! Components publish [`NotificationEvent`]s through the [`Dispatcher`]. Publishing
//! never waits for delivery: events go to a broadcast channel for live observers and
//! to a bounded queue drained by a delivery worker that fans out to every channel.

pub mod channels;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::AgentError;

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A status event to be delivered to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(severity: Severity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            severity,
            timestamp: Utc::now(),
        }
    }
}

/// A delivery channel (Slack, Telegram, plain webhook, ...)
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, event: &NotificationEvent) -> Result<(), AgentError>;
}

/// Dispatcher options
#[derive(Debug, Clone)]
pub struct Options {
    /// Events waiting for delivery before new ones are dropped
    pub queue_capacity: usize,

    /// Events buffered per live observer
    pub broadcast_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            broadcast_capacity: 64,
        }
    }
}

/// Fans notification events out to observers and delivery channels
pub struct Dispatcher {
    queue: mpsc::Sender<NotificationEvent>,
    events: broadcast::Sender<NotificationEvent>,
}

impl Dispatcher {
    /// Create the dispatcher and spawn its delivery worker. The worker stops on
    /// shutdown after draining what is already queued.
    pub fn start(
        options: &Options,
        channels: Vec<Arc<dyn Notifier>>,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (events_tx, _) = broadcast::channel(options.broadcast_capacity.max(1));

        info!(
            "Notification dispatcher starting with {} channel(s)",
            channels.len()
        );
        let handle = tokio::spawn(deliver(queue_rx, channels, shutdown_signal));

        let dispatcher = Arc::new(Self {
            queue: queue_tx,
            events: events_tx,
        });
        (dispatcher, handle)
    }

    /// Publish an event without waiting for delivery
    pub fn dispatch(&self, event: NotificationEvent) {
        debug!("Notification [{}] {}", event.severity, event.title);

        // No live observers is fine
        let _ = self.events.send(event.clone());

        if let Err(e) = self.queue.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!("Notification queue full, dropping: {}", event.title)
                }
                mpsc::error::TrySendError::Closed(event) => {
                    debug!("Notification worker stopped, dropping: {}", event.title)
                }
            }
        }
    }

    pub fn notify(&self, severity: Severity, title: impl Into<String>, body: impl Into<String>) {
        self.dispatch(NotificationEvent::new(severity, title, body));
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }
}

async fn deliver(
    mut queue: mpsc::Receiver<NotificationEvent>,
    channels: Vec<Arc<dyn Notifier>>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) {
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                queue.close();
                while let Some(event) = queue.recv().await {
                    fan_out(&channels, &event).await;
                }
                info!("Notification dispatcher shutting down...");
                return;
            }
            event = queue.recv() => match event {
                Some(event) => fan_out(&channels, &event).await,
                None => return,
            },
        }
    }
}

/// Deliver to every channel concurrently; failures are only logged
async fn fan_out(channels: &[Arc<dyn Notifier>], event: &NotificationEvent) {
    let sends = channels.iter().map(|channel| async move {
        if let Err(e) = channel.send(event).await {
            warn!("Notification via {} failed: {}", channel.name(), e);
        }
    });
    futures::future::join_all(sends).await;
}
