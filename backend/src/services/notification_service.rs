//! Outbound alert notifications.
//!
//! Delivery is best effort: a failing channel is logged and never blocks the
//! others or the caller.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::{AppError, Result};
use crate::models::{AlertSeverity, AlertType};

/// What gets delivered to every channel.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub alert_type: Option<AlertType>,
    /// Set for repeated reminders of an alert that is still open.
    pub reminder: bool,
    pub metadata: serde_json::Value,
}

impl Notification {
    fn subject(&self) -> String {
        let prefix = if self.reminder { "[REMINDER] " } else { "" };
        format!(
            "{}[{}] {}",
            prefix,
            self.severity.to_string().to_uppercase(),
            self.title
        )
    }
}

/// A single delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, notification: &Notification) -> Result<()>;
}

async fn post_json<T: Serialize + ?Sized>(client: &Client, url: &str, body: &T) -> Result<()> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| AppError::Internal(format!("POST {} failed: {}", url, e)))?;
    if !resp.status().is_success() {
        return Err(AppError::Internal(format!(
            "POST {} returned HTTP {}",
            url,
            resp.status()
        )));
    }
    Ok(())
}

/// Posts the full notification as JSON.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        post_json(&self.client, &self.url, notification).await
    }
}

/// Slack-compatible incoming webhook.
pub struct ChatNotifier {
    client: Client,
    url: String,
}

impl ChatNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let text = format!("*{}*\n{}", notification.subject(), notification.message);
        post_json(&self.client, &self.url, &serde_json::json!({ "text": text })).await
    }
}

/// Email through an HTTP mail relay accepting `{to, subject, body}`.
pub struct EmailNotifier {
    client: Client,
    api_url: String,
    recipients: Vec<String>,
}

impl EmailNotifier {
    pub fn new(client: Client, api_url: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            recipients,
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let body = serde_json::json!({
            "to": self.recipients,
            "subject": notification.subject(),
            "body": notification.message,
        });
        post_json(&self.client, &self.api_url, &body).await
    }
}

/// Writes notifications to the log. Always configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            severity = %notification.severity,
            reminder = notification.reminder,
            "Notification: {}: {}",
            notification.title,
            notification.message
        );
        Ok(())
    }
}

pub struct NotificationService {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotificationService {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Build the channel set from configuration. The log channel is always on.
    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = &config.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(client.clone(), url)));
        }
        if let Some(url) = &config.chat_webhook {
            notifiers.push(Arc::new(ChatNotifier::new(client.clone(), url)));
        }
        match (&config.email_api_url, config.email_to.is_empty()) {
            (Some(url), false) => notifiers.push(Arc::new(EmailNotifier::new(
                client,
                url,
                config.email_to.clone(),
            ))),
            (None, false) => warn!("NOTIFY_EMAIL_TO is set without NOTIFY_EMAIL_API_URL, email disabled"),
            _ => {}
        }
        Ok(Self { notifiers })
    }

    pub fn channels(&self) -> Vec<&'static str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }

    /// Deliver to every channel. Returns how many channels succeeded.
    pub async fn notify(&self, notification: &Notification) -> usize {
        let results = futures::future::join_all(
            self.notifiers.iter().map(|n| async move { (n.name(), n.send(notification).await) }),
        )
        .await;

        let mut delivered = 0;
        for (channel, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(channel, title = %notification.title, "Notification delivery failed: {}", e),
            }
        }
        delivered
    }
}
