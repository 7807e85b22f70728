/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Notification channels for backup summaries and recovery reports
//!
//! Delivery is strictly fire-and-forget: a channel that cannot deliver
//! logs the failure and the operation that produced the notification
//! continues unaffected.

use crate::config::{NotifyConfig, SmtpConfig};
use crate::error::{CommonError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Severity attached to an outgoing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Warning,
    Critical,
}

/// One outgoing notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, subject, body)
    }

    pub fn warning(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(NotificationKind::Warning, subject, body)
    }

    pub fn critical(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(NotificationKind::Critical, subject, body)
    }
}

/// A single delivery channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;

    /// Short channel name used in delivery logs
    fn name(&self) -> &'static str;
}

/// Posts the notification as JSON to a configured endpoint
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        debug!(url = %self.url, "posting webhook notification");
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| CommonError::delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CommonError::delivery(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Emails the notification through an SMTP relay
pub struct EmailNotifier {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
            .map_err(|e| CommonError::config(format!("smtp relay: {e}")))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self { config, transport })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        for recipient in &self.config.recipients {
            let message = Message::builder()
                .from(
                    self.config
                        .from
                        .parse()
                        .map_err(|e| CommonError::config(format!("from address: {e}")))?,
                )
                .to(recipient
                    .parse()
                    .map_err(|e| CommonError::config(format!("recipient address: {e}")))?)
                .subject(format!("[PassPrint] {}", notification.subject))
                .header(ContentType::TEXT_PLAIN)
                .body(notification.body.clone())
                .map_err(|e| CommonError::delivery(e.to_string()))?;

            self.transport
                .send(message)
                .await
                .map_err(|e| CommonError::delivery(e.to_string()))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

/// All configured channels, dispatched together.
///
/// `dispatch` never fails: delivery errors are logged per channel and
/// swallowed so the backup or recovery operation that produced the
/// notification is unaffected.
#[derive(Default)]
pub struct NotifierSet {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotifierSet {
    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

        if let Some(url) = &config.webhook_url {
            notifiers.push(Box::new(WebhookNotifier::new(url.clone())));
        }
        if let Some(smtp) = &config.smtp {
            match EmailNotifier::new(smtp.clone()) {
                Ok(notifier) => notifiers.push(Box::new(notifier)),
                Err(e) => warn!("email channel disabled: {e}"),
            }
        }

        info!("notification channels configured: {}", notifiers.len());
        Self { notifiers }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub async fn dispatch(&self, notification: &Notification) {
        for notifier in &self.notifiers {
            match notifier.send(notification).await {
                Ok(()) => debug!(channel = notifier.name(), "notification delivered"),
                Err(e) => warn!(
                    channel = notifier.name(),
                    "notification delivery failed: {e}"
                ),
            }
        }
    }
}
