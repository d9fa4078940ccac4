//! Administrative notifications
//!
//! Delivery is fire-and-forget: pipeline code calls [`notify_quietly`], which
//! logs and swallows delivery failures.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::JobExecution;
use crate::types::NotificationConfig;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification relay request failed: {0}")]
    Transport(String),

    #[error("Notification relay returned status {0}")]
    Rejected(u16),
}

/// Message sent to the administrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    QuotaExceeded {
        used: i64,
        limit: i64,
        month: u32,
        year: i32,
    },
    QuotaOverrideChanged {
        enabled: bool,
        used: i64,
        limit: i64,
    },
    QuotaReset {
        month: u32,
        year: i32,
        limit: i64,
    },
    JobSummary {
        execution: Box<JobExecution>,
        next_run_at: Option<DateTime<Utc>>,
    },
}

impl Notification {
    pub fn subject(&self) -> String {
        match self {
            Notification::QuotaExceeded { month, year, .. } => {
                format!("Profile API quota exceeded for {}/{}", month, year)
            }
            Notification::QuotaOverrideChanged { enabled: true, .. } => {
                "Profile API quota override enabled".to_string()
            }
            Notification::QuotaOverrideChanged { enabled: false, .. } => {
                "Profile API quota override disabled".to_string()
            }
            Notification::QuotaReset { month, year, .. } => {
                format!("Profile API quota reset for {}/{}", month, year)
            }
            Notification::JobSummary { execution, .. } => {
                format!("{} finished: {}", execution.job_name, execution.status)
            }
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::QuotaExceeded { used, limit, .. } => format!(
                "The monthly profile API quota has been reached ({}/{} calls). \
                 Scheduled fetches stop until the next reset unless the override is enabled.",
                used, limit
            ),
            Notification::QuotaOverrideChanged { enabled, used, limit } => format!(
                "Quota override is now {}. Current usage: {}/{} calls.",
                if *enabled { "on" } else { "off" },
                used,
                limit
            ),
            Notification::QuotaReset { limit, .. } => {
                format!("A new quota period has started with a limit of {} calls.", limit)
            }
            Notification::JobSummary {
                execution,
                next_run_at,
            } => {
                let mut body = format!(
                    "Processed {} entries ({} succeeded, {} failed) in {:.1}s.\n\
                     API calls made: {}. Quota remaining: {}.",
                    execution.total_processed,
                    execution.successful_count,
                    execution.failed_count,
                    execution.duration_seconds,
                    execution.api_calls_made,
                    execution.quota_remaining,
                );
                if let Some(errors) = &execution.error_summary {
                    body.push_str("\nErrors: ");
                    body.push_str(&truncate(errors, 500));
                }
                if let Some(next) = next_run_at {
                    body.push_str(&format!("\nNext run: {}", next.to_rfc3339()));
                }
                body
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

/// Outbound channel for [`Notification`]s.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Send and log, never fail the caller.
pub async fn notify_quietly(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.send(&notification).await {
        log::warn!(
            "Failed to deliver notification '{}': {}",
            notification.subject(),
            e
        );
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        log::info!("[notify] {}: {}", notification.subject(), notification.body());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    to: &'a str,
    from: &'a str,
    subject: String,
    body: String,
}

/// Posts `{to, from, subject, body}` JSON to an email relay.
pub struct WebhookNotifier {
    client: reqwest::Client,
    relay_url: String,
    to: String,
    from: String,
}

impl WebhookNotifier {
    /// Every relay request is bounded by `timeout`; a stalled relay surfaces
    /// as a transport error instead of holding up the caller.
    pub fn new(
        relay_url: String,
        to: String,
        from: String,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(format!("failed to build relay client: {}", e)))?;
        Ok(Self {
            client,
            relay_url,
            to,
            from,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = RelayMessage {
            to: &self.to,
            from: &self.from,
            subject: notification.subject(),
            body: notification.body(),
        };
        let resp = self
            .client
            .post(&self.relay_url)
            .json(&message)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Relay notifier when a relay URL and admin address are configured,
/// otherwise the log notifier.
pub fn notifier_from_config(config: &NotificationConfig) -> Box<dyn Notifier> {
    let url = match &config.relay_url {
        Some(url) if !url.is_empty() && !config.admin_email.is_empty() => url,
        _ => return Box::new(LogNotifier),
    };
    match WebhookNotifier::new(
        url.clone(),
        config.admin_email.clone(),
        config.from_address.clone(),
        Duration::from_secs(config.timeout_secs.max(1)),
    ) {
        Ok(notifier) => Box::new(notifier),
        Err(e) => {
            log::warn!("{}; notifications will only be logged", e);
            Box::new(LogNotifier)
        }
    }
}
