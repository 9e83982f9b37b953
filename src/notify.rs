//! Notification receivers and per-receiver rate limiting.

use chrono::{DateTime, Duration, Utc};
use color_eyre::eyre::{eyre, Context, Report};
use reqwest::{IntoUrl, Url};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::labels::Labels;
use crate::rule::{AlertEvent, AlertStatus, Severity};

/// One alert inside a notification batch.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationAlert {
    pub status: AlertStatus,
    pub severity: Severity,
    pub labels: Labels,
    pub annotations: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_nan")]
    pub value: f64,
    pub started_at: DateTime<Utc>,
}

fn is_nan(value: &f64) -> bool {
    value.is_nan()
}

impl From<&AlertEvent> for NotificationAlert {
    fn from(event: &AlertEvent) -> Self {
        Self {
            status: event.status,
            severity: event.severity,
            labels: event.labels.clone(),
            annotations: event.annotations.clone(),
            value: event.value,
            started_at: event.started_at,
        }
    }
}

/// One grouped notification: everything a receiver gets per flush.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// firing if any member alert is firing, else resolved
    pub status: AlertStatus,
    pub group_labels: Labels,
    pub alerts: Vec<NotificationAlert>,
}

impl Notification {
    pub fn new(group_labels: Labels, alerts: Vec<NotificationAlert>) -> Self {
        let status = if alerts.iter().any(|a| a.status == AlertStatus::Firing) {
            AlertStatus::Firing
        } else {
            AlertStatus::Resolved
        };
        Self {
            status,
            group_labels,
            alerts,
        }
    }

    fn max_severity(&self) -> Severity {
        self.alerts
            .iter()
            .map(|a| a.severity)
            .max()
            .unwrap_or(Severity::Warning)
    }
}

/// Minimum-gap rate limiter. A dispatch suppressed by the limiter is dropped;
/// the next group flush retries.
#[derive(Debug)]
pub struct RateLimit {
    min_gap: Duration,
    last_sent: Option<DateTime<Utc>>,
    suppressed: u64,
}

impl RateLimit {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_sent: None,
            suppressed: 0,
        }
    }

    /// Returns true and records the send if enough time has passed.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.last_sent {
            Some(last) if now - last < self.min_gap => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

/// A notification sink.
pub enum Receiver {
    /// emit the batch via tracing
    Log { name: String, limit: RateLimit },
    /// POST the batch as JSON
    Webhook {
        name: String,
        url: Url,
        client: reqwest::Client,
        limit: RateLimit,
    },
}

impl Receiver {
    pub fn log(name: impl Into<String>, min_gap: Duration) -> Self {
        Receiver::Log {
            name: name.into(),
            limit: RateLimit::new(min_gap),
        }
    }

    pub fn webhook(
        name: impl Into<String>,
        url: impl IntoUrl,
        min_gap: Duration,
    ) -> Result<Self, Report> {
        Ok(Receiver::Webhook {
            name: name.into(),
            url: url.into_url()?,
            client: reqwest::Client::builder().build()?,
            limit: RateLimit::new(min_gap),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Receiver::Log { name, .. } | Receiver::Webhook { name, .. } => name,
        }
    }

    /// Dispatch one notification, honoring the rate limiter.
    pub async fn notify(&mut self, notification: &Notification, now: DateTime<Utc>) {
        match self {
            Receiver::Log { name, limit } => {
                if !limit.allow(now) {
                    warn!(receiver = %name, "notification suppressed by rate limit");
                    return;
                }
                log_notification(name, notification);
            }
            Receiver::Webhook {
                name,
                url,
                client,
                limit,
            } => {
                if !limit.allow(now) {
                    warn!(receiver = %name, "notification suppressed by rate limit");
                    return;
                }
                if let Err(report) = post_with_retry(client, url, notification).await {
                    warn!(receiver = %name, error = %report, "webhook delivery failed; dropping batch");
                }
            }
        }
    }
}

fn log_notification(name: &str, notification: &Notification) {
    let count = notification.alerts.len();
    let status = notification.status;
    match (status, notification.max_severity()) {
        (AlertStatus::Firing, Severity::Critical) => {
            error!(receiver = %name, group = %notification.group_labels, count, "alerts firing");
        }
        (AlertStatus::Firing, Severity::Warning) => {
            warn!(receiver = %name, group = %notification.group_labels, count, "alerts firing");
        }
        (AlertStatus::Resolved, _) => {
            info!(receiver = %name, group = %notification.group_labels, count, "alerts resolved");
        }
    }
    for alert in &notification.alerts {
        info!(
            receiver = %name,
            status = ?alert.status,
            severity = %alert.severity,
            labels = %alert.labels,
            value = alert.value,
            "  alert"
        );
    }
}

/// POST the payload; one retry after a short backoff, then give up.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &Url,
    notification: &Notification,
) -> Result<(), Report> {
    match post_once(client, url, notification).await {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(error = %first, "webhook post failed; retrying");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            post_once(client, url, notification)
                .await
                .wrap_err("webhook retry")
        }
    }
}

async fn post_once(
    client: &reqwest::Client,
    url: &Url,
    notification: &Notification,
) -> Result<(), Report> {
    let resp = client
        .post(url.clone())
        .json(notification)
        .send()
        .await
        .wrap_err("network request to webhook receiver")?;
    let status = resp.status();
    if !status.is_success() {
        return Err(eyre!("webhook receiver returned {}", status));
    }
    Ok(())
}
