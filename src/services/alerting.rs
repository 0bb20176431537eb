use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A rollout lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub phase: String,
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
    pub severity: AlertSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_id: Option<String>,
}

impl AlertEvent {
    pub fn new(phase: impl Into<String>, outcome: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            outcome: outcome.into(),
            timestamp: Utc::now(),
            detail: detail.into(),
            severity: AlertSeverity::Info,
            domain: None,
            rollout_id: None,
        }
    }

    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_rollout(mut self, domain: impl Into<String>, rollout_id: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self.rollout_id = Some(rollout_id.into());
        self
    }
}

/// Where rollout notifications go. Delivery failures are returned to the
/// caller, which logs them and carries on.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Result<()>;
    fn sink_id(&self) -> String;
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        match event.severity {
            AlertSeverity::Info => info!(
                phase = %event.phase,
                outcome = %event.outcome,
                domain = ?event.domain,
                "📣 {}",
                event.detail
            ),
            AlertSeverity::Warning => warn!(
                phase = %event.phase,
                outcome = %event.outcome,
                domain = ?event.domain,
                "📣 {}",
                event.detail
            ),
            AlertSeverity::Critical => error!(
                phase = %event.phase,
                outcome = %event.outcome,
                domain = ?event.domain,
                "🚨 {}",
                event.detail
            ),
        }
        Ok(())
    }

    fn sink_id(&self) -> String {
        "log".to_string()
    }
}

/// Posts each event as JSON to an HTTP endpoint.
pub struct WebhookAlertSink {
    client: Client,
    url: String,
    timeout: Duration,
}

impl WebhookAlertSink {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await
            .map_err(|e| AppError::AlertDeliveryFailed(format!("webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::AlertDeliveryFailed(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn sink_id(&self) -> String {
        format!("webhook:{}", self.url)
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemoryAlertSink {
    events: RwLock<Vec<AlertEvent>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AlertEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_in_phase(&self, phase: &str) -> Vec<AlertEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.phase == phase)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    fn sink_id(&self) -> String {
        "memory".to_string()
    }
}

/// Delivers to every registered sink. One sink failing does not stop the others.
#[derive(Default)]
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, sink: Arc<dyn AlertSink>) -> Self {
        info!("Subscribing alert sink: {}", sink.sink_id());
        self.sinks.push(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl AlertSink for FanoutAlertSink {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event).await {
                error!("Alert sink {} failed to deliver: {}", sink.sink_id(), e);
                failures.push(format!("{}: {}", sink.sink_id(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::AlertDeliveryFailed(failures.join(", ")))
        }
    }

    fn sink_id(&self) -> String {
        "fanout".to_string()
    }
}

/// Sends an alert and logs, rather than propagates, a delivery failure.
pub async fn send_alert(sink: &dyn AlertSink, event: AlertEvent) {
    if let Err(e) = sink.notify(&event).await {
        warn!(phase = %event.phase, error = %e, "Alert delivery failed");
    }
}
