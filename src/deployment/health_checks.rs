//! Health Monitor
//!
//! Produces healthy/unhealthy signals for the rollout controller. A check is
//! one timeout-bounded probe (retried a bounded number of times); a poll
//! repeats checks over a window and stops at the first failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RolloutConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthSignal {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub signal: HealthSignal,
    pub response_time_ms: u64,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn healthy(endpoint: &str, response_time_ms: u64, message: Option<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            signal: HealthSignal::Healthy,
            response_time_ms,
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn unhealthy(endpoint: &str, response_time_ms: u64, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            signal: HealthSignal::Unhealthy,
            response_time_ms,
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.signal == HealthSignal::Healthy
    }
}

/// Outcome of one check round across every endpoint.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub signal: HealthSignal,
    pub results: Vec<HealthCheckResult>,
}

impl HealthReport {
    pub fn failure_reason(&self) -> Option<String> {
        let failures: Vec<String> = self
            .results
            .iter()
            .filter(|r| !r.is_healthy())
            .map(|r| {
                format!(
                    "{}: {}",
                    r.endpoint,
                    r.message.as_deref().unwrap_or("unhealthy")
                )
            })
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Healthy,
    Unhealthy { reason: String },
    /// Cancelled by the caller; neither healthy nor unhealthy.
    Aborted,
}

/// One request against a health endpoint. Timeouts are applied by the monitor.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> Result<HealthCheckResult>;
}

/// Healthy iff the endpoint answers with a 2xx status.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str) -> Result<HealthCheckResult> {
        let start_time = std::time::Instant::now();

        match self.client.get(endpoint).send().await {
            Ok(response) => {
                let response_time = start_time.elapsed().as_millis() as u64;
                let status = response.status();
                if status.is_success() {
                    Ok(HealthCheckResult::healthy(
                        endpoint,
                        response_time,
                        Some(format!("HTTP {}", status)),
                    ))
                } else {
                    Ok(HealthCheckResult::unhealthy(
                        endpoint,
                        response_time,
                        format!("HTTP {}", status),
                    ))
                }
            }
            Err(e) => Ok(HealthCheckResult::unhealthy(
                endpoint,
                start_time.elapsed().as_millis() as u64,
                format!("Request failed: {}", e),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckPolicy {
    pub timeout: Duration,
    /// Attempts per check, at least one.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl From<&RolloutConfig> for HealthCheckPolicy {
    fn from(config: &RolloutConfig) -> Self {
        Self {
            timeout: config.health_check_timeout(),
            retries: config.health_check_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    policy: HealthCheckPolicy,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, policy: HealthCheckPolicy) -> Self {
        Self { probe, policy }
    }

    pub fn policy(&self) -> &HealthCheckPolicy {
        &self.policy
    }

    /// One bounded-timeout probe. A hang or probe error counts as unhealthy.
    pub async fn check(&self, endpoint: &str) -> HealthCheckResult {
        match tokio::time::timeout(self.policy.timeout, self.probe.probe(endpoint)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => HealthCheckResult::unhealthy(endpoint, 0, format!("Check error: {}", e)),
            Err(_) => HealthCheckResult::unhealthy(
                endpoint,
                self.policy.timeout.as_millis() as u64,
                format!(
                    "Health check timed out after {} ms",
                    self.policy.timeout.as_millis()
                ),
            ),
        }
    }

    /// Probes until healthy or the attempt budget is spent.
    pub async fn check_with_retries(&self, endpoint: &str) -> HealthCheckResult {
        let attempts = self.policy.retries.max(1);
        let mut attempt = 1;
        loop {
            let result = self.check(endpoint).await;
            if result.is_healthy() || attempt >= attempts {
                if !result.is_healthy() {
                    warn!(
                        endpoint = endpoint,
                        attempts = attempts,
                        reason = ?result.message,
                        "Endpoint unhealthy after retries"
                    );
                }
                return result;
            }
            debug!(
                endpoint = endpoint,
                attempt = attempt,
                reason = ?result.message,
                "Health check failed, retrying"
            );
            attempt += 1;
            sleep(self.policy.retry_delay).await;
        }
    }

    /// Checks every endpoint concurrently; healthy only if all are.
    pub async fn check_all(&self, endpoints: &[String]) -> HealthReport {
        let results = join_all(endpoints.iter().map(|e| self.check_with_retries(e))).await;
        let signal = if results.iter().all(HealthCheckResult::is_healthy) {
            HealthSignal::Healthy
        } else {
            HealthSignal::Unhealthy
        };
        HealthReport { signal, results }
    }

    /// Repeats `check_all` every `interval` until `window` has elapsed. The
    /// first unhealthy round ends the poll.
    pub async fn poll(
        &self,
        endpoints: &[String],
        interval: Duration,
        window: Duration,
        cancel: CancellationToken,
    ) -> PollOutcome {
        let deadline = Instant::now() + window;
        let mut rounds = 0u32;

        loop {
            let report = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Aborted,
                report = self.check_all(endpoints) => report,
            };
            rounds += 1;

            if let Some(reason) = report.failure_reason() {
                return PollOutcome::Unhealthy { reason };
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(rounds = rounds, "Health poll window passed");
                return PollOutcome::Healthy;
            }

            let pause = interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Aborted,
                _ = sleep(pause) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` probes, then succeeds.
    struct CountingProbe {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self, endpoint: &str) -> Result<HealthCheckResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Ok(HealthCheckResult::unhealthy(endpoint, 1, "HTTP 503"))
            } else {
                Ok(HealthCheckResult::healthy(endpoint, 1, None))
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _endpoint: &str) -> Result<HealthCheckResult> {
            sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    fn policy(retries: u32) -> HealthCheckPolicy {
        HealthCheckPolicy {
            timeout: Duration::from_millis(50),
            retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn monitor(failures: usize, retries: u32) -> (HealthMonitor, Arc<CountingProbe>) {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            failures,
        });
        (HealthMonitor::new(probe.clone(), policy(retries)), probe)
    }

    #[tokio::test]
    async fn test_retries_recover_transient_failure() {
        let (monitor, probe) = monitor(2, 3);
        assert!(monitor.check_with_retries("http://green/health").await.is_healthy());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (monitor, probe) = monitor(10, 3);
        assert!(!monitor.check_with_retries("http://green/health").await.is_healthy());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out_unhealthy() {
        let monitor = HealthMonitor::new(Arc::new(HangingProbe), policy(1));
        let result = monitor.check("http://green/health").await;
        assert!(!result.is_healthy());
        assert!(result.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_poll_fails_fast() {
        let (monitor, probe) = monitor(usize::MAX, 1);
        let outcome = monitor
            .poll(
                &["http://green/health".to_string()],
                Duration::from_millis(5),
                Duration::from_secs(60),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, PollOutcome::Unhealthy { .. }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_healthy_across_window() {
        let (monitor, probe) = monitor(0, 1);
        let outcome = monitor
            .poll(
                &["http://green/health".to_string()],
                Duration::from_millis(5),
                Duration::from_millis(30),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, PollOutcome::Healthy);
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancelled_poll_is_aborted() {
        let (monitor, _) = monitor(0, 1);
        let token = CancellationToken::new();
        token.cancel();
        let outcome = monitor
            .poll(
                &["http://green/health".to_string()],
                Duration::from_millis(5),
                Duration::from_secs(60),
                token,
            )
            .await;
        assert_eq!(outcome, PollOutcome::Aborted);
    }
}
