use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BenchmarkConfig;
use crate::error::{AppError, Result};

/// Result of one benchmark run. Findings are advisory; a failed finding is
/// logged and reported but never blocks a rollout step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkFinding {
    pub green_weight: u8,
    pub samples: u32,
    pub failed_requests: u32,
    pub p95_latency_ms: f64,
    pub threshold_ms: f64,
    pub passed: bool,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Benchmark: Send + Sync {
    async fn run(&self, green_weight: u8) -> Result<BenchmarkFinding>;
}

/// Issues `samples` sequential GETs and compares p95 latency to a threshold.
pub struct HttpLatencyBenchmark {
    client: reqwest::Client,
    endpoint: String,
    samples: u32,
    max_p95_latency_ms: f64,
    request_timeout: Duration,
}

impl HttpLatencyBenchmark {
    pub fn new(client: reqwest::Client, config: &BenchmarkConfig, request_timeout: Duration) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            samples: config.samples.max(1),
            max_p95_latency_ms: config.max_p95_latency_ms as f64,
            request_timeout,
        }
    }
}

#[async_trait]
impl Benchmark for HttpLatencyBenchmark {
    async fn run(&self, green_weight: u8) -> Result<BenchmarkFinding> {
        let mut latencies = Vec::with_capacity(self.samples as usize);
        let mut failed_requests = 0;

        for _ in 0..self.samples {
            let start = Instant::now();
            let outcome = self
                .client
                .get(&self.endpoint)
                .timeout(self.request_timeout)
                .send()
                .await;
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            match outcome {
                Ok(response) if response.status().is_success() => latencies.push(elapsed),
                _ => failed_requests += 1,
            }
        }

        if latencies.is_empty() {
            return Err(AppError::HealthCheckFailed(format!(
                "benchmark against {} got no successful responses",
                self.endpoint
            )));
        }

        let p95 = calculate_percentile(&latencies, 95.0);
        let finding = evaluate(green_weight, self.samples, failed_requests, p95, self.max_p95_latency_ms);

        if finding.passed {
            info!(green_weight = green_weight, p95_latency_ms = p95, "📊 Benchmark passed");
        } else {
            warn!(green_weight = green_weight, p95_latency_ms = p95, "📊 {}", finding.details);
        }
        Ok(finding)
    }
}

pub fn evaluate(
    green_weight: u8,
    samples: u32,
    failed_requests: u32,
    p95_latency_ms: f64,
    threshold_ms: f64,
) -> BenchmarkFinding {
    let passed = p95_latency_ms <= threshold_ms && failed_requests == 0;
    BenchmarkFinding {
        green_weight,
        samples,
        failed_requests,
        p95_latency_ms,
        threshold_ms,
        passed,
        details: format!(
            "P95 latency: {:.2}ms (threshold: {:.2}ms), {} of {} requests failed",
            p95_latency_ms, threshold_ms, failed_requests, samples
        ),
        timestamp: Utc::now(),
    }
}

/// Nearest-rank percentile over unsorted samples.
pub fn calculate_percentile(values: &[f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}
