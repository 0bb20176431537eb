//! Rollout Controller
//!
//! Drives one blue/green cutover per domain: deploy green, gate on health,
//! shift traffic along the weight schedule, watch the final window, and fall
//! back to blue through the rollback executor on any failure or operator abort.
//!
//! The `RolloutState` value lives in the run and is only changed through
//! [`RolloutController::transition`]; the shared [`RolloutStatus`] is a
//! read-only mirror for the control API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::benchmark::{Benchmark, BenchmarkFinding};
use super::deployer::Deployer;
use super::health_checks::{HealthMonitor, PollOutcome};
use super::rollback::{RollbackExecutor, RollbackOutcome};
use super::state::{DeploymentEnvironment, RolloutState, RolloutTransition};
use super::traffic_router::{TrafficRouter, TrafficWeights};
use crate::config::RolloutConfig;
use crate::error::{AppError, Result};
use crate::services::alerting::{send_alert, AlertEvent, AlertSeverity, AlertSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutOutcome {
    Completed,
    /// Validation or deploy failure before any traffic moved.
    FailedBeforeShift,
    RolledBack,
    /// Rollback attempted but traffic could not be restored.
    RollbackFailed,
    Cancelled,
}

impl RolloutOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RolloutOutcome::Completed => 0,
            RolloutOutcome::FailedBeforeShift => 1,
            RolloutOutcome::RolledBack | RolloutOutcome::RollbackFailed => 2,
            RolloutOutcome::Cancelled => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutReport {
    pub rollout_id: String,
    pub domain: String,
    pub build: String,
    pub final_state: RolloutState,
    pub outcome: RolloutOutcome,
    pub exit_code: u8,
    /// Last known traffic split.
    pub weights: TrafficWeights,
    pub transitions: Vec<RolloutTransition>,
    pub benchmark_findings: Vec<BenchmarkFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What the control API shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    pub domain: String,
    pub state: RolloutState,
    pub rollout_id: Option<String>,
    pub build: Option<String>,
    pub weights: TrafficWeights,
    pub transitions: Vec<RolloutTransition>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_report: Option<RolloutReport>,
}

impl RolloutStatus {
    fn idle(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            state: RolloutState::Idle,
            rollout_id: None,
            build: None,
            weights: TrafficWeights::all_blue(),
            transitions: Vec::new(),
            started_at: None,
            last_report: None,
        }
    }
}

/// Why the forward path stopped.
#[derive(Debug)]
enum Halt {
    Failed(AppError),
    Rollback { reason: String, cancelled: bool },
}

struct RolloutRun {
    rollout_id: String,
    build: String,
    state: RolloutState,
    weights: TrafficWeights,
    transitions: Vec<RolloutTransition>,
    findings: Vec<BenchmarkFinding>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

impl RolloutRun {
    fn traffic_shifted(&self) -> bool {
        self.weights.green > 0
            || matches!(
                self.state,
                RolloutState::ShiftingTraffic(_) | RolloutState::Monitoring
            )
    }
}

/// Domains with a rollout in flight, shared by every controller in the process.
static ACTIVE_DOMAINS: OnceLock<std::sync::Mutex<HashSet<String>>> = OnceLock::new();

fn active_domains() -> &'static std::sync::Mutex<HashSet<String>> {
    ACTIVE_DOMAINS.get_or_init(|| std::sync::Mutex::new(HashSet::new()))
}

/// Holds a domain for one rollout; released on drop.
struct DomainClaim {
    domain: String,
}

impl DomainClaim {
    fn acquire(domain: &str) -> Option<Self> {
        let mut active = active_domains().lock().unwrap_or_else(PoisonError::into_inner);
        if active.insert(domain.to_string()) {
            Some(Self {
                domain: domain.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for DomainClaim {
    fn drop(&mut self) {
        active_domains()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.domain);
    }
}

pub struct RolloutController {
    config: RolloutConfig,
    deployer: Arc<dyn Deployer>,
    monitor: Arc<HealthMonitor>,
    router: Arc<dyn TrafficRouter>,
    alerts: Arc<dyn AlertSink>,
    benchmark: Option<Arc<dyn Benchmark>>,
    rollback: RollbackExecutor,
    status: Arc<RwLock<RolloutStatus>>,
    active_abort: RwLock<Option<CancellationToken>>,
}

impl RolloutController {
    pub fn new(
        config: RolloutConfig,
        deployer: Arc<dyn Deployer>,
        monitor: Arc<HealthMonitor>,
        router: Arc<dyn TrafficRouter>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let rollback = RollbackExecutor::new(router.clone(), alerts.clone(), config.rollback_timeout());
        let status = Arc::new(RwLock::new(RolloutStatus::idle(&config.domain)));
        Self {
            config,
            deployer,
            monitor,
            router,
            alerts,
            benchmark: None,
            rollback,
            status,
            active_abort: RwLock::new(None),
        }
    }

    pub fn with_benchmark(mut self, benchmark: Arc<dyn Benchmark>) -> Self {
        self.benchmark = Some(benchmark);
        self
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub async fn status(&self) -> RolloutStatus {
        self.status.read().await.clone()
    }

    /// Requests an abort. Honored at the next step boundary, through the
    /// regular rollback path.
    pub async fn abort(&self) -> Result<()> {
        match self.active_abort.read().await.as_ref() {
            Some(token) => {
                warn!(domain = %self.config.domain, "🛑 Operator abort requested");
                token.cancel();
                Ok(())
            }
            None => Err(AppError::NotFound(format!(
                "no rollout in progress for {}",
                self.config.domain
            ))),
        }
    }

    /// Runs a rollout to a terminal state. Only a concurrent start is an
    /// `Err`; every other failure is described by the returned report.
    pub async fn start(&self, build: Option<&str>) -> Result<RolloutReport> {
        let _claim = DomainClaim::acquire(&self.config.domain).ok_or_else(|| {
            warn!(domain = %self.config.domain, "Rejecting rollout, another one is in progress");
            AppError::RolloutInProgress(self.config.domain.clone())
        })?;

        let cancel = CancellationToken::new();
        *self.active_abort.write().await = Some(cancel.clone());

        let mut run = RolloutRun {
            rollout_id: Uuid::new_v4().to_string(),
            build: build.unwrap_or(self.config.build.as_str()).to_string(),
            state: RolloutState::Idle,
            weights: TrafficWeights::all_blue(),
            transitions: Vec::new(),
            findings: Vec::new(),
            cancel,
            started_at: Utc::now(),
        };

        {
            let mut status = self.status.write().await;
            *status = RolloutStatus {
                rollout_id: Some(run.rollout_id.clone()),
                build: Some(run.build.clone()),
                started_at: Some(run.started_at),
                last_report: status.last_report.take(),
                ..RolloutStatus::idle(&self.config.domain)
            };
        }

        info!(
            domain = %self.config.domain,
            rollout_id = %run.rollout_id,
            build = %run.build,
            schedule = ?self.config.weight_schedule,
            "🚀 Starting rollout"
        );

        let result = self.drive(&mut run).await;
        let (outcome, error) = self.conclude(&mut run, result).await;

        let report = RolloutReport {
            rollout_id: run.rollout_id.clone(),
            domain: self.config.domain.clone(),
            build: run.build.clone(),
            final_state: run.state,
            outcome,
            exit_code: outcome.exit_code(),
            weights: run.weights,
            transitions: run.transitions.clone(),
            benchmark_findings: run.findings.clone(),
            error,
            started_at: run.started_at,
            finished_at: Utc::now(),
        };

        info!(
            domain = %report.domain,
            rollout_id = %report.rollout_id,
            final_state = %report.final_state,
            outcome = ?report.outcome,
            blue_weight = report.weights.blue,
            green_weight = report.weights.green,
            "🏁 Rollout finished"
        );

        *self.active_abort.write().await = None;
        {
            let mut status = self.status.write().await;
            status.state = RolloutState::Idle;
            status.last_report = Some(report.clone());
        }
        debug!(domain = %self.config.domain, "Rollout state reset to Idle");

        Ok(report)
    }

    async fn drive(&self, run: &mut RolloutRun) -> std::result::Result<(), Halt> {
        self.transition(run, RolloutState::DeployingGreen, "rollout started").await?;
        send_alert(
            self.alerts.as_ref(),
            AlertEvent::new("DeployingGreen", "started", format!("deploying build {} to green", run.build))
                .with_rollout(&self.config.domain, &run.rollout_id),
        )
        .await;

        let deploy_timeout = self.config.deploy_timeout();
        match tokio::time::timeout(
            deploy_timeout,
            self.deployer.deploy(&run.build, DeploymentEnvironment::Green),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Halt::Failed(e)),
            Err(_) => return Err(Halt::Failed(AppError::Timeout(deploy_timeout.as_millis() as u64))),
        }

        self.checkpoint(run)?;
        self.transition(run, RolloutState::HealthCheckingGreen, "green deployed").await?;

        let report = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(Self::operator_abort()),
            report = self.monitor.check_all(&self.config.green_health_endpoints) => report,
        };
        if let Some(reason) = report.failure_reason() {
            return Err(Halt::Failed(AppError::HealthCheckFailed(reason)));
        }

        for &weight in &self.config.weight_schedule {
            self.checkpoint(run)?;
            self.transition(
                run,
                RolloutState::ShiftingTraffic(weight),
                format!("shifting {}% of traffic to green", weight),
            )
            .await?;

            let weights = TrafficWeights::green(weight).map_err(Halt::Failed)?;
            self.apply_weights(run, weights).await?;
            self.observe(run, weight, self.config.step_pause(), true).await?;
        }

        self.checkpoint(run)?;
        self.transition(run, RolloutState::Monitoring, "green carries all traffic").await?;
        self.observe(run, 100, self.config.monitor_window(), false).await?;

        self.checkpoint(run)?;
        self.transition(run, RolloutState::Complete, "monitor window passed").await?;
        send_alert(
            self.alerts.as_ref(),
            AlertEvent::new("Complete", "success", format!("build {} serves 100% of traffic", run.build))
                .with_rollout(&self.config.domain, &run.rollout_id),
        )
        .await;

        Ok(())
    }

    async fn conclude(
        &self,
        run: &mut RolloutRun,
        result: std::result::Result<(), Halt>,
    ) -> (RolloutOutcome, Option<String>) {
        match result {
            Ok(()) => (RolloutOutcome::Completed, None),
            Err(Halt::Failed(e)) if !run.traffic_shifted() => {
                let reason = e.to_string();
                error!(domain = %self.config.domain, state = %run.state, error = %reason, "❌ Rollout failed before any traffic shift");
                if let Err(halt) = self.transition(run, RolloutState::Failed, reason.clone()).await {
                    error!(?halt, "Could not record failure");
                }
                send_alert(
                    self.alerts.as_ref(),
                    AlertEvent::new("Failed", "failed_before_shift", reason.clone())
                        .with_severity(AlertSeverity::Warning)
                        .with_rollout(&self.config.domain, &run.rollout_id),
                )
                .await;
                (RolloutOutcome::FailedBeforeShift, Some(reason))
            }
            Err(Halt::Failed(e)) => self.roll_back(run, e.to_string(), false).await,
            Err(Halt::Rollback { reason, cancelled }) => self.roll_back(run, reason, cancelled).await,
        }
    }

    async fn roll_back(
        &self,
        run: &mut RolloutRun,
        reason: String,
        cancelled: bool,
    ) -> (RolloutOutcome, Option<String>) {
        if let Err(halt) = self.transition(run, RolloutState::RollingBack, reason.clone()).await {
            error!(?halt, "Could not record rollback start");
        }

        let outcome = self
            .rollback
            .execute(&self.config.domain, &run.rollout_id, &reason)
            .await;

        let result = match outcome {
            RollbackOutcome::Restored => {
                run.weights = TrafficWeights::all_blue();
                self.status.write().await.weights = run.weights;
                if cancelled {
                    (RolloutOutcome::Cancelled, Some(reason))
                } else {
                    (RolloutOutcome::RolledBack, Some(reason))
                }
            }
            RollbackOutcome::Failed { error } => {
                error!(
                    blue_weight = run.weights.blue,
                    green_weight = run.weights.green,
                    "Last known traffic split before failed rollback"
                );
                (
                    RolloutOutcome::RollbackFailed,
                    Some(format!("{}; rollback failed: {}", reason, error)),
                )
            }
        };

        if let Err(halt) = self.transition(run, RolloutState::Failed, "rollback finished").await {
            error!(?halt, "Could not record rollback end");
        }
        result
    }

    /// Moves the run to `to`, rejecting transitions the state machine forbids.
    async fn transition(
        &self,
        run: &mut RolloutRun,
        to: RolloutState,
        reason: impl Into<String>,
    ) -> std::result::Result<(), Halt> {
        let from = run.state;
        if !from.can_transition_to(to) {
            return Err(Halt::Failed(AppError::ValidationFailed(format!(
                "illegal rollout transition {} -> {}",
                from, to
            ))));
        }

        let transition = RolloutTransition {
            from,
            to,
            at: Utc::now(),
            reason: reason.into(),
        };
        info!(
            domain = %self.config.domain,
            from = %from,
            to = %to,
            reason = %transition.reason,
            "🔄 Rollout state transition"
        );

        run.state = to;
        run.transitions.push(transition.clone());

        let mut status = self.status.write().await;
        status.state = to;
        status.transitions.push(transition);
        Ok(())
    }

    fn checkpoint(&self, run: &RolloutRun) -> std::result::Result<(), Halt> {
        if run.cancel.is_cancelled() {
            Err(Self::operator_abort())
        } else {
            Ok(())
        }
    }

    fn operator_abort() -> Halt {
        Halt::Rollback {
            reason: "aborted by operator".to_string(),
            cancelled: true,
        }
    }

    async fn apply_weights(&self, run: &mut RolloutRun, weights: TrafficWeights) -> std::result::Result<(), Halt> {
        let bound = self.config.rollback_timeout();
        let applied = match tokio::time::timeout(bound, self.router.apply_weights(weights)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(bound.as_millis() as u64)),
        };

        if let Err(e) = applied {
            return Err(Halt::Rollback {
                reason: format!(
                    "failed to apply {}/{} split: {}",
                    weights.blue, weights.green, e
                ),
                cancelled: false,
            });
        }

        run.weights = weights;
        self.status.write().await.weights = weights;
        info!(
            domain = %self.config.domain,
            blue_weight = weights.blue,
            green_weight = weights.green,
            "⚖️ Traffic weights updated"
        );
        Ok(())
    }

    /// Polls green health over `window`, with the optional benchmark running
    /// alongside. Only the health poll can stop the rollout.
    async fn observe(
        &self,
        run: &mut RolloutRun,
        weight: u8,
        window: Duration,
        with_benchmark: bool,
    ) -> std::result::Result<(), Halt> {
        let monitor = self.monitor.clone();
        let endpoints = self.config.green_health_endpoints.clone();
        let interval = self.config.poll_interval();
        let poll_token = run.cancel.child_token();
        let task_token = poll_token.clone();
        let poll = tokio::spawn(async move { monitor.poll(&endpoints, interval, window, task_token).await });

        let benchmark = self
            .benchmark
            .clone()
            .filter(|_| with_benchmark)
            .map(|benchmark| tokio::spawn(async move { benchmark.run(weight).await }));

        let outcome = await_poll(poll, self.poll_budget(window), &poll_token).await;

        if let Some(handle) = benchmark {
            if matches!(outcome, PollOutcome::Healthy) {
                self.collect_benchmark(run, weight, handle).await;
            } else {
                handle.abort();
            }
        }

        match outcome {
            PollOutcome::Healthy => Ok(()),
            PollOutcome::Unhealthy { reason } => {
                warn!(domain = %self.config.domain, green_weight = weight, reason = %reason, "Green unhealthy");
                Err(Halt::Rollback {
                    reason: format!("green unhealthy at {}%: {}", weight, reason),
                    cancelled: false,
                })
            }
            PollOutcome::Aborted => Err(Self::operator_abort()),
        }
    }

    async fn collect_benchmark(
        &self,
        run: &mut RolloutRun,
        weight: u8,
        handle: tokio::task::JoinHandle<Result<BenchmarkFinding>>,
    ) {
        let grace = self.config.health_check_timeout();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(Ok(finding))) => {
                if !finding.passed {
                    warn!(green_weight = weight, details = %finding.details, "Benchmark regression (advisory)");
                }
                run.findings.push(finding);
            }
            Ok(Ok(Err(e))) => warn!(green_weight = weight, error = %e, "Benchmark failed (advisory)"),
            Ok(Err(e)) => warn!(green_weight = weight, error = %e, "Benchmark task failed (advisory)"),
            Err(_) => warn!(green_weight = weight, "Benchmark still running, result dropped"),
        }
    }

    /// Upper bound on a poll: the window plus two full retrying check rounds.
    fn poll_budget(&self, window: Duration) -> Duration {
        let attempts = self.config.health_check_retries.max(1);
        let per_round = (self.config.health_check_timeout() + self.config.retry_delay()) * attempts;
        window + per_round * 2
    }
}

/// Waits for a spawned poll for at most `budget`. A poll that overruns is
/// cancelled through its token and counts as unhealthy.
async fn await_poll(
    poll: JoinHandle<PollOutcome>,
    budget: Duration,
    poll_token: &CancellationToken,
) -> PollOutcome {
    match tokio::time::timeout(budget, poll).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_error)) => PollOutcome::Unhealthy {
            reason: format!("health poll task failed: {}", join_error),
        },
        Err(_) => {
            poll_token.cancel();
            PollOutcome::Unhealthy {
                reason: format!("health poll exceeded its {} ms budget", budget.as_millis()),
            }
        }
    }
}
