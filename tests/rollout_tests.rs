mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use launch_orchestrator::{
    config::RolloutConfig,
    deployment::{
        DeploymentEnvironment, InMemoryTrafficRouter, RolloutOutcome, RolloutState,
        TrafficRouter, TrafficWeights,
    },
    services::{AlertSeverity, MemoryAlertSink},
    AppError,
};

fn phases(report: &launch_orchestrator::deployment::RolloutReport) -> Vec<RolloutState> {
    report.transitions.iter().map(|t| t.to).collect()
}

#[tokio::test]
async fn test_successful_rollout_shifts_all_traffic_to_green() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let alerts = Arc::new(MemoryAlertSink::new());
    let deployer = Arc::new(MockDeployer::succeeding());
    let controller = build_controller(
        fast_rollout_config(),
        deployer.clone(),
        Arc::new(WeightAwareProbe::healthy(router.clone())),
        router.clone(),
        alerts.clone(),
    );

    let report = controller.start(None).await.unwrap();

    assert_eq!(report.outcome, RolloutOutcome::Completed);
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.final_state, RolloutState::Complete);
    assert_eq!(report.weights, TrafficWeights::all_green());
    assert_eq!(router.current_weights().await.unwrap(), TrafficWeights::all_green());
    assert_eq!(
        deployer.deployed().await,
        vec![("build-42".to_string(), DeploymentEnvironment::Green)]
    );

    let greens: Vec<u8> = router.history().await.iter().map(|w| w.green).collect();
    assert_eq!(greens, vec![10, 50, 100]);
    assert!(greens.windows(2).all(|pair| pair[0] < pair[1]));

    assert_eq!(
        phases(&report),
        vec![
            RolloutState::DeployingGreen,
            RolloutState::HealthCheckingGreen,
            RolloutState::ShiftingTraffic(10),
            RolloutState::ShiftingTraffic(50),
            RolloutState::ShiftingTraffic(100),
            RolloutState::Monitoring,
            RolloutState::Complete,
        ]
    );

    assert_eq!(alerts.events_in_phase("Complete").await.len(), 1);
    assert!(alerts.events_in_phase("RollingBack").await.is_empty());
}

#[tokio::test]
async fn test_green_unhealthy_at_half_traffic_rolls_back_once() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let alerts = Arc::new(MemoryAlertSink::new());
    let controller = build_controller(
        fast_rollout_config(),
        Arc::new(MockDeployer::succeeding()),
        Arc::new(WeightAwareProbe::failing_at(router.clone(), 50)),
        router.clone(),
        alerts.clone(),
    );

    let report = controller.start(None).await.unwrap();

    assert_eq!(report.outcome, RolloutOutcome::RolledBack);
    assert_eq!(report.exit_code, 2);
    assert_eq!(report.final_state, RolloutState::Failed);
    assert_eq!(report.weights, TrafficWeights::all_blue());
    assert_eq!(router.current_weights().await.unwrap(), TrafficWeights::all_blue());
    assert!(report.error.as_deref().unwrap_or_default().contains("50%"));

    let greens: Vec<u8> = router.history().await.iter().map(|w| w.green).collect();
    assert_eq!(greens, vec![10, 50, 0]);

    let transitions = phases(&report);
    assert_eq!(
        &transitions[transitions.len() - 3..],
        &[
            RolloutState::ShiftingTraffic(50),
            RolloutState::RollingBack,
            RolloutState::Failed,
        ]
    );

    assert_eq!(alerts.events_in_phase("RollingBack").await.len(), 1);
}

#[tokio::test]
async fn test_deploy_failure_never_touches_traffic() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let alerts = Arc::new(MemoryAlertSink::new());
    let controller = build_controller(
        fast_rollout_config(),
        Arc::new(MockDeployer::failing()),
        Arc::new(WeightAwareProbe::healthy(router.clone())),
        router.clone(),
        alerts.clone(),
    );

    let report = controller.start(None).await.unwrap();

    assert_eq!(report.outcome, RolloutOutcome::FailedBeforeShift);
    assert_eq!(report.exit_code, 1);
    assert_eq!(report.final_state, RolloutState::Failed);
    assert!(router.history().await.is_empty());
    assert!(alerts.events_in_phase("RollingBack").await.is_empty());
    assert!(alerts
        .events_in_phase("Failed")
        .await
        .iter()
        .any(|e| e.outcome == "failed_before_shift"));
}

#[tokio::test]
async fn test_deploy_timeout_fails_before_shift() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let mut config = fast_rollout_config();
    config.deploy_timeout_ms = 50;
    let controller = build_controller(
        config,
        Arc::new(MockDeployer::hanging(Duration::from_secs(5))),
        Arc::new(WeightAwareProbe::healthy(router.clone())),
        router.clone(),
        Arc::new(MemoryAlertSink::new()),
    );

    let report = controller.start(None).await.unwrap();

    assert_eq!(report.exit_code, 1);
    assert!(report.error.as_deref().unwrap_or_default().contains("timed out"));
    assert!(router.history().await.is_empty());
}

#[tokio::test]
async fn test_unhealthy_green_blocks_first_shift() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let probe = Arc::new(WeightAwareProbe::failing_at(router.clone(), 0));
    let controller = build_controller(
        fast_rollout_config(),
        Arc::new(MockDeployer::succeeding()),
        probe.clone(),
        router.clone(),
        Arc::new(MemoryAlertSink::new()),
    );

    let report = controller.start(Some("build-43")).await.unwrap();

    assert_eq!(report.outcome, RolloutOutcome::FailedBeforeShift);
    assert_eq!(report.build, "build-43");
    assert!(router.history().await.is_empty());
    // Every configured attempt was spent before giving up.
    assert_eq!(probe.calls(), 2);
    assert_eq!(
        phases(&report),
        vec![
            RolloutState::DeployingGreen,
            RolloutState::HealthCheckingGreen,
            RolloutState::Failed,
        ]
    );
}

#[tokio::test]
async fn test_operator_abort_restores_blue_with_cancel_exit_code() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let alerts = Arc::new(MemoryAlertSink::new());
    let mut config = fast_rollout_config();
    config.step_pause_ms = 10_000;
    let controller = Arc::new(build_controller(
        config,
        Arc::new(MockDeployer::succeeding()),
        Arc::new(WeightAwareProbe::healthy(router.clone())),
        router.clone(),
        alerts.clone(),
    ));

    let running = controller.clone();
    let handle = tokio::spawn(async move { running.start(None).await });

    wait_for_state(&controller, |state| matches!(state, RolloutState::ShiftingTraffic(_))).await;
    controller.abort().await.unwrap();

    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.outcome, RolloutOutcome::Cancelled);
    assert_eq!(report.exit_code, 3);
    assert_eq!(report.final_state, RolloutState::Failed);
    assert_eq!(router.current_weights().await.unwrap(), TrafficWeights::all_blue());
    assert!(phases(&report).contains(&RolloutState::RollingBack));
    assert_eq!(alerts.events_in_phase("RollingBack").await.len(), 1);

    let status = controller.status().await;
    assert_eq!(status.state, RolloutState::Idle);
    assert_eq!(status.last_report.map(|r| r.exit_code), Some(3));
}

#[tokio::test]
async fn test_abort_without_running_rollout_is_not_found() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let controller = build_controller(
        fast_rollout_config(),
        Arc::new(MockDeployer::succeeding()),
        Arc::new(WeightAwareProbe::healthy(router.clone())),
        router,
        Arc::new(MemoryAlertSink::new()),
    );

    assert!(matches!(controller.abort().await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn test_second_start_rejected_while_rollout_active() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let mut config = fast_rollout_config();
    config.step_pause_ms = 10_000;
    let controller = Arc::new(build_controller(
        config,
        Arc::new(MockDeployer::succeeding()),
        Arc::new(WeightAwareProbe::healthy(router.clone())),
        router.clone(),
        Arc::new(MemoryAlertSink::new()),
    ));

    let running = controller.clone();
    let handle = tokio::spawn(async move { running.start(None).await });
    wait_for_state(&controller, |state| state.is_active()).await;

    let second = controller.start(None).await;
    assert!(matches!(second, Err(AppError::RolloutInProgress(domain)) if domain == controller.domain()));

    controller.abort().await.unwrap();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.exit_code, 3);
}

#[tokio::test]
async fn test_failed_rollback_escalates_critical_alert() {
    let router = Arc::new(RestoreRefusingRouter::new());
    let alerts = Arc::new(MemoryAlertSink::new());
    let controller = build_controller(
        fast_rollout_config(),
        Arc::new(MockDeployer::succeeding()),
        Arc::new(WeightAwareProbe::failing_at(router.clone(), 50)),
        router.clone(),
        alerts.clone(),
    );

    let report = controller.start(None).await.unwrap();

    assert_eq!(report.outcome, RolloutOutcome::RollbackFailed);
    assert_eq!(report.exit_code, 2);
    assert_eq!(report.final_state, RolloutState::Failed);
    // The last split that was actually applied is what gets reported.
    assert_eq!(report.weights, TrafficWeights::green(50).unwrap());
    assert!(alerts
        .events()
        .await
        .iter()
        .any(|e| e.severity == AlertSeverity::Critical && e.outcome == "rollback_failed"));
}

#[tokio::test]
async fn test_benchmark_regression_is_advisory() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let benchmark = Arc::new(RegressingBenchmark::new());
    let controller = build_controller(
        fast_rollout_config(),
        Arc::new(MockDeployer::succeeding()),
        Arc::new(WeightAwareProbe::healthy(router.clone())),
        router.clone(),
        Arc::new(MemoryAlertSink::new()),
    )
    .with_benchmark(benchmark.clone());

    let report = controller.start(None).await.unwrap();

    assert_eq!(report.outcome, RolloutOutcome::Completed);
    assert_eq!(benchmark.runs(), 3);
    assert_eq!(report.benchmark_findings.len(), 3);
    assert!(report.benchmark_findings.iter().all(|f| !f.passed));
    assert_eq!(
        report.benchmark_findings.iter().map(|f| f.green_weight).collect::<Vec<_>>(),
        vec![10, 50, 100]
    );
}

#[tokio::test]
async fn test_status_returns_to_idle_after_completion() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let controller = build_controller(
        fast_rollout_config(),
        Arc::new(MockDeployer::succeeding()),
        Arc::new(WeightAwareProbe::healthy(router.clone())),
        router,
        Arc::new(MemoryAlertSink::new()),
    );

    let report = controller.start(None).await.unwrap();
    let status = controller.status().await;

    assert_eq!(status.state, RolloutState::Idle);
    assert_eq!(status.weights, TrafficWeights::all_green());
    assert_eq!(
        status.last_report.map(|r| r.rollout_id),
        Some(report.rollout_id)
    );
}

#[tokio::test]
async fn test_second_controller_for_same_domain_is_rejected() {
    let router = Arc::new(InMemoryTrafficRouter::new());
    let mut slow = fast_rollout_config();
    slow.step_pause_ms = 10_000;
    let mut fast = fast_rollout_config();
    fast.domain = slow.domain.clone();

    let make = |config: RolloutConfig| {
        Arc::new(build_controller(
            config,
            Arc::new(MockDeployer::succeeding()),
            Arc::new(WeightAwareProbe::healthy(router.clone())),
            router.clone(),
            Arc::new(MemoryAlertSink::new()),
        ))
    };
    let first = make(slow);
    let second = make(fast);

    let running = first.clone();
    let handle = tokio::spawn(async move { running.start(None).await });
    wait_for_state(&first, |state| state.is_active()).await;

    let rejected = second.start(None).await;
    assert!(matches!(rejected, Err(AppError::RolloutInProgress(domain)) if domain == first.domain()));
    assert_eq!(second.status().await.state, RolloutState::Idle);

    first.abort().await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap().exit_code, 3);

    // The domain is free again once the first rollout has finished.
    let report = second.start(None).await.unwrap();
    assert_eq!(report.outcome, RolloutOutcome::Completed);
}
