use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use launch_orchestrator::{
    config::RolloutConfig,
    deployment::{Deployer, HealthCheckPolicy, HealthMonitor, HealthProbe, RolloutController, TrafficRouter},
    migration::{ExportPolicy, FieldPolicy, SourceRow},
    services::AlertSink,
};

pub fn row(value: Value) -> SourceRow {
    value.as_object().cloned().expect("fixture rows are objects")
}

/// Three events, the second one with an email that cannot be hashed.
pub fn event_rows() -> Vec<SourceRow> {
    vec![
        row(json!({"id": "evt-1", "email": "ada@example.com", "kind": "signup", "createdAt": "2024-03-01T10:00:00Z"})),
        row(json!({"id": "evt-2", "email": {"primary": "bob@example.com"}, "kind": "signup", "createdAt": "2024-03-01T11:00:00Z"})),
        row(json!({"id": "evt-3", "email": "cy@example.com", "kind": "login", "createdAt": 1709294400000_i64})),
    ]
}

pub fn event_policy() -> ExportPolicy {
    ExportPolicy::new("id")
        .with_field("email", FieldPolicy::OneWayHash)
        .with_timestamp_field("createdAt")
}

pub fn user_rows() -> Vec<SourceRow> {
    vec![
        row(json!({"id": 1, "name": "Ada", "ssn": "123-45-6789", "age": 36})),
        row(json!({"id": 2, "name": "Grace", "ssn": "987-65-4321", "age": 45})),
    ]
}

pub fn user_policy() -> ExportPolicy {
    ExportPolicy::new("id").with_field("ssn", FieldPolicy::ReversibleEncrypt)
}

/// Millisecond-scale timings so a whole rollout finishes well under a second.
/// Each call gets its own domain, since rollouts are exclusive per domain
/// across the whole process.
pub fn fast_rollout_config() -> RolloutConfig {
    RolloutConfig {
        domain: format!("shop-{}.example.com", Uuid::new_v4().simple()),
        build: "build-42".to_string(),
        deploy_timeout_ms: 1_000,
        green_health_endpoints: vec!["http://green.test/health".to_string()],
        health_check_timeout_ms: 200,
        health_check_retries: 2,
        retry_delay_ms: 10,
        weight_schedule: vec![10, 50, 100],
        step_pause_ms: 60,
        poll_interval_ms: 20,
        monitor_window_ms: 60,
        rollback_timeout_ms: 500,
        ..RolloutConfig::default()
    }
}

pub fn build_controller(
    config: RolloutConfig,
    deployer: Arc<dyn Deployer>,
    probe: Arc<dyn HealthProbe>,
    router: Arc<dyn TrafficRouter>,
    alerts: Arc<dyn AlertSink>,
) -> RolloutController {
    let monitor = Arc::new(HealthMonitor::new(probe, HealthCheckPolicy::from(&config)));
    RolloutController::new(config, deployer, monitor, router, alerts)
}
