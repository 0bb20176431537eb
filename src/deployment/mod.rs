//! Blue/green rollout: state machine, traffic routing, health gating and the
//! single rollback path.

pub mod benchmark;
pub mod controller;
pub mod deployer;
pub mod health_checks;
pub mod rollback;
pub mod state;
pub mod traffic_router;

pub use benchmark::{Benchmark, BenchmarkFinding, HttpLatencyBenchmark};
pub use controller::{RolloutController, RolloutOutcome, RolloutReport, RolloutStatus};
pub use deployer::{CommandDeployer, Deployer, NoopDeployer};
pub use health_checks::{
    HealthCheckPolicy, HealthCheckResult, HealthMonitor, HealthProbe, HealthReport, HealthSignal,
    HttpHealthProbe, PollOutcome,
};
pub use rollback::{RollbackExecutor, RollbackOutcome};
pub use state::{DeploymentEnvironment, RolloutState, RolloutTransition};
pub use traffic_router::{HAProxyAdapter, InMemoryTrafficRouter, TrafficRouter, TrafficWeights};
