use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use launch_orchestrator::{
    deployment::{
        Benchmark, BenchmarkFinding, DeploymentEnvironment, Deployer, HealthCheckResult,
        HealthProbe, InMemoryTrafficRouter, TrafficRouter, TrafficWeights,
    },
    migration::{InMemoryTargetStore, InsertOutcome, TargetRecord, TargetStore},
    AppError, Result,
};

/// Reports green unhealthy once its traffic share reaches `fail_at`.
pub struct WeightAwareProbe {
    router: Arc<dyn TrafficRouter>,
    fail_at: Option<u8>,
    calls: AtomicUsize,
}

impl WeightAwareProbe {
    pub fn healthy(router: Arc<dyn TrafficRouter>) -> Self {
        Self {
            router,
            fail_at: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(router: Arc<dyn TrafficRouter>, green_weight: u8) -> Self {
        Self {
            router,
            fail_at: Some(green_weight),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for WeightAwareProbe {
    async fn probe(&self, endpoint: &str) -> Result<HealthCheckResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let green = self.router.current_weights().await?.green;
        match self.fail_at {
            Some(threshold) if green >= threshold => Ok(HealthCheckResult::unhealthy(
                endpoint,
                1,
                format!("HTTP 503 Service Unavailable at {}% green", green),
            )),
            _ => Ok(HealthCheckResult::healthy(endpoint, 1, Some("HTTP 200 OK".to_string()))),
        }
    }
}

/// Records every deploy and optionally fails or hangs.
#[derive(Default)]
pub struct MockDeployer {
    pub fail: bool,
    pub delay: Option<Duration>,
    deployed: tokio::sync::Mutex<Vec<(String, DeploymentEnvironment)>>,
}

impl MockDeployer {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn hanging(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn deployed(&self) -> Vec<(String, DeploymentEnvironment)> {
        self.deployed.lock().await.clone()
    }
}

#[async_trait]
impl Deployer for MockDeployer {
    async fn deploy(&self, build: &str, environment: DeploymentEnvironment) -> Result<()> {
        self.deployed.lock().await.push((build.to_string(), environment));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(AppError::DeploymentFailed("image pull failed".to_string()));
        }
        Ok(())
    }
}

/// Applies forward shifts but refuses to restore blue.
pub struct RestoreRefusingRouter {
    inner: InMemoryTrafficRouter,
}

impl RestoreRefusingRouter {
    pub fn new() -> Self {
        Self {
            inner: InMemoryTrafficRouter::new(),
        }
    }
}

#[async_trait]
impl TrafficRouter for RestoreRefusingRouter {
    async fn apply_weights(&self, weights: TrafficWeights) -> Result<()> {
        if weights == TrafficWeights::all_blue() {
            return Err(AppError::TrafficRoutingError(
                "admin socket refused connection".to_string(),
            ));
        }
        self.inner.apply_weights(weights).await
    }

    async fn current_weights(&self) -> Result<TrafficWeights> {
        self.inner.current_weights().await
    }
}

/// Always reports a latency regression.
pub struct RegressingBenchmark {
    runs: AtomicUsize,
}

impl RegressingBenchmark {
    pub fn new() -> Self {
        Self {
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Benchmark for RegressingBenchmark {
    async fn run(&self, green_weight: u8) -> Result<BenchmarkFinding> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(launch_orchestrator::deployment::benchmark::evaluate(
            green_weight,
            10,
            0,
            1_250.0,
            500.0,
        ))
    }
}

/// Target store whose writes fail for chosen migration ids until healed.
pub struct FlakyTargetStore {
    inner: InMemoryTargetStore,
    failing_ids: tokio::sync::RwLock<HashSet<String>>,
    healed: AtomicBool,
}

impl FlakyTargetStore {
    pub fn failing_for(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: InMemoryTargetStore::new(),
            failing_ids: tokio::sync::RwLock::new(ids.into_iter().collect()),
            healed: AtomicBool::new(false),
        }
    }

    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryTargetStore {
        &self.inner
    }
}

#[async_trait]
impl TargetStore for FlakyTargetStore {
    async fn find_by_migration_id(&self, table: &str, migration_id: &str) -> Result<Option<TargetRecord>> {
        self.inner.find_by_migration_id(table, migration_id).await
    }

    async fn insert_if_absent(&self, record: TargetRecord) -> Result<InsertOutcome> {
        if !self.healed.load(Ordering::SeqCst)
            && self.failing_ids.read().await.contains(&record.migration_id)
        {
            return Err(AppError::TargetStoreError("write timed out".to_string()));
        }
        self.inner.insert_if_absent(record).await
    }
}

/// Target store that cannot be reached for one table.
pub struct UnreachableTableStore {
    inner: InMemoryTargetStore,
    table: String,
}

impl UnreachableTableStore {
    pub fn new(table: &str) -> Self {
        Self {
            inner: InMemoryTargetStore::new(),
            table: table.to_string(),
        }
    }

    pub fn inner(&self) -> &InMemoryTargetStore {
        &self.inner
    }
}

#[async_trait]
impl TargetStore for UnreachableTableStore {
    async fn find_by_migration_id(&self, table: &str, migration_id: &str) -> Result<Option<TargetRecord>> {
        if table == self.table {
            return Err(AppError::TargetStoreError(format!("connection to {} reset", table)));
        }
        self.inner.find_by_migration_id(table, migration_id).await
    }

    async fn insert_if_absent(&self, record: TargetRecord) -> Result<InsertOutcome> {
        self.inner.insert_if_absent(record).await
    }
}
