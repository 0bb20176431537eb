use crate::error::{AppError, Result};
use crate::migration::policy::{ExportPolicy, FieldPolicy};
use crate::migration::validate_table_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub logging: LoggingConfig,
    pub migration: MigrationConfig,
    pub stores: StoreConfig,
    pub encryption: EncryptionConfig,
    pub rollout: RolloutConfig,
    pub traffic: TrafficConfig,
    pub alerting: AlertingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub source_system: String,
    pub schema_version: String,
    pub bundle_dir: PathBuf,
    pub parallel_tables: usize,
    /// Key id used for `reversible_encrypt` fields. Only the id is ever written out.
    pub key_id: Option<String>,
    /// Env var holding the pepper mixed into one-way field hashes.
    pub hash_pepper_env: Option<String>,
    pub tables: Vec<TableConfig>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_system: "legacy".to_string(),
            schema_version: crate::migration::SCHEMA_VERSION.to_string(),
            bundle_dir: PathBuf::from("migration-bundles"),
            parallel_tables: 4,
            key_id: None,
            hash_pepper_env: None,
            tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub primary_key: String,
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldPolicy>,
    #[serde(default)]
    pub default_policy: FieldPolicy,
    #[serde(default)]
    pub timestamp_field: Option<String>,
}

impl TableConfig {
    pub fn export_policy(&self) -> ExportPolicy {
        ExportPolicy {
            primary_key: self.primary_key.clone(),
            fields: self.fields.clone(),
            default_policy: self.default_policy,
            timestamp_field: self.timestamp_field.clone(),
        }
    }

    pub fn target_table(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    JsonDir,
    Mongodb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub mongodb_uri: String,
    pub source_database: String,
    pub target_database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::JsonDir,
            source_dir: PathBuf::from("data/source"),
            target_dir: PathBuf::from("data/target"),
            mongodb_uri: "mongodb://localhost:27017".to_string(),
            source_database: "legacy".to_string(),
            target_database: "platform".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Key `K` is read (base64, 32 bytes) from env var `<keys_env_prefix>K`.
    pub keys_env_prefix: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            keys_env_prefix: "ORCHESTRATOR_KEY_".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub domain: String,
    pub build: String,
    pub deploy_command: Option<String>,
    pub deploy_timeout_ms: u64,
    pub green_health_endpoints: Vec<String>,
    pub health_check_timeout_ms: u64,
    pub health_check_retries: u32,
    pub retry_delay_ms: u64,
    pub weight_schedule: Vec<u8>,
    /// Monitoring pause after each weight step.
    pub step_pause_ms: u64,
    pub poll_interval_ms: u64,
    /// Final observation window at 100% green.
    pub monitor_window_ms: u64,
    pub rollback_timeout_ms: u64,
    pub benchmark: BenchmarkConfig,
    pub control_addr: Option<String>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            build: "latest".to_string(),
            deploy_command: None,
            deploy_timeout_ms: 600_000,
            green_health_endpoints: vec!["http://green.internal:8080/health".to_string()],
            health_check_timeout_ms: 5_000,
            health_check_retries: 3,
            retry_delay_ms: 2_000,
            weight_schedule: vec![10, 50, 100],
            step_pause_ms: 300_000,
            poll_interval_ms: 60_000,
            monitor_window_ms: 1_800_000,
            rollback_timeout_ms: 30_000,
            benchmark: BenchmarkConfig::default(),
            control_addr: None,
        }
    }
}

impl RolloutConfig {
    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_millis(self.deploy_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn monitor_window(&self) -> Duration {
        Duration::from_millis(self.monitor_window_ms)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }

    /// Weights must be strictly increasing, within 1..=100, and end at 100.
    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(AppError::ConfigError("rollout.domain is required".to_string()));
        }
        if self.weight_schedule.is_empty() {
            return Err(AppError::ConfigError(
                "rollout.weight_schedule must not be empty".to_string(),
            ));
        }
        let mut previous = 0u8;
        for &weight in &self.weight_schedule {
            if weight == 0 || weight > 100 {
                return Err(AppError::ConfigError(format!(
                    "weight {} outside 1..=100",
                    weight
                )));
            }
            if weight <= previous {
                return Err(AppError::ConfigError(format!(
                    "weight schedule must be strictly increasing ({} after {})",
                    weight, previous
                )));
            }
            previous = weight;
        }
        if previous != 100 {
            return Err(AppError::ConfigError(
                "weight schedule must end at 100".to_string(),
            ));
        }
        if self.health_check_retries == 0 {
            return Err(AppError::ConfigError(
                "rollout.health_check_retries must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("deploy_timeout_ms", self.deploy_timeout_ms),
            ("health_check_timeout_ms", self.health_check_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("rollback_timeout_ms", self.rollback_timeout_ms),
        ] {
            if value == 0 {
                return Err(AppError::ConfigError(format!("rollout.{} must be > 0", name)));
            }
        }
        if self.green_health_endpoints.is_empty() {
            return Err(AppError::ConfigError(
                "at least one green health endpoint is required".to_string(),
            ));
        }
        for endpoint in &self.green_health_endpoints {
            url::Url::parse(endpoint).map_err(|e| {
                AppError::ConfigError(format!("Invalid health endpoint {}: {}", endpoint, e))
            })?;
        }
        if self.benchmark.enabled {
            url::Url::parse(&self.benchmark.endpoint).map_err(|e| {
                AppError::ConfigError(format!("Invalid benchmark endpoint: {}", e))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub samples: u32,
    pub max_p95_latency_ms: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://green.internal:8080/".to_string(),
            samples: 20,
            max_p95_latency_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficKind {
    Haproxy,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub kind: TrafficKind,
    pub haproxy_socket: PathBuf,
    pub backend: String,
    pub blue_server: String,
    pub green_server: String,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            kind: TrafficKind::Memory,
            haproxy_socket: PathBuf::from("/var/run/haproxy/admin.sock"),
            backend: "app".to_string(),
            blue_server: "blue".to_string(),
            green_server: "green".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.migration.tables.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(AppError::ConfigError(format!("Invalid log level: {}", other)))
            }
        }

        if self.migration.parallel_tables == 0 {
            return Err(AppError::ConfigError(
                "migration.parallel_tables must be at least 1".to_string(),
            ));
        }

        for table in &self.migration.tables {
            validate_table_name(&table.name)
                .map_err(|e| AppError::ConfigError(format!("migration.tables: {}", e)))?;
            if let Some(target) = &table.target_table {
                validate_table_name(target).map_err(|e| {
                    AppError::ConfigError(format!("table {} target_table: {}", table.name, e))
                })?;
            }
            if table.primary_key.trim().is_empty() {
                return Err(AppError::ConfigError(format!(
                    "table {} has no primary key",
                    table.name
                )));
            }
            let encrypts = table.default_policy == FieldPolicy::ReversibleEncrypt
                || table
                    .fields
                    .values()
                    .any(|p| *p == FieldPolicy::ReversibleEncrypt);
            if encrypts && self.migration.key_id.is_none() {
                return Err(AppError::ConfigError(format!(
                    "table {} encrypts fields but migration.key_id is not set",
                    table.name
                )));
            }
        }

        if let Some(webhook) = &self.alerting.webhook_url {
            url::Url::parse(webhook)
                .map_err(|e| AppError::ConfigError(format!("Invalid webhook URL: {}", e)))?;
        }

        self.rollout.validate()
    }
}

/// Loads configuration from defaults, `.env`, an optional file and env overrides.
pub struct ConfigManager {
    config: OrchestratorConfig,
    config_path: Option<PathBuf>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            config_path: None,
        }
    }

    /// An explicit `path` wins over the `CONFIG_FILE` env var.
    pub async fn load(&mut self, path: Option<&Path>) -> Result<()> {
        dotenv::dotenv().ok();

        let mut config = OrchestratorConfig::default();

        let config_path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("CONFIG_FILE").ok().map(PathBuf::from));
        if let Some(config_path) = &config_path {
            config = Self::load_from_file(config_path).await?;
        }

        Self::load_from_env(&mut config);
        config.validate()?;

        self.config = config;
        self.config_path = config_path;
        Ok(())
    }

    fn load_from_env(config: &mut OrchestratorConfig) {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(uri) = std::env::var("MONGODB_URI") {
            config.stores.mongodb_uri = uri;
        }
        if let Ok(domain) = std::env::var("ROLLOUT_DOMAIN") {
            config.rollout.domain = domain;
        }
        if let Ok(webhook) = std::env::var("ALERT_WEBHOOK_URL") {
            config.alerting.webhook_url = Some(webhook);
        }
    }

    pub async fn load_from_file(path: &Path) -> Result<OrchestratorConfig> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let config: OrchestratorConfig = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| AppError::ConfigError(format!("Invalid YAML config: {}", e)))?,
            "json" => serde_json::from_str(&content)
                .map_err(|e| AppError::ConfigError(format!("Invalid JSON config: {}", e)))?,
            _ => {
                return Err(AppError::ConfigError(
                    "Config file must be .yaml, .yml, or .json".to_string(),
                ))
            }
        };

        Ok(config)
    }

    pub fn get(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn into_config(self) -> OrchestratorConfig {
        self.config
    }
}
