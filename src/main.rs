use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use launch_orchestrator::{
    config::{ConfigManager, LogFormat, LoggingConfig, OrchestratorConfig, StoreKind, TrafficKind},
    deployment::{
        CommandDeployer, Deployer, HAProxyAdapter, HealthCheckPolicy, HealthMonitor,
        HttpHealthProbe, HttpLatencyBenchmark, InMemoryTrafficRouter, NoopDeployer,
        RolloutController, TrafficRouter,
    },
    infrastructure::{
        database::{DatabaseManager, MongoSourceStore, MongoTargetStore},
        JsonDirSourceStore, JsonDirTargetStore,
    },
    migration::{
        verify_dir, write_run, ExportPolicy, ExporterSettings, ImporterSettings,
        IntegrityValidator, RecordExporter, RecordImporter, SourceStore, TargetStore,
    },
    routes::control_app,
    services::{AesGcmFieldCipher, AlertSink, FanoutAlertSink, LogAlertSink, WebhookAlertSink},
    AppState,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Migration and launch orchestrator
#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Migrates records between stores and drives blue/green cutovers")]
#[command(version)]
struct Cli {
    /// Configuration file (.yaml, .yml or .json); falls back to CONFIG_FILE
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export configured tables into sealed bundles
    Export {
        /// Bundle directory, defaults to migration.bundle_dir
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Only export these tables
        #[arg(short, long)]
        table: Vec<String>,
    },

    /// Import every bundle listed in a manifest
    Import {
        /// Bundle directory, defaults to migration.bundle_dir
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Check bundles against their manifest without importing
    Verify {
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Run a blue/green rollout
    Rollout {
        /// Build to deploy to green, defaults to rollout.build
        #[arg(short, long)]
        build: Option<String>,

        /// Serve the control API on this address while the rollout runs
        #[arg(long)]
        control_addr: Option<String>,
    },

    /// Print a fresh AES-256 key for a key id
    GenKey { key_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut manager = ConfigManager::new();
    if let Err(e) = manager.load(cli.config.as_deref()).await {
        eprintln!("❌ {}", e);
        return ExitCode::from(1);
    }
    init_tracing(&manager.get().logging);
    match manager.config_path() {
        Some(path) => info!(path = %path.display(), "📋 Configuration loaded"),
        None => info!("📋 Configuration loaded from defaults and environment"),
    }
    let config = manager.into_config();

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn run(command: Commands, config: OrchestratorConfig) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Export { out, table } => {
            let dir = out.unwrap_or_else(|| config.migration.bundle_dir.clone());
            export(&config, &dir, &table).await
        }
        Commands::Import { dir } => {
            let dir = dir.unwrap_or_else(|| config.migration.bundle_dir.clone());
            import(&config, &dir).await
        }
        Commands::Verify { dir } => {
            let dir = dir.unwrap_or_else(|| config.migration.bundle_dir.clone());
            verify(&config, &dir).await
        }
        Commands::Rollout { build, control_addr } => rollout(config, build, control_addr).await,
        Commands::GenKey { key_id } => {
            let key = AesGcmFieldCipher::generate_key();
            println!("{}{}={}", config.encryption.keys_env_prefix, key_id, key);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn export(config: &OrchestratorConfig, dir: &Path, selected: &[String]) -> anyhow::Result<ExitCode> {
    if let Some(unknown) = selected.iter().find(|name| config.table(name).is_none()) {
        bail!("table {} is not configured", unknown);
    }
    let tables: Vec<(String, ExportPolicy)> = config
        .migration
        .tables
        .iter()
        .filter(|t| selected.is_empty() || selected.contains(&t.name))
        .map(|t| (t.name.clone(), t.export_policy()))
        .collect();
    if tables.is_empty() {
        bail!("no tables selected for export");
    }

    let hash_pepper = match &config.migration.hash_pepper_env {
        Some(var) => Some(
            std::env::var(var).with_context(|| format!("hash pepper variable {} is not set", var))?,
        ),
        None => None,
    };

    let exporter = RecordExporter::new(
        source_store(config).await?,
        Arc::new(AesGcmFieldCipher::from_env(&config.encryption.keys_env_prefix)),
        ExporterSettings {
            source_system: config.migration.source_system.clone(),
            schema_version: config.migration.schema_version.clone(),
            key_id: config.migration.key_id.clone(),
            hash_pepper,
            parallel_tables: config.migration.parallel_tables,
        },
    );

    let run = exporter.export_all(&tables).await.context("export aborted")?;
    write_run(&run, dir)
        .await
        .with_context(|| format!("failed to write bundles to {}", dir.display()))?;

    if !run.failures.is_empty() {
        warn!(failures = run.failures.len(), "Some records were skipped, see export-failures.json");
    }
    println!("{}", serde_json::to_string_pretty(&run.manifest)?);
    Ok(ExitCode::SUCCESS)
}

async fn import(config: &OrchestratorConfig, dir: &Path) -> anyhow::Result<ExitCode> {
    let table_mappings: HashMap<String, String> = config
        .migration
        .tables
        .iter()
        .filter(|t| t.target_table() != t.name)
        .map(|t| (t.name.clone(), t.target_table().to_string()))
        .collect();

    let importer = RecordImporter::new(
        target_store(config).await?,
        Arc::new(AesGcmFieldCipher::from_env(&config.encryption.keys_env_prefix)),
        ImporterSettings {
            table_mappings,
            parallel_tables: config.migration.parallel_tables,
        },
    );

    let report = importer.import_dir(dir).await.context("import aborted")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn verify(config: &OrchestratorConfig, dir: &Path) -> anyhow::Result<ExitCode> {
    let validator = IntegrityValidator::with_supported_versions(vec![config.migration.schema_version.clone()]);
    let checks = verify_dir(dir, &validator).await.context("manifest check failed")?;
    println!("{}", serde_json::to_string_pretty(&checks)?);

    Ok(if checks.iter().all(|c| c.valid) {
        info!(bundles = checks.len(), "✅ All bundles verified");
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn rollout(
    config: OrchestratorConfig,
    build: Option<String>,
    control_addr: Option<String>,
) -> anyhow::Result<ExitCode> {
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let rollout = &config.rollout;

    let monitor = Arc::new(HealthMonitor::new(
        Arc::new(HttpHealthProbe::new(client.clone())),
        HealthCheckPolicy::from(rollout),
    ));

    let deployer: Arc<dyn Deployer> = match &rollout.deploy_command {
        Some(command) => Arc::new(CommandDeployer::new(command, rollout.deploy_timeout())),
        None => Arc::new(NoopDeployer),
    };

    let router: Arc<dyn TrafficRouter> = match config.traffic.kind {
        TrafficKind::Haproxy => Arc::new(HAProxyAdapter::new(
            &config.traffic.haproxy_socket,
            &config.traffic.backend,
            &config.traffic.blue_server,
            &config.traffic.green_server,
        )),
        TrafficKind::Memory => {
            warn!("Using in-memory traffic router; no real traffic will move");
            Arc::new(InMemoryTrafficRouter::new())
        }
    };

    let mut alerts = FanoutAlertSink::new().subscribe(Arc::new(LogAlertSink));
    if let Some(url) = &config.alerting.webhook_url {
        alerts = alerts.subscribe(Arc::new(WebhookAlertSink::new(
            client.clone(),
            url,
            Duration::from_millis(config.alerting.webhook_timeout_ms),
        )));
    }
    let alerts: Arc<dyn AlertSink> = Arc::new(alerts);

    let mut controller = RolloutController::new(rollout.clone(), deployer, monitor, router, alerts);
    if rollout.benchmark.enabled {
        controller = controller.with_benchmark(Arc::new(HttpLatencyBenchmark::new(
            client,
            &rollout.benchmark,
            rollout.health_check_timeout(),
        )));
    }
    let controller = Arc::new(controller);

    let server = match control_addr.or_else(|| rollout.control_addr.clone()) {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind control API on {}", addr))?;
            info!("📊 Control API: http://{}/api/rollout/status", addr);
            let app = control_app(AppState {
                controller: controller.clone(),
            });
            Some(tokio::spawn(async move { axum::serve(listener, app).await }))
        }
        None => None,
    };

    let signal_controller = controller.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = signal_controller.abort().await {
                warn!("Interrupt ignored: {}", e);
            }
        }
    });

    let report = controller.start(build.as_deref()).await?;

    signal.abort();
    if let Some(server) = server {
        server.abort();
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::from(report.exit_code))
}

async fn source_store(config: &OrchestratorConfig) -> anyhow::Result<Arc<dyn SourceStore>> {
    Ok(match config.stores.kind {
        StoreKind::JsonDir => Arc::new(JsonDirSourceStore::new(&config.stores.source_dir)),
        StoreKind::Mongodb => {
            let db = DatabaseManager::new(&config.stores.mongodb_uri, &config.stores.source_database)
                .await
                .context("source database unavailable")?;
            Arc::new(MongoSourceStore::new(db))
        }
    })
}

async fn target_store(config: &OrchestratorConfig) -> anyhow::Result<Arc<dyn TargetStore>> {
    Ok(match config.stores.kind {
        StoreKind::JsonDir => Arc::new(
            JsonDirTargetStore::open(&config.stores.target_dir)
                .await
                .context("target directory unavailable")?,
        ),
        StoreKind::Mongodb => {
            let db = DatabaseManager::new(&config.stores.mongodb_uri, &config.stores.target_database)
                .await
                .context("target database unavailable")?;
            Arc::new(MongoTargetStore::new(db))
        }
    })
}
