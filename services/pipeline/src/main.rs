use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tenantflow_pipeline::api::{start_api_server, AppState};
use tenantflow_pipeline::backend::{MemoryShards, ShardPools, UrlConnector};
use tenantflow_pipeline::checkpoint::{MemoryCheckpointStore, PgCheckpointStore};
use tenantflow_pipeline::config::DatabaseConfig;
use tenantflow_pipeline::notifier::{BroadcastNotificationSink, KafkaNotificationSink};
use tenantflow_pipeline::shard_directory::{
    run_invalidation_listener, AssignmentSource, PgAssignmentSource, StaticAssignmentSource,
};
use tenantflow_pipeline::source::KafkaEventSource;
use tenantflow_pipeline::{
    CheckpointStore, Config, EventSource, NotificationEmitter, NotificationSink,
    PipelineSupervisor, ResourceIdAllocator, ResourceStore, ShardDirectory, WorkerContext,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        group_id = %config.kafka.group_id,
        topic = %config.kafka.topics.mutations,
        "Starting Tenantflow pipeline"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let cancel = CancellationToken::new();
    let mut background = Vec::new();

    // Shard assignments and checkpoints live in the control database when
    // one is configured; otherwise both come from local configuration
    let control_pool = match &config.control_database {
        Some(db) => Some(connect_control_database(db).await?),
        None => {
            warn!("No control database configured; using static assignments and in-memory checkpoints");
            None
        }
    };

    let assignments: Arc<dyn AssignmentSource> = match &control_pool {
        Some(pool) => Arc::new(PgAssignmentSource::new(pool.clone())),
        None => Arc::new(StaticAssignmentSource::from_config(
            &config.directory.assignments,
        )),
    };
    let checkpoints: Arc<dyn CheckpointStore> = match &control_pool {
        Some(pool) => Arc::new(PgCheckpointStore::new(
            pool.clone(),
            config.kafka.group_id.clone(),
        )),
        None => Arc::new(MemoryCheckpointStore::new()),
    };

    let directory = Arc::new(ShardDirectory::new(assignments, config.directory.cache_ttl()));

    if let Some(pool) = control_pool {
        let listener = tokio::spawn(run_invalidation_listener(
            directory.clone(),
            pool,
            config.directory.invalidation_channel.clone(),
            cancel.clone(),
        ));
        background.push(listener);
    }

    let pools = Arc::new(ShardPools::new(Arc::new(UrlConnector::new(
        config.shards.clone(),
        Arc::new(MemoryShards::new()),
    ))));
    let store = Arc::new(ResourceStore::new(
        directory,
        pools,
        config.worker.apply_timeout(),
    ));
    let allocator = Arc::new(ResourceIdAllocator::new(&config.allocator));

    // Notification sinks
    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
    let kafka_sink = if config.notifications.kafka_enabled {
        let sink = Arc::new(
            KafkaNotificationSink::new(&config.kafka)
                .context("Failed to initialize notification producer")?,
        );
        sinks.push(sink.clone());
        Some(sink)
    } else {
        None
    };
    sinks.push(Arc::new(BroadcastNotificationSink::new(
        config.notifications.broadcast_capacity,
    )));
    let emitter = Arc::new(NotificationEmitter::new(sinks, config.notifications.timeout()));

    let source: Arc<dyn EventSource> = Arc::new(
        KafkaEventSource::new(&config.kafka).context("Failed to initialize Kafka consumer")?,
    );

    let ctx = Arc::new(WorkerContext {
        store,
        allocator,
        emitter,
        checkpoints,
        source,
        config: config.worker.clone(),
    });
    let supervisor = Arc::new(PipelineSupervisor::new(ctx, cancel.child_token()));

    // Spawn the pipeline
    let running = supervisor.clone();
    let pipeline_handle = tokio::spawn(async move { running.run().await });

    // Spawn API server task
    let api_state = AppState {
        supervisor: supervisor.clone(),
        service_name: config.service.name.clone(),
    };
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_cancel).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Pipeline started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down pipeline");

    // Workers finish their in-flight record before the supervisor returns
    supervisor.shutdown();
    if let Err(e) = pipeline_handle.await {
        error!(error = %e, "Pipeline task failed");
    }

    cancel.cancel();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API task failed");
    }
    for handle in background {
        let _ = handle.await;
    }

    if let Some(sink) = kafka_sink {
        sink.flush(config.kafka.request_timeout());
    }

    info!("Pipeline stopped");

    Ok(())
}

/// Connect to the control database and bring its schema up to date
async fn connect_control_database(db: &DatabaseConfig) -> Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .min_connections(db.min_connections)
        .acquire_timeout(Duration::from_secs(db.connect_timeout_secs))
        .idle_timeout(Some(Duration::from_secs(db.idle_timeout_secs)))
        .connect(&db.url)
        .await
        .context("Failed to connect to control database")?;

    if db.run_migrations {
        sqlx::migrate!("./migrations/control")
            .run(&pool)
            .await
            .context("Failed to run control database migrations")?;
        info!("Control database schema up to date");
    }

    Ok(pool)
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
