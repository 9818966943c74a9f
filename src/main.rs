use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use paygate::api::{self, AppState};
use paygate::cache::instances::spawn_heartbeat;
use paygate::cache::{self as cache_store, InstanceRegistry, RedisDedupLock, RedisInstanceRegistry, ServiceInstance};
use paygate::config::AppConfig;
use paygate::database::{postgres, OrderStore, PgOrderStore};
use paygate::logging::init_tracing;
use paygate::payments::ProviderRegistry;
use paygate::services::{DownstreamNotifier, NotificationPipeline, OrderService, TransitionEngine};
use paygate::workers::{scheduler, Reconciler, TracingSweepReporter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("Starting paygate");

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    // ========================================================================
    // Storage
    // ========================================================================

    let pool = postgres::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to postgres")?;
    postgres::migrate(&pool)
        .await
        .context("failed to run migrations")?;
    let store: Arc<dyn OrderStore> = Arc::new(PgOrderStore::new(pool));

    let redis = cache_store::connect(&config.redis.url, config.redis.pool_size)
        .await
        .context("failed to connect to redis")?;

    // ========================================================================
    // Providers and settlement pipeline
    // ========================================================================

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .build()
        .context("failed to build http client")?;

    let registry = Arc::new(
        ProviderRegistry::from_credentials(&config.providers, http.clone())
            .await
            .context("invalid provider credentials")?,
    );
    info!(providers = registry.len().await, "Provider registry ready");

    let notifier = DownstreamNotifier::start(config.notifier.clone(), http);
    let notifier_metrics = notifier.metrics_handle();

    let engine = Arc::new(TransitionEngine::new(
        store.clone(),
        config.transition.clone(),
    ));
    let pipeline = Arc::new(NotificationPipeline::new(
        Arc::new(RedisDedupLock::new(redis.clone())),
        engine.clone(),
        Arc::new(notifier),
        config.lock.ttl(),
    ));
    let orders = Arc::new(OrderService::new(store.clone(), engine, registry.clone()));

    // ========================================================================
    // Background workers
    // ========================================================================

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let instance = ServiceInstance::new(config.instance.instance_id());
    info!(instance_id = %instance.instance_id, "Registering service instance");
    let instances: Arc<dyn InstanceRegistry> = Arc::new(RedisInstanceRegistry::new(
        redis,
        config.instance.heartbeat_ttl(),
    ));
    let heartbeat = spawn_heartbeat(
        instances.clone(),
        instance.clone(),
        config.instance.heartbeat_interval(),
        shutdown_rx.clone(),
    );

    let reconciler = Arc::new(Reconciler::new(
        store,
        registry.clone(),
        pipeline.clone(),
        instances,
        instance.instance_id.clone(),
        Arc::new(TracingSweepReporter),
        config.reconciliation.clone(),
        shutdown_rx.clone(),
    ));
    let scheduler_handle = tokio::spawn(scheduler::run(reconciler.clone(), shutdown_rx.clone()));

    // ========================================================================
    // HTTP
    // ========================================================================

    let app = api::router(AppState {
        registry,
        pipeline,
        orders,
        reconciler,
        notifier_metrics,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "paygate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("HTTP server stopped, shutting down workers");
    let _ = shutdown_tx.send(true);

    match scheduler_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Reconciliation scheduler stopped with error"),
        Err(e) => error!(error = %e, "Reconciliation scheduler task panicked"),
    }
    if let Err(e) = heartbeat.await {
        error!(error = %e, "Heartbeat task panicked");
    }

    info!("paygate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
