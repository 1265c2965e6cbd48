use std::sync::Arc;

use anyhow::Result;
use seobatch::{
    clients::{GeneratorClient, StoreApiClient},
    config::Config,
    engine::{Dispatcher, EngineContext, EngineSettings, RecoveryLoop},
    lock::{RedisTenantLock, TenantLock},
    queue::{Broker, PgBroker, WorkerConfig, WorkerSupervisor},
    store::{JobStore, PgJobStore},
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Create database connection pools
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(config.database_url())
        .await?;
    let queue_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(config.queue_database_url())
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(queue_pool));
    let lock: Arc<dyn TenantLock> = Arc::new(RedisTenantLock::connect(config.kv_url()).await?);

    let settings = EngineSettings::from_config(config.engine());
    let ctx = Arc::new(EngineContext {
        store: store.clone(),
        lock,
        broker: broker.clone(),
        generator: GeneratorClient::new(config.generator().clone()),
        store_api: StoreApiClient::new(config.store_api().clone()),
        settings: settings.clone(),
    });

    let worker_id = Uuid::new_v4();
    let dispatcher = Arc::new(Dispatcher::new(ctx, worker_id));

    let worker_config = WorkerConfig {
        concurrency: std::env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4),
        poll_interval_ms: std::env::var("WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000),
        visibility_timeout_secs: std::env::var("WORKER_VISIBILITY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300),
        lock_retry_delay: settings.tenant_lock_retry_delay,
        shutdown_when_queue_empty: false,
    };

    // Create and run supervisor, with the recovery loop on the side
    let supervisor = WorkerSupervisor::new(broker, dispatcher, worker_config, worker_id);
    let shutdown = supervisor.shutdown_token();
    let recovery = RecoveryLoop::new(store, settings.stuck_after);
    tokio::spawn(recovery.run(shutdown));

    supervisor.run().await
}
