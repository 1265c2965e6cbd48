use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{delete, get, post},
};
use seobatch::{
    api::handlers,
    app_state::AppState,
    clients::StoreApiClient,
    config,
    engine::Producer,
    health::health_check,
    queue::PgBroker,
    store::{JobStore, PgJobStore},
};
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env().expect("Failed to load configuration");

    let pool: Pool<Postgres> = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(30))
        .connect(config.database_url())
        .await
        .unwrap();
    let queue_pool: Pool<Postgres> = PgPoolOptions::new()
        .max_connections(5)
        .connect(config.queue_database_url())
        .await
        .unwrap();

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let broker = Arc::new(PgBroker::new(queue_pool));
    let store_api = StoreApiClient::new(config.store_api().clone());
    let producer = Arc::new(Producer::new(store.clone(), broker, store_api));

    let app_state = AppState {
        producer,
        store,
        db_pool: pool,
    };

    let job_routes = Router::new()
        .route("/", post(handlers::create_job))
        .route("/", get(handlers::list_jobs))
        .route("/{id}", get(handlers::get_job))
        .route("/{id}/cancel", post(handlers::cancel_job))
        .route("/{id}/retry", post(handlers::retry_job))
        .route("/{id}/publish", post(handlers::publish_job));

    let app = Router::new()
        .route("/healthz", get(health_check))
        .nest("/v1/jobs", job_routes)
        .route("/v1/tenants/{tenant}/jobs", delete(handlers::clear_tenant))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .expect("Failed to bind to address");
    axum::serve(listener, app).await.unwrap();
}
