use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use handlers::AppState;
use ingest_common::metrics::{serve, setup_metrics_routes};
use ingest_common::queue::RedisQueue;
use ingest_common::store::{PgEventStore, PoolConfig};

mod config;
mod handlers;

async fn shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = PgEventStore::new(
        &config.events_table,
        &config.counters_table,
        &config.database_url,
        PoolConfig {
            max_connections: config.max_pg_connections,
            ..Default::default()
        },
    )
    .await?;

    // Connects on first publish: while the queue is unreachable, publishing answers 500.
    let queue = RedisQueue::new(&config.redis_url)?;

    let state = AppState {
        queue: Arc::new(queue),
        queue_name: config.queue_name.clone(),
        store: store.clone(),
    };

    let app = handlers::add_routes(
        Router::new(),
        state,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app);

    tracing::info!("listening on {}", config.bind());

    if let Err(e) = serve(app, &config.bind(), shutdown()).await {
        tracing::error!("failed to start ingest-api http server, {}", e);
    }
    store.pool().close().await;

    Ok(())
}
