//! Drain the shared event queue into the record store.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use ingest_common::health::HealthRegistry;
use ingest_common::metrics::{serve, setup_metrics_routes};
use ingest_common::queue::RedisQueue;
use ingest_common::store::PgEventStore;
use ingest_worker::config::Config;
use ingest_worker::worker::IngestWorker;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

pub async fn index() -> &'static str {
    "ingest worker"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let store = PgEventStore::new(
        &config.events_table,
        &config.counters_table,
        &config.database_url,
        config.pool_config(),
    )
    .await?;

    if config.run_migrations {
        sqlx::migrate!("../migrations").run(store.pool()).await?;
    }

    let queue = RedisQueue::new(&config.redis_url)?;

    let liveness = HealthRegistry::new("liveness");
    // A healthy loop reports at least once per dequeue timeout or backoff interval.
    let deadline = config.dequeue_timeout.0.max(config.backoff_interval.0) * 3;
    let worker_liveness = liveness.register(
        "worker",
        time::Duration::try_from(deadline).unwrap_or(time::Duration::seconds(30)),
    );

    let worker = IngestWorker::new(
        config.worker_name.as_str(),
        config.queue_name.as_str(),
        config.dead_letter_queue.as_ref().map(|q| q.as_str()),
        Arc::new(queue),
        Arc::new(store.clone()),
        config.dequeue_timeout.0,
        config.backoff_interval.0,
        worker_liveness,
    );

    let cancel = CancellationToken::new();

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        );
    let router = setup_metrics_routes(router);

    let bind = config.bind();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        serve(router, &bind, async move { server_cancel.cancelled().await }).await
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown().await;
        signal_cancel.cancel();
    });

    worker.run(cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = server.await? {
        tracing::error!("failed to serve ingest-worker http endpoints: {}", e);
    }
    store.pool().close().await;

    Ok(())
}
