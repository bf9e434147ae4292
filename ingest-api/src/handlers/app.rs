use std::convert::Infallible;
use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use ingest_common::queue::QueueClient;
use ingest_common::store::PgEventStore;

use super::{publish, query};

/// What the handlers share: the queue to publish onto and the store to read back from.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn QueueClient + Send + Sync>,
    pub queue_name: String,
    pub store: PgEventStore,
}

pub fn add_routes(
    router: Router,
    state: AppState,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop here, just check axum health
        .route(
            "/publish",
            routing::post(publish::post_event)
                .with_state(state.clone())
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route(
            "/events",
            routing::get(query::get_events).with_state(state.clone()),
        )
        .route("/stats", routing::get(query::get_stats).with_state(state))
}

pub async fn index() -> &'static str {
    "ingest api"
}
