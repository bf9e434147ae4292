use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::error;

use ingest_common::store::{CategoryCounter, EventRecord, StoreError};

use super::AppState;

const MAX_EVENTS: i64 = 100;

#[derive(Deserialize, Debug)]
pub struct EventsQuery {
    topic: Option<String>,
}

/// List up to `MAX_EVENTS` stored events, optionally filtered by `?topic=`.
pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventRecord>>, (StatusCode, String)> {
    let events = state
        .store
        .list_events(query.topic.as_deref(), MAX_EVENTS)
        .await
        .map_err(internal_error)?;

    Ok(Json(events))
}

pub async fn get_stats(
    State(state): State<AppState>,
) -> Result<Json<Vec<CategoryCounter>>, (StatusCode, String)> {
    let counters = state.store.list_counters().await.map_err(internal_error)?;

    Ok(Json(counters))
}

fn internal_error(err: StoreError) -> (StatusCode, String) {
    error!("failed to read from store: {}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
