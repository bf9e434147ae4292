use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use ingest_common::event::{DecodeError, Event};

use super::AppState;

#[derive(Serialize, Deserialize, Debug)]
pub struct PublishResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PublishResponse {
    fn queued(event_id: String) -> Self {
        Self {
            status: Some("queued".to_owned()),
            event_id: Some(event_id),
            error: None,
        }
    }

    fn error(status: StatusCode, message: String) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                status: None,
                event_id: None,
                error: Some(message),
            }),
        )
    }
}

/// Accept one event and push it onto the shared queue. Retransmissions are accepted like any
/// other event: deduplication happens when the event is persisted, never here.
pub async fn post_event(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Json<PublishResponse>, (StatusCode, Json<PublishResponse>)> {
    debug!("received event: {:?}", event);

    event.validate().map_err(|e| {
        let status = match e {
            DecodeError::PayloadNotAnObject => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::BAD_REQUEST,
        };
        PublishResponse::error(status, e.to_string())
    })?;

    let item = event.encode().map_err(internal_error)?;

    let start_time = Instant::now();

    state
        .queue
        .push(&state.queue_name, item)
        .await
        .map_err(internal_error)?;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("ingest_api_enqueue_duration_seconds").record(elapsed_time);

    Ok(Json(PublishResponse::queued(event.identifier)))
}

fn internal_error<E>(err: E) -> (StatusCode, Json<PublishResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    PublishResponse::error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt; // for `collect`
    use ingest_common::queue::{MockQueue, QueueClient, RedisQueue};
    use ingest_common::store::PgEventStore;
    use sqlx::PgPool;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use super::*;
    use crate::handlers::add_routes;

    const QUEUE: &str = "event_queue";

    fn app(queue: &MockQueue, db: PgPool) -> Router {
        app_with_queue(Arc::new(queue.clone()), db)
    }

    fn app_with_queue(queue: Arc<dyn QueueClient + Send + Sync>, db: PgPool) -> Router {
        let state = AppState {
            queue,
            queue_name: QUEUE.to_owned(),
            store: PgEventStore::new_from_pool("events", "category_counters", db),
        };
        add_routes(Router::new(), state, 1_000_000, 10)
    }

    fn publish(body: String) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri("/publish")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn event_body(event_id: &str) -> String {
        serde_json::json!({
            "topic": "test.integration",
            "event_id": event_id,
            "timestamp": "2024-01-01T12:00:00Z",
            "source": "pytest",
            "payload": {"message": "hello world"},
        })
        .to_string()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn publish_success(db: PgPool) {
        let queue = MockQueue::new();

        let response = app(&queue, db)
            .oneshot(publish(event_body("abc-1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: PublishResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.status.as_deref(), Some("queued"));
        assert_eq!(body.event_id.as_deref(), Some("abc-1"));

        let items = queue.items(QUEUE);
        assert_eq!(items.len(), 1);
        let queued = Event::decode(&items[0]).unwrap();
        assert_eq!(queued.category, "test.integration");
        assert_eq!(queued.payload.get(), r#"{"message":"hello world"}"#);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn publish_duplicate_is_accepted(db: PgPool) {
        let queue = MockQueue::new();
        let app = app(&queue, db);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(publish(event_body("abc-1")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(queue.len(QUEUE), 2);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn publish_missing_fields(db: PgPool) {
        let queue = MockQueue::new();
        let app = app(&queue, db);

        for field in ["topic", "event_id", "source"] {
            let mut body: serde_json::Value = serde_json::from_str(&event_body("e")).unwrap();
            body.as_object_mut().unwrap().remove(field);

            let response = app
                .clone()
                .oneshot(publish(body.to_string()))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        }

        assert!(queue.is_empty(QUEUE));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn publish_empty_identifier(db: PgPool) {
        let queue = MockQueue::new();

        let response = app(&queue, db)
            .oneshot(publish(event_body("")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(queue.is_empty(QUEUE));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn publish_queue_unavailable(db: PgPool) {
        let queue = MockQueue::new().fail_push(1);

        let response = app(&queue, db)
            .oneshot(publish(event_body("abc-1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn publish_queue_unreachable_since_start(db: PgPool) {
        let queue = RedisQueue::new("redis://127.0.0.1:1/0").unwrap();

        let response = app_with_queue(Arc::new(queue), db)
            .oneshot(publish(event_body("abc-1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn publish_non_object_payload(db: PgPool) {
        let queue = MockQueue::new();
        let app = app(&queue, db);

        for payload in [
            serde_json::json!([1, 2]),
            serde_json::json!("text"),
            serde_json::json!(null),
        ] {
            let mut body: serde_json::Value = serde_json::from_str(&event_body("e")).unwrap();
            body["payload"] = payload;

            let response = app
                .clone()
                .oneshot(publish(body.to_string()))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        }

        assert!(queue.is_empty(QUEUE));
    }
}
