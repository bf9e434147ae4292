use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::queue::{QueueClient, QueueError, QueueResult};

/// A `QueueClient` backed by Redis lists. Requires Redis >= 6.2 for `BLMOVE`/`LMOVE`.
///
/// The connection is opened on first use, not in `new`: a server that is down when the process
/// starts shows up as a `QueueError` from whichever command runs first, like any later outage.
#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    connection: Arc<Mutex<Option<ConnectionManager>>>,
}

impl RedisQueue {
    /// Create a client for the Redis server at `addr`. Only fails if `addr` is not a valid Redis
    /// URL; nothing is sent to the server yet.
    pub fn new(addr: &str) -> QueueResult<RedisQueue> {
        let client = redis::Client::open(addr).map_err(QueueError::ConnectionError)?;

        Ok(RedisQueue {
            client,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    /// Hand out the shared connection, establishing it if no attempt has succeeded yet. Once
    /// established, the `ConnectionManager` reconnects on its own after the server goes away.
    async fn connection(&self) -> QueueResult<ConnectionManager> {
        let mut connection = self.connection.lock().await;

        if let Some(conn) = connection.as_ref() {
            return Ok(conn.clone());
        }

        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(QueueError::ConnectionError)?;
        *connection = Some(conn.clone());

        Ok(conn)
    }
}

#[async_trait]
impl QueueClient for RedisQueue {
    async fn push(&self, queue: &str, item: String) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        conn.rpush::<_, _, ()>(queue, item)
            .await
            .map_err(|error| QueueError::command("RPUSH", error))
    }

    async fn reserve(
        &self,
        queue: &str,
        processing: &str,
        timeout: time::Duration,
    ) -> QueueResult<Option<String>> {
        let mut conn = self.connection().await?;
        redis::cmd("BLMOVE")
            .arg(queue)
            .arg(processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|error| QueueError::command("BLMOVE", error))
    }

    async fn ack(&self, processing: &str, item: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, i64>(processing, 1, item)
            .await
            .map_err(|error| QueueError::command("LREM", error))?;
        Ok(())
    }

    async fn recover(&self, processing: &str, queue: &str) -> QueueResult<usize> {
        let mut conn = self.connection().await?;
        let mut moved = 0;

        loop {
            let item: Option<String> = redis::cmd("LMOVE")
                .arg(processing)
                .arg(queue)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(|error| QueueError::command("LMOVE", error))?;

            match item {
                Some(_) => moved += 1,
                None => return Ok(moved),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Nothing listens on port 1.
    const UNREACHABLE: &str = "redis://127.0.0.1:1/0";

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/".to_owned())
    }

    /// Key names unique to one test in this process, cleared before use.
    async fn keys(test: &str) -> (RedisQueue, String, String) {
        let queue_name = format!("test_{}_{}", test, std::process::id());
        let processing = format!("{}:processing", queue_name);

        let queue = RedisQueue::new(&redis_url()).expect("failed to create redis client");
        let mut conn = queue.connection().await.expect("failed to connect to redis");
        conn.del::<_, ()>(vec![queue_name.clone(), processing.clone()])
            .await
            .expect("failed to clear test keys");

        (queue, queue_name, processing)
    }

    async fn items(queue: &RedisQueue, list: &str) -> Vec<String> {
        let mut conn = queue.connection().await.expect("failed to connect to redis");
        conn.lrange(list, 0, -1).await.expect("failed to read list")
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_on_first_command() {
        let queue = RedisQueue::new(UNREACHABLE).expect("valid url was rejected");
        let timeout = time::Duration::from_millis(10);

        assert!(matches!(
            queue.push("q", "item".to_owned()).await,
            Err(QueueError::ConnectionError(_))
        ));
        assert!(queue.reserve("q", "p", timeout).await.is_err());
        assert!(queue.recover("p", "q").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        assert!(RedisQueue::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_reserve_moves_head_to_processing() {
        let (queue, queue_name, processing) = keys("reserve").await;
        queue.push(&queue_name, "one".to_owned()).await.unwrap();
        queue.push(&queue_name, "two".to_owned()).await.unwrap();

        let item = queue
            .reserve(&queue_name, &processing, time::Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(item.as_deref(), Some("one"));
        assert_eq!(items(&queue, &queue_name).await, vec!["two"]);
        assert_eq!(items(&queue, &processing).await, vec!["one"]);
    }

    #[tokio::test]
    async fn test_reserve_times_out_on_empty_queue() {
        let (queue, queue_name, processing) = keys("reserve_empty").await;

        let start = tokio::time::Instant::now();
        let item = queue
            .reserve(&queue_name, &processing, time::Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(item, None);
        assert!(start.elapsed() >= time::Duration::from_millis(150));
        assert!(items(&queue, &processing).await.is_empty());
    }

    #[tokio::test]
    async fn test_ack_removes_one_occurrence() {
        let (queue, _, processing) = keys("ack").await;
        queue.push(&processing, "same".to_owned()).await.unwrap();
        queue.push(&processing, "same".to_owned()).await.unwrap();
        queue.push(&processing, "other".to_owned()).await.unwrap();

        queue.ack(&processing, "same").await.unwrap();

        assert_eq!(items(&queue, &processing).await, vec!["same", "other"]);
    }

    #[tokio::test]
    async fn test_recover_restores_order_at_head() {
        let (queue, queue_name, processing) = keys("recover").await;
        for item in ["a", "b", "c", "d"] {
            queue.push(&queue_name, item.to_owned()).await.unwrap();
        }
        let timeout = time::Duration::from_secs(1);
        queue.reserve(&queue_name, &processing, timeout).await.unwrap();
        queue.reserve(&queue_name, &processing, timeout).await.unwrap();

        let moved = queue.recover(&processing, &queue_name).await.unwrap();

        assert_eq!(moved, 2);
        assert_eq!(items(&queue, &queue_name).await, vec!["a", "b", "c", "d"]);
        assert!(items(&queue, &processing).await.is_empty());
    }
}
