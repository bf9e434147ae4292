//! # Durable Record Store
//!
//! Events and per-category counters persisted in PostgreSQL. Deduplication is enforced by the
//! `UNIQUE (category, identifier)` constraint on the events table: every insertion goes through
//! `ON CONFLICT DO NOTHING`, and the counter for a category is only bumped when that insert
//! actually created a row. Both statements run inside a single transaction.
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::value::RawValue;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::warn;

use crate::event::Event;

/// Enumeration of errors for operations with the record store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("stored payload is not valid JSON: {0}")]
    PayloadError(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What persisting an event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// A new event record was created and its category counter incremented.
    Inserted,
    /// The `(category, identifier)` pair was already stored; nothing changed.
    Duplicate,
}

/// Anything that can idempotently persist an `Event`.
#[async_trait]
pub trait EventStore {
    async fn persist(&self, event: &Event) -> StoreResult<PersistOutcome>;
}

/// An event record as read back from the store.
#[derive(Serialize, Debug)]
pub struct EventRecord {
    pub id: i64,
    #[serde(rename = "topic")]
    pub category: String,
    #[serde(rename = "event_id")]
    pub identifier: String,
    pub source: String,
    pub payload: Box<RawValue>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    category: String,
    identifier: String,
    source: String,
    payload: String,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            category: row.category,
            identifier: row.identifier,
            source: row.source,
            payload: RawValue::from_string(row.payload)?,
            recorded_at: row.recorded_at,
        })
    }
}

/// The running count of events stored for one category.
#[derive(sqlx::FromRow, Serialize, Debug, Clone, PartialEq)]
pub struct CategoryCounter {
    #[serde(rename = "topic")]
    pub category: String,
    pub count: i64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Connection pool settings for `PgEventStore::new`.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: time::Duration,
    /// Applied as the session `statement_timeout` of every pooled connection.
    pub statement_timeout: time::Duration,
    /// Applied as the session `lock_timeout`, bounding waits on a contended counter row.
    pub lock_timeout: time::Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: time::Duration::from_secs(5),
            statement_timeout: time::Duration::from_secs(10),
            lock_timeout: time::Duration::from_secs(5),
        }
    }
}

/// A record store implemented on top of two PostgreSQL tables.
#[derive(Clone)]
pub struct PgEventStore {
    events_table: String,
    counters_table: String,
    pool: PgPool,
}

impl PgEventStore {
    /// Initialize a new `PgEventStore`, connecting to the database at `url`.
    pub async fn new(
        events_table: &str,
        counters_table: &str,
        url: &str,
        config: PoolConfig,
    ) -> StoreResult<Self> {
        let statement_ms = config.statement_timeout.as_millis();
        let lock_ms = config.lock_timeout.as_millis();

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    // SET doesn't accept bind parameters.
                    sqlx::query(&format!("SET statement_timeout = '{statement_ms}ms'"))
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query(&format!("SET lock_timeout = '{lock_ms}ms'"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::new_from_pool(events_table, counters_table, pool))
    }

    /// Initialize a new `PgEventStore` backed by an existing pool.
    pub fn new_from_pool(events_table: &str, counters_table: &str, pool: PgPool) -> Self {
        Self {
            events_table: events_table.to_owned(),
            counters_table: counters_table.to_owned(),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert an event record unless its `(category, identifier)` pair already exists.
    /// Returns whether a new row was created.
    pub async fn insert_event(&self, conn: &mut PgConnection, event: &Event) -> StoreResult<bool> {
        let query = format!(
            r#"
INSERT INTO "{0}"
    (category, identifier, source, payload)
VALUES
    ($1, $2, $3, $4::json)
ON CONFLICT (category, identifier) DO NOTHING
            "#,
            &self.events_table
        );

        let result = sqlx::query(&query)
            .bind(&event.category)
            .bind(&event.identifier)
            .bind(&event.source)
            .bind(event.payload.get())
            .execute(&mut *conn)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() == 1)
    }

    /// Create the counter for `category` at 1, or add 1 to it, in a single statement.
    pub async fn increment_counter(&self, conn: &mut PgConnection, category: &str) -> StoreResult<()> {
        let query = format!(
            r#"
INSERT INTO "{0}"
    (category, count, last_updated)
VALUES
    ($1, 1, NOW())
ON CONFLICT (category) DO UPDATE
SET
    count = "{0}".count + 1,
    last_updated = NOW()
            "#,
            &self.counters_table
        );

        sqlx::query(&query)
            .bind(category)
            .execute(&mut *conn)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// List stored events, optionally restricted to one category, oldest first.
    pub async fn list_events(
        &self,
        category: Option<&str>,
        limit: i64,
    ) -> StoreResult<Vec<EventRecord>> {
        let query = format!(
            r#"
SELECT
    id, category, identifier, source, payload::text AS payload, recorded_at
FROM
    "{0}"
WHERE
    $1::text IS NULL OR category = $1
ORDER BY
    id
LIMIT $2
            "#,
            &self.events_table
        );

        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(category)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    /// List every category counter.
    pub async fn list_counters(&self) -> StoreResult<Vec<CategoryCounter>> {
        let query = format!(
            r#"SELECT category, count, last_updated FROM "{0}" ORDER BY category"#,
            &self.counters_table
        );

        sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    pub async fn get_counter(&self, category: &str) -> StoreResult<Option<CategoryCounter>> {
        let query = format!(
            r#"SELECT category, count, last_updated FROM "{0}" WHERE category = $1"#,
            &self.counters_table
        );

        sqlx::query_as(&query)
            .bind(category)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn persist_in(&self, conn: &mut PgConnection, event: &Event) -> StoreResult<PersistOutcome> {
        if !self.insert_event(conn, event).await? {
            return Ok(PersistOutcome::Duplicate);
        }

        self.increment_counter(conn, &event.category).await?;

        Ok(PersistOutcome::Inserted)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    /// Insert the event and bump its category counter as one transaction.
    /// On any failure the transaction is rolled back before the error is returned.
    async fn persist(&self, event: &Event) -> StoreResult<PersistOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        match self.persist_in(&mut *tx, event).await {
            Ok(outcome) => {
                tx.commit()
                    .await
                    .map_err(|error| StoreError::TransactionError {
                        command: "COMMIT".to_owned(),
                        error,
                    })?;
                Ok(outcome)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!("failed to roll back transaction: {}", rollback_error);
                }
                Err(error)
            }
        }
    }
}
