//! # Shared Work Queue
//!
//! The capability the gateway pushes events onto and the worker drains. Consumption is two-phase:
//! `reserve` moves an item into a processing list owned by one consumer, and `ack` removes it
//! from there once the item has been handled. Anything reserved but never acknowledged is put
//! back with `recover`.
use std::time;

use async_trait::async_trait;
use thiserror::Error;

mod client;
mod mock;

pub use client::RedisQueue;
pub use mock::MockQueue;

/// Enumeration of errors for operations with the queue backend.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {0}")]
    ConnectionError(redis::RedisError),
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: String,
        error: redis::RedisError,
    },
}

impl QueueError {
    pub fn command(command: &str, error: redis::RedisError) -> Self {
        QueueError::CommandError {
            command: command.to_owned(),
            error,
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[async_trait]
pub trait QueueClient {
    /// Append an item to the tail of `queue`.
    async fn push(&self, queue: &str, item: String) -> QueueResult<()>;

    /// Wait up to `timeout` for an item at the head of `queue`, atomically moving it to the tail
    /// of `processing`. Returns `None` when the wait ran out.
    async fn reserve(
        &self,
        queue: &str,
        processing: &str,
        timeout: time::Duration,
    ) -> QueueResult<Option<String>>;

    /// Drop one occurrence of `item` from `processing`.
    async fn ack(&self, processing: &str, item: &str) -> QueueResult<()>;

    /// Move everything left in `processing` back to the head of `queue`, keeping its order.
    /// Returns how many items were moved.
    async fn recover(&self, processing: &str, queue: &str) -> QueueResult<usize>;
}
