use ingest_common::event::DecodeError;
use ingest_common::queue::QueueError;
use ingest_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors that can occur while the `IngestWorker` handles a queue item.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue item could not be decoded: {0}")]
    DecodeError(#[from] DecodeError),
    #[error("event could not be persisted: {0}")]
    StoreError(#[from] StoreError),
    #[error("queue operation failed: {0}")]
    QueueError(#[from] QueueError),
}
