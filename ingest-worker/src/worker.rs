use std::sync::Arc;
use std::time;

use ingest_common::event::Event;
use ingest_common::health::HealthHandle;
use ingest_common::queue::QueueClient;
use ingest_common::store::{EventStore, PersistOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::WorkerError;

/// A worker that drains the shared queue one item at a time and persists each event.
///
/// Items are reserved into a processing list owned by this worker and only acknowledged once
/// they have been handled, so an item is never lost between the pop and the commit of its
/// transaction: a crash in that window leaves it in the processing list, and the next start of
/// this worker puts it back on the queue.
pub struct IngestWorker {
    /// An identifier for this worker. Names the processing list of reserved items.
    name: String,
    /// The queue we will be reserving items from.
    queue_name: String,
    /// Where reserved items wait until they are acknowledged.
    processing_list: String,
    /// Optional queue receiving items we had to give up on.
    dead_letter_queue: Option<String>,
    queue: Arc<dyn QueueClient + Send + Sync>,
    store: Arc<dyn EventStore + Send + Sync>,
    /// Upper bound on a single blocking reserve.
    dequeue_timeout: time::Duration,
    /// How long to wait before talking to the queue again after it failed.
    backoff_interval: time::Duration,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl IngestWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue_name: &str,
        dead_letter_queue: Option<&str>,
        queue: Arc<dyn QueueClient + Send + Sync>,
        store: Arc<dyn EventStore + Send + Sync>,
        dequeue_timeout: time::Duration,
        backoff_interval: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue_name: queue_name.to_owned(),
            processing_list: format!("{queue_name}:processing:{name}"),
            dead_letter_queue: dead_letter_queue.map(str::to_owned),
            queue,
            store,
            dequeue_timeout,
            backoff_interval,
            liveness,
        }
    }

    pub fn processing_list(&self) -> &str {
        &self.processing_list
    }

    /// Run this worker until `cancel` fires. An item already reserved when that happens is
    /// still fully handled before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "worker {} consuming queue {} via {}",
            self.name, self.queue_name, self.processing_list
        );

        if self.recover_reserved(&cancel).await {
            while let Some(item) = self.wait_for_item(&cancel).await {
                self.handle_item(&item).await;
            }
        }

        info!("worker {} stopped", self.name);
    }

    /// Put back anything a previous run of this worker reserved but never acknowledged.
    /// Returns false if cancelled before the queue could be reached.
    async fn recover_reserved(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self
                .queue
                .recover(&self.processing_list, &self.queue_name)
                .await
            {
                Ok(0) => return true,
                Ok(moved) => {
                    warn!(
                        "requeued {} unacknowledged items from {}",
                        moved, self.processing_list
                    );
                    metrics::counter!("ingest_items_recovered_total").increment(moved as u64);
                    return true;
                }
                Err(e) => {
                    error!("failed to recover reserved items: {}", e);
                    if self.backoff(cancel).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Wait until an item becomes available in our queue. Returns `None` once cancelled.
    async fn wait_for_item(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            self.liveness.report_healthy();

            // If cancellation interrupts a reserve that already moved an item, that item stays in
            // our processing list and is recovered on the next start.
            let reserved = tokio::select! {
                _ = cancel.cancelled() => return None,
                reserved = self.queue.reserve(
                    &self.queue_name,
                    &self.processing_list,
                    self.dequeue_timeout,
                ) => reserved,
            };

            match reserved {
                Ok(Some(item)) => return Some(item),
                Ok(None) => continue,
                Err(e) => {
                    error!("failed to reserve from queue {}: {}", self.queue_name, e);
                    metrics::counter!("ingest_queue_errors_total").increment(1);
                    if self.backoff(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep for the backoff interval. Returns true if cancelled in the meantime.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.backoff_interval) => false,
        }
    }

    /// Process one reserved item and acknowledge it, whatever the outcome.
    async fn handle_item(&self, item: &str) {
        let labels = [("queue", self.queue_name.clone())];
        metrics::counter!("ingest_items_total", &labels).increment(1);

        match self.process_item(item).await {
            Ok(PersistOutcome::Inserted) => {
                metrics::counter!("ingest_events_inserted_total", &labels).increment(1);
            }
            Ok(PersistOutcome::Duplicate) => {
                metrics::counter!("ingest_events_duplicate_total", &labels).increment(1);
            }
            Err(WorkerError::DecodeError(e)) => {
                warn!("dropping malformed queue item: {}", e);
                metrics::counter!("ingest_events_malformed_total", &labels).increment(1);
                self.dead_letter(item).await;
            }
            Err(e) => {
                error!("failed to process event: {}", e);
                metrics::counter!("ingest_events_failed_total", &labels).increment(1);
                self.dead_letter(item).await;
            }
        }

        if let Err(e) = self.queue.ack(&self.processing_list, item).await {
            // Left in the processing list: redelivered on restart, where it is a duplicate.
            error!("failed to acknowledge item: {}", e);
            metrics::counter!("ingest_queue_errors_total").increment(1);
        }
    }

    async fn process_item(&self, item: &str) -> Result<PersistOutcome, WorkerError> {
        let event = Event::decode(item)?;

        let start = tokio::time::Instant::now();
        let outcome = self.store.persist(&event).await?;
        metrics::histogram!("ingest_persist_duration_seconds").record(start.elapsed().as_secs_f64());

        match outcome {
            PersistOutcome::Inserted => info!(
                category = %event.category,
                identifier = %event.identifier,
                "persisted event"
            ),
            PersistOutcome::Duplicate => info!(
                category = %event.category,
                identifier = %event.identifier,
                "dropped duplicate event"
            ),
        }

        Ok(outcome)
    }

    async fn dead_letter(&self, item: &str) {
        let Some(dead_letter_queue) = &self.dead_letter_queue else {
            return;
        };

        match self.queue.push(dead_letter_queue, item.to_owned()).await {
            Ok(()) => {
                metrics::counter!("ingest_items_dead_lettered_total").increment(1);
            }
            Err(e) => error!("failed to dead-letter item, dropping it: {}", e),
        }
    }
}
