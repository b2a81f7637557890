//! Worker pool: drain the queue, process, persist.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::error::{Error, Result};
use crate::event::Observer;
use crate::model::{WorkId, WorkItem, WorkerId};
use crate::queue::BoundedQueue;
use crate::storage::VideoStore;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_item_span};

/// Default time an in-progress store may keep running after cancellation.
pub const DEFAULT_STORE_GRACE: Duration = Duration::from_secs(5);

/// Stand-in for transcoding/validation: rejects empty payloads, then waits a
/// per-item latency so bursts build real backlog.
#[derive(Debug, Clone)]
pub struct Processor {
    delay: Duration,
    jitter: Duration,
}

impl Processor {
    pub fn new(delay: Duration, jitter: Duration) -> Self {
        Self { delay, jitter }
    }

    /// `delay` plus a share of `jitter` derived from the item id, so the same
    /// item always costs the same and different items spread out.
    pub fn latency_for(&self, id: WorkId) -> Duration {
        let jitter_nanos = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        if jitter_nanos == 0 {
            return self.delay;
        }
        let (high, _) = id.0.as_u64_pair();
        self.delay + Duration::from_nanos(high % jitter_nanos)
    }

    /// Run the processing step, giving up as soon as `cancel` fires.
    pub async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<Duration> {
        if item.payload.is_empty() {
            return Err(Error::Processing(format!(
                "{} has an empty payload",
                item.file_name()
            )));
        }

        let latency = self.latency_for(item.id());
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(latency) => Ok(latency),
        }
    }
}

/// Fixed set of long-lived workers sharing one queue.
pub struct WorkerPool<S> {
    queue: Arc<BoundedQueue>,
    store: Arc<S>,
    observer: Arc<dyn Observer>,
    processor: Processor,
    worker_count: u32,
    store_grace: Duration,
}

impl<S: VideoStore> WorkerPool<S> {
    pub fn new(
        queue: Arc<BoundedQueue>,
        store: Arc<S>,
        observer: Arc<dyn Observer>,
        processor: Processor,
        worker_count: u32,
    ) -> Self {
        Self {
            queue,
            store,
            observer,
            processor,
            worker_count,
            store_grace: DEFAULT_STORE_GRACE,
        }
    }

    /// Bound on how long shutdown waits for a store that is already running.
    pub fn with_store_grace(mut self, grace: Duration) -> Self {
        self.store_grace = grace;
        self
    }

    /// Start one task per worker slot. Each runs until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: &CancellationToken) -> Vec<(WorkerId, JoinHandle<()>)> {
        WorkerId::all(self.worker_count)
            .map(|worker| {
                let pool = Arc::clone(&self);
                let cancel = cancel.clone();
                let handle = tokio::spawn(async move { pool.run_worker(worker, cancel).await });
                (worker, handle)
            })
            .collect()
    }

    /// One worker's loop. Returns once the queue reports cancellation or an
    /// in-flight item is abandoned on shutdown.
    pub async fn run_worker(&self, worker: WorkerId, cancel: CancellationToken) {
        info!(worker = worker.get(), "worker started");

        while let Some(mut item) = self.queue.take(&cancel).await {
            let owned = item.assign_worker(worker);
            debug_assert!(owned, "dequeued item already owned by another worker");

            let span = start_item_span(item.file_name(), item.id(), worker);
            let started = Instant::now();
            let result = self
                .handle(worker, &mut item, &cancel)
                .instrument(span.clone())
                .await;
            let labels = [KeyValue::new("worker", i64::from(worker.get()))];

            match result {
                Ok(()) => {
                    record_state_transition(&span, "storing", "stored");
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    metrics::items_processed().add(1, &labels);
                    metrics::processing_duration_ms().record(elapsed_ms, &labels);
                    info!(
                        worker = worker.get(),
                        file_name = item.file_name(),
                        work_id = %item.id(),
                        elapsed_ms,
                        "video processed"
                    );
                    self.observer.processed(item.file_name(), worker);
                }
                Err(Error::Cancelled) => {
                    record_state_transition(&span, "processing", "abandoned");
                    warn!(
                        worker = worker.get(),
                        file_name = item.file_name(),
                        "shutdown while processing, item abandoned"
                    );
                    break;
                }
                Err(e) => {
                    let stage = match e {
                        Error::Storage(_) => "store",
                        _ => "process",
                    };
                    record_state_transition(&span, stage, "failed");
                    metrics::items_failed().add(
                        1,
                        &[labels[0].clone(), KeyValue::new("stage", stage)],
                    );
                    error!(
                        worker = worker.get(),
                        file_name = item.file_name(),
                        work_id = %item.id(),
                        stage,
                        error = %e,
                        "item lost"
                    );
                }
            }
        }

        info!(worker = worker.get(), "worker stopped");
    }

    async fn handle(
        &self,
        worker: WorkerId,
        item: &mut WorkItem,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let span = tracing::Span::current();

        record_state_transition(&span, "queued", "processing");
        self.processor.process(item, cancel).await?;
        item.processed_at = Some(Utc::now());

        record_state_transition(&span, "processing", "storing");
        let location = self.store_or_cancel(item, worker, cancel).await?;
        item.storage_location = Some(location);
        Ok(())
    }

    /// Run the store, letting it finish within `store_grace` once `cancel`
    /// fires. A store that outlives the grace is abandoned.
    async fn store_or_cancel(
        &self,
        item: &WorkItem,
        worker: WorkerId,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let store = self.store.store(item, worker);
        tokio::pin!(store);

        tokio::select! {
            biased;
            stored = &mut store => stored,
            () = cancel.cancelled() => {
                match tokio::time::timeout(self.store_grace, &mut store).await {
                    Ok(stored) => stored,
                    Err(_) => {
                        warn!(
                            worker = worker.get(),
                            file_name = item.file_name(),
                            grace_ms = self.store_grace.as_millis() as u64,
                            "store did not finish within shutdown grace"
                        );
                        Err(Error::Cancelled)
                    }
                }
            }
        }
    }
}
