//! Lifecycle controller: bind listeners, start workers, cancel and join.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{NullObserver, Observer};
use crate::model::WorkerId;
use crate::queue::BoundedQueue;
use crate::storage::VideoStore;

use super::listener::{IngestContext, IngestListener};
use super::worker::{Processor, WorkerPool};

/// A configured but not yet started pipeline.
pub struct Pipeline<S> {
    config: Config,
    store: Arc<S>,
    observer: Arc<dyn Observer>,
}

impl<S: VideoStore> Pipeline<S> {
    pub fn new(config: Config, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate the configuration, bind every listener, then start workers
    /// and accept loops.
    ///
    /// Nothing is spawned unless every port binds; on a bind failure the
    /// ports bound so far are released.
    pub async fn start(self) -> Result<PipelineHandle> {
        self.config.validate()?;

        let config = self.config;
        let queue = Arc::new(
            BoundedQueue::new(config.queue_capacity)
                .with_poll_interval(config.poll_interval)
                .with_observer(Arc::clone(&self.observer)),
        );

        let ctx = IngestContext {
            queue: Arc::clone(&queue),
            observer: Arc::clone(&self.observer),
            limits: config.limits,
            read_timeout: config.read_timeout,
        };

        let mut listeners = Vec::with_capacity(config.worker_count as usize);
        for worker in WorkerId::all(config.worker_count) {
            let listener = IngestListener::bind(worker, config.listen_addr(worker), ctx.clone()).await?;
            listeners.push(listener);
        }

        let mut listen_addrs = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            listen_addrs.push((listener.worker(), listener.local_addr()?));
        }

        let cancel = CancellationToken::new();

        let pool = Arc::new(
            WorkerPool::new(
                Arc::clone(&queue),
                self.store,
                self.observer,
                Processor::new(config.processing_delay, config.processing_jitter),
                config.worker_count,
            )
            .with_store_grace(config.store_grace),
        );
        let workers = pool.spawn(&cancel);

        let listener_tasks = listeners
            .into_iter()
            .map(|listener| {
                let worker = listener.worker();
                let cancel = cancel.clone();
                (worker, tokio::spawn(listener.run(cancel)))
            })
            .collect();

        let ports: Vec<u16> = listen_addrs.iter().map(|(_, addr)| addr.port()).collect();
        info!(
            workers = config.worker_count,
            capacity = config.queue_capacity,
            ?ports,
            "pipeline started"
        );

        Ok(PipelineHandle {
            cancel,
            queue,
            listen_addrs,
            workers,
            listeners: listener_tasks,
        })
    }
}

/// A running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    queue: Arc<BoundedQueue>,
    listen_addrs: Vec<(WorkerId, SocketAddr)>,
    workers: Vec<(WorkerId, JoinHandle<()>)>,
    listeners: Vec<(WorkerId, JoinHandle<()>)>,
}

impl PipelineHandle {
    /// Bound address of each worker slot's listener.
    pub fn listen_addrs(&self) -> &[(WorkerId, SocketAddr)] {
        &self.listen_addrs
    }

    pub fn listen_addr(&self, worker: WorkerId) -> Option<SocketAddr> {
        self.listen_addrs
            .iter()
            .find(|(w, _)| *w == worker)
            .map(|(_, addr)| *addr)
    }

    pub fn queue(&self) -> &Arc<BoundedQueue> {
        &self.queue
    }

    /// A clone of the shared cancel signal, e.g. for a Ctrl-C handler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fire the cancel signal. Idempotent.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("pipeline shutdown requested");
        }
        self.cancel.cancel();
    }

    /// Wait for every listener and worker to exit.
    ///
    /// Does not fire the signal itself; call [`shutdown`](Self::shutdown)
    /// first or cancel the token from elsewhere.
    pub async fn join(self) -> Result<()> {
        let mut failed = 0usize;

        for (worker, handle) in self.listeners.into_iter().chain(self.workers) {
            if let Err(e) = handle.await {
                failed += 1;
                error!(worker = worker.get(), error = %e, "pipeline task panicked");
            }
        }

        let left = self.queue.size();
        if left > 0 {
            warn!(left, "queued items discarded at shutdown");
        }
        info!("pipeline stopped");

        if failed > 0 {
            return Err(Error::Other(format!("{failed} pipeline task(s) panicked")));
        }
        Ok(())
    }

    /// [`shutdown`](Self::shutdown) then [`join`](Self::join).
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}
