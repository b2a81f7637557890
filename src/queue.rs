//! Capacity-bounded hand-off between listeners and workers.
//!
//! Admission is leaky-bucket: when the queue is full a new item is handed
//! back to the caller instead of blocking it. Producers are untrusted network
//! peers, so a listener must never stall waiting for room.
//!
//! The size check and the insert happen under one lock, as do the emptiness
//! check and the removal, so concurrent submitters cannot both see the last
//! free slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{NullObserver, Observer};
use crate::model::WorkItem;
use crate::telemetry::metrics;

/// Longest a waiting worker sleeps before re-checking an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of [`BoundedQueue::try_submit`].
#[derive(Debug)]
pub enum Admission {
    /// Admitted; `depth` is the queue size right after the insert.
    Queued { depth: usize },
    /// Rejected because the queue was full. The item is returned untouched.
    Dropped(Box<WorkItem>),
}

impl Admission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued { .. })
    }
}

/// Thread-safe, fixed-capacity FIFO with drop-on-full admission.
pub struct BoundedQueue {
    items: Mutex<VecDeque<WorkItem>>,
    capacity: AtomicUsize,
    ready: Notify,
    poll_interval: Duration,
    observer: Arc<dyn Observer>,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: AtomicUsize::new(capacity),
            ready: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Change the capacity.
    ///
    /// Only meant for startup, before any traffic. Changing it while items
    /// are flowing is not supported.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        debug!(capacity, "queue capacity set");
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Current number of queued items. May be stale by the time it is read.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Admit `item` if there is room, otherwise hand it back. Never blocks
    /// beyond the internal lock.
    pub fn try_submit(&self, item: WorkItem) -> Admission {
        let capacity = self.capacity();
        let depth = {
            let mut items = self.lock();
            if items.len() >= capacity {
                let depth = items.len();
                drop(items);
                warn!(
                    file_name = item.file_name(),
                    depth, capacity, "queue full, dropping item"
                );
                metrics::items_dropped().add(1, &[]);
                return Admission::Dropped(Box::new(item));
            }
            items.push_back(item);
            items.len()
        };

        self.ready.notify_one();
        metrics::items_queued().add(1, &[]);
        metrics::queue_depth().record(depth as u64, &[]);
        Admission::Queued { depth }
    }

    /// Wait for an item or for `cancel` to fire.
    ///
    /// Returns `None` once cancelled, including when cancellation is already
    /// set on entry. Between empty checks the wait is bounded by the poll
    /// interval, so a missed wakeup costs at most one interval.
    pub async fn take(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            // Register interest before looking, so a submit that lands between
            // the check and the wait still wakes us.
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(item) = self.pop() {
                return Some(item);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = &mut ready => {}
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Non-blocking removal.
    pub fn try_take(&self) -> Option<WorkItem> {
        self.pop()
    }

    fn pop(&self) -> Option<WorkItem> {
        let (item, depth) = {
            let mut items = self.lock();
            let item = items.pop_front()?;
            (item, items.len())
        };

        // Another worker may be waiting on an item we were woken for.
        if depth > 0 {
            self.ready.notify_one();
        }

        let capacity = self.capacity();
        debug!(file_name = item.file_name(), depth, capacity, "item dequeued");
        metrics::queue_depth().record(depth as u64, &[]);
        self.observer.dequeued(depth, capacity);
        Some(item)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        // Nothing panics while holding the lock, but a poisoned queue is
        // still structurally valid.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
