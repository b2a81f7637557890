//! Pipeline observations.
//!
//! The queue, listeners and workers report what happens to items through an
//! [`Observer`] handed to them at construction. Calls are fire-and-forget:
//! the pipeline never waits on, or depends on, delivery.
//!
//! [`EventBus`] is the standard observer. It stamps each observation with a
//! sequence number and publishes it on a broadcast channel so a UI push
//! layer can subscribe without the pipeline knowing it exists.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::WorkerId;

/// Receives pipeline observations. Implementations must not block.
pub trait Observer: Send + Sync + 'static {
    /// An item was admitted; `depth` is the queue size right after insertion.
    fn queued(&self, depth: usize, capacity: usize);

    /// An item was rejected because the queue was full.
    fn dropped(&self, file_name: &str);

    /// A worker finished and stored an item.
    fn processed(&self, file_name: &str, worker: WorkerId);

    /// A worker took an item; `depth` is the queue size right after removal.
    fn dequeued(&self, _depth: usize, _capacity: usize) {}
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn queued(&self, _depth: usize, _capacity: usize) {}
    fn dropped(&self, _file_name: &str) {}
    fn processed(&self, _file_name: &str, _worker: WorkerId) {}
}

/// A structured event published by the [`EventBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Subscribers can detect gaps after lagging.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    QueueUpdated { depth: usize, capacity: usize },
    VideoDropped { file_name: String },
    VideoProcessed { file_name: String, worker: WorkerId },
}

/// Broadcast-backed observer.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl EventBus {
    /// `buffer` is how many events a slow subscriber may fall behind before
    /// it starts missing them.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Observer for EventBus {
    fn queued(&self, depth: usize, capacity: usize) {
        self.publish(EventKind::QueueUpdated { depth, capacity });
    }

    fn dropped(&self, file_name: &str) {
        self.publish(EventKind::VideoDropped {
            file_name: file_name.to_string(),
        });
    }

    fn processed(&self, file_name: &str, worker: WorkerId) {
        self.publish(EventKind::VideoProcessed {
            file_name: file_name.to_string(),
            worker,
        });
    }

    fn dequeued(&self, depth: usize, capacity: usize) {
        self.publish(EventKind::QueueUpdated { depth, capacity });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_events_in_sequence() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.queued(1, 4);
        bus.dropped("late.mp4");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::QueueUpdated { depth: 1, capacity: 4 });
        assert_eq!(
            second.kind,
            EventKind::VideoDropped {
                file_name: "late.mp4".to_string()
            }
        );
        assert!(second.seq > first.seq);
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        bus.processed("a.mp4", WorkerId::new(1).unwrap());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(EventKind::VideoDropped {
            file_name: "x.mp4".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "video_dropped");
        assert_eq!(json["file_name"], "x.mp4");
    }
}
