//! Metric instrument factories for vidq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"vidq"` meter. Without an
//! OTLP endpoint the global provider is a no-op, so recording is free.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Returns the shared meter for vidq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("vidq")
}

/// Counter: items admitted to the queue.
pub fn items_queued() -> Counter<u64> {
    meter()
        .u64_counter("vidq.items.queued")
        .with_description("Items admitted to the queue")
        .build()
}

/// Counter: items rejected because the queue was full.
pub fn items_dropped() -> Counter<u64> {
    meter()
        .u64_counter("vidq.items.dropped")
        .with_description("Items dropped by leaky-bucket admission")
        .build()
}

/// Counter: items processed and stored.
/// Labels: `worker`.
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("vidq.items.processed")
        .with_description("Items processed and stored")
        .build()
}

/// Counter: items lost to a processing or storage failure.
/// Labels: `worker`, `stage` ("process" | "store").
pub fn items_failed() -> Counter<u64> {
    meter()
        .u64_counter("vidq.items.failed")
        .with_description("Items lost to processing or storage failures")
        .build()
}

/// Counter: accepted producer connections.
/// Labels: `worker`.
pub fn connections_accepted() -> Counter<u64> {
    meter()
        .u64_counter("vidq.connections.accepted")
        .with_description("Accepted producer connections")
        .build()
}

/// Counter: frames that failed to decode.
/// Labels: `worker`.
pub fn decode_errors() -> Counter<u64> {
    meter()
        .u64_counter("vidq.decode.errors")
        .with_description("Frames that failed to decode")
        .build()
}

/// Gauge: queue depth after the most recent insert or removal.
pub fn queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("vidq.queue.depth")
        .with_description("Current queue depth")
        .build()
}

/// Histogram: time from dequeue to stored, in milliseconds.
/// Labels: `worker`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("vidq.processing.duration_ms")
        .with_description("Processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
