//! Item processing span helpers.

use tracing::Span;

use crate::model::{WorkId, WorkerId};

/// Start a span covering one item's time inside a worker.
///
/// The `item.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_item_span(file_name: &str, work_id: WorkId, worker: WorkerId) -> Span {
    tracing::info_span!(
        "item.process",
        "item.file_name" = file_name,
        "item.id" = %work_id,
        "item.worker" = worker.get(),
        "item.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("item.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
