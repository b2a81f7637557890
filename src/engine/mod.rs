//! Pipeline engine: ingestion listeners, worker pool, lifecycle control.

pub mod control;
pub mod listener;
pub mod worker;

pub use control::{Pipeline, PipelineHandle};
pub use listener::{IngestContext, IngestListener};
pub use worker::{Processor, WorkerPool};
