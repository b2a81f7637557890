//! # vidq
//!
//! Video ingestion pipeline. Producers push one length-prefixed frame per
//! TCP connection; frames are admitted to a capacity-bounded queue (dropped
//! when full) and drained by a fixed pool of workers that process and store
//! each video under a per-worker directory.

pub mod catalog;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod storage;
pub mod telemetry;
