//! Core data model.
//!
//! A work item is one ingested video: producer-supplied metadata, the raw
//! payload, and the bookkeeping the pipeline adds as it moves from listener
//! to queue to worker to storage.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of ingested video.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Unique identifier, assigned at creation.
    id: WorkId,

    /// Producer-supplied description. Opaque to the pipeline.
    pub metadata: VideoMetadata,

    /// Raw bytes, exactly as framed on the wire.
    pub payload: Vec<u8>,

    /// Worker slot that dequeued this item. Set once, by the pool.
    assigned_worker: Option<WorkerId>,

    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,

    /// Where the storage collaborator put the bytes.
    pub storage_location: Option<PathBuf>,
}

impl WorkItem {
    /// Build a freshly received item with a new id and `received_at = now`.
    pub fn new(metadata: VideoMetadata, payload: Vec<u8>) -> Self {
        Self {
            id: WorkId::new(),
            metadata,
            payload,
            assigned_worker: None,
            received_at: Utc::now(),
            processed_at: None,
            storage_location: None,
        }
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn file_name(&self) -> &str {
        &self.metadata.file_name
    }

    pub fn assigned_worker(&self) -> Option<WorkerId> {
        self.assigned_worker
    }

    /// Record which worker owns this item.
    ///
    /// Ownership moves from queue to worker exactly once; a second call with a
    /// different worker is ignored and returns `false`.
    #[must_use]
    pub fn assign_worker(&mut self, worker: WorkerId) -> bool {
        match self.assigned_worker {
            None => {
                self.assigned_worker = Some(worker);
                true
            }
            Some(existing) => existing == worker,
        }
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Stable 1-based identity of a worker slot.
///
/// Slot `n` owns listening port `base_port + n - 1` and storage
/// subdirectory `worker-n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Returns `None` for 0; slots are numbered from 1.
    pub fn new(n: u32) -> Option<Self> {
        (n >= 1).then_some(Self(n))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Zero-based offset from the base port.
    pub fn offset(self) -> u32 {
        self.0 - 1
    }

    /// All slots `1..=count`.
    pub fn all(count: u32) -> impl Iterator<Item = WorkerId> {
        (1..=count).map(WorkerId)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Metadata block of a frame, serialized as JSON.
///
/// Keys are PascalCase on the wire; camelCase is accepted on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VideoMetadata {
    #[serde(alias = "fileName")]
    pub file_name: String,
    #[serde(alias = "fileSize")]
    pub file_size: i64,
    #[serde(alias = "contentType")]
    pub content_type: String,
    #[serde(alias = "timestamp", alias = "capturedAt", deserialize_with = "utc_or_naive")]
    pub timestamp: DateTime<Utc>,
}

/// RFC 3339 timestamps, or timestamps without an offset which are taken as
/// UTC.
fn utc_or_naive<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}
