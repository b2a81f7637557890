//! In-memory catalog of stored videos.
//!
//! Populated by the storage layer after a successful write. Dropped and
//! failed items never appear here. Contents are lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{VideoMetadata, WorkId, WorkerId};

/// What the catalog remembers about a stored video. The payload itself lives
/// at `storage_location`.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub id: WorkId,
    pub metadata: VideoMetadata,
    pub worker: WorkerId,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub storage_location: PathBuf,
}

#[derive(Debug, Default)]
pub struct Catalog {
    entries: RwLock<HashMap<WorkId, CatalogEntry>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: CatalogEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.id, entry);
    }

    pub fn get(&self, id: WorkId) -> Option<CatalogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, oldest arrival first.
    pub fn list(&self) -> Vec<CatalogEntry> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|e| e.received_at);
        all
    }

    /// Entries grouped by the worker slot that processed them.
    pub fn by_worker(&self) -> BTreeMap<WorkerId, Vec<CatalogEntry>> {
        let mut grouped: BTreeMap<WorkerId, Vec<CatalogEntry>> = BTreeMap::new();
        for entry in self.list() {
            grouped.entry(entry.worker).or_default().push(entry);
        }
        grouped
    }

    /// Read a stored video's bytes back from disk.
    pub async fn read_bytes(&self, id: WorkId) -> Result<Vec<u8>> {
        let entry = self
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        tokio::fs::read(&entry.storage_location)
            .await
            .map_err(|e| {
                Error::Storage(format!(
                    "cannot read {}: {e}",
                    entry.storage_location.display()
                ))
            })
    }
}
