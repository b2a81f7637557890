//! Storage collaborator.
//!
//! Workers hand each processed item to a [`VideoStore`] together with their
//! own identity. [`DiskStore`] routes every worker to its own subdirectory,
//! so workers never touch the same paths.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::{Catalog, CatalogEntry};
use crate::error::{Error, Result};
use crate::model::{WorkItem, WorkerId};

/// Persists a processed item and reports where it went.
pub trait VideoStore: Send + Sync + 'static {
    fn store(
        &self,
        item: &WorkItem,
        worker: WorkerId,
    ) -> impl Future<Output = Result<PathBuf>> + Send;
}

/// Writes payloads to `<root>/worker-<n>/<id>_<file name>` and records them
/// in a [`Catalog`].
///
/// Bytes go to a `.part` file that is renamed into place once complete, so
/// an interrupted write never leaves a file under the final name.
pub struct DiskStore {
    root: PathBuf,
    catalog: Arc<Catalog>,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>, catalog: Arc<Catalog>) -> Self {
        Self {
            root: root.into(),
            catalog,
        }
    }

    /// Directory owned by `worker`.
    pub fn worker_dir(&self, worker: WorkerId) -> PathBuf {
        self.root.join(format!("worker-{worker}"))
    }
}

impl VideoStore for DiskStore {
    async fn store(&self, item: &WorkItem, worker: WorkerId) -> Result<PathBuf> {
        if let Some(owner) = item.assigned_worker() {
            if owner != worker {
                return Err(Error::Storage(format!(
                    "{} belongs to worker {owner}, not worker {worker}",
                    item.id()
                )));
            }
        }

        let dir = self.worker_dir(worker);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("cannot create {}: {e}", dir.display())))?;

        let name = format!("{}_{}", item.id(), sanitize_file_name(item.file_name()));
        let path = dir.join(&name);
        let partial = dir.join(format!("{name}.part"));
        tokio::fs::write(&partial, &item.payload)
            .await
            .map_err(|e| Error::Storage(format!("cannot write {}: {e}", partial.display())))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| Error::Storage(format!("cannot move {} into place: {e}", path.display())))?;

        self.catalog.record(CatalogEntry {
            id: item.id(),
            metadata: item.metadata.clone(),
            worker,
            received_at: item.received_at,
            processed_at: item.processed_at,
            storage_location: path.clone(),
        });

        debug!(
            work_id = %item.id(),
            worker = worker.get(),
            path = %path.display(),
            bytes = item.payload.len(),
            "video stored"
        );
        Ok(path)
    }
}

/// Reduce a producer-supplied name to a single safe path component.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "video.bin".to_string()
    } else {
        cleaned
    }
}
