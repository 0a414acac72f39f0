//! Snapshot blob sinks.
//!
//! Every compression persists its snapshot as a standalone JSON document so
//! a run's memory can be inspected without the database. Blobs are write-once:
//! the file sink opens with create-new semantics and refuses to overwrite.
//!
//! Layout: `<dir>/<run_id>/<timestamp>-v<version>.json`

use async_trait::async_trait;
use distillery_core::error::StoreError;
use distillery_core::memory::Snapshot;
use distillery_core::store::SnapshotSink;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Writes snapshots as pretty JSON files under a root directory.
pub struct FileSnapshotSink {
    root: PathBuf,
}

impl FileSnapshotSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, snapshot: &Snapshot) -> PathBuf {
        let stamp = snapshot.timestamp.format("%Y%m%dT%H%M%S%.6fZ");
        self.root
            .join(snapshot.run_id.as_str())
            .join(format!("{stamp}-v{:04}.json", snapshot.version))
    }
}

#[async_trait]
impl SnapshotSink for FileSnapshotSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<String, StoreError> {
        let path = self.path_for(snapshot);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Blob(format!("Failed to create {}: {e}", parent.display())))?;
        }

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StoreError::Blob(format!("Snapshot serialization: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => {
                    StoreError::Blob(format!("Snapshot {} already exists", path.display()))
                }
                _ => StoreError::Blob(format!("Failed to open {}: {e}", path.display())),
            })?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::Blob(format!("Failed to write {}: {e}", path.display())))?;

        debug!(path = %path.display(), version = snapshot.version, "Snapshot written");
        Ok(path.display().to_string())
    }

    async fn read(&self, location: &str) -> Result<Option<Snapshot>, StoreError> {
        let content = match std::fs::read_to_string(location) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Blob(format!("Failed to read {location}: {e}"))),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Blob(format!("Corrupt snapshot {location}: {e}")))
    }

    async fn discard(&self, location: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(location) {
            Ok(()) => {
                warn!(path = location, "Discarded snapshot of rejected commit");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Blob(format!("Failed to remove {location}: {e}"))),
        }
    }
}

/// Keeps snapshot blobs in a map keyed by `mem://<run_id>/v<version>`.
pub struct InMemorySnapshotSink {
    blobs: Arc<RwLock<BTreeMap<String, Snapshot>>>,
}

impl InMemorySnapshotSink {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

impl Default for InMemorySnapshotSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotSink for InMemorySnapshotSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<String, StoreError> {
        let location = format!("mem://{}/v{:04}", snapshot.run_id, snapshot.version);
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(&location) {
            return Err(StoreError::Blob(format!("Snapshot {location} already exists")));
        }
        blobs.insert(location.clone(), snapshot.clone());
        Ok(location)
    }

    async fn read(&self, location: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.blobs.read().await.get(location).cloned())
    }

    async fn discard(&self, location: &str) -> Result<(), StoreError> {
        self.blobs.write().await.remove(location);
        Ok(())
    }
}
