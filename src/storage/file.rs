//! File-backed entity store.
//!
//! The whole store is kept in memory and rewritten as a single bincode
//! snapshot after every successful write. The snapshot is written to a
//! temporary file and renamed over the previous one, so a crash leaves either
//! the old or the new state on disk, never a torn file.
//!
//! Writes are serialized by the store's own mutex, which is held for the
//! duration of the flush. No allocator or quota lock is ever held while
//! calling into the store.

use crate::core::error::{WardenError, WardenResult};
use crate::core::now_ms;
use crate::storage::memory::StoreState;
use crate::storage::store::{Collection, EntityStore, Versioned};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Snapshot format version.
const SNAPSHOT_FORMAT: u32 = 1;

/// On-disk snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    format: u32,
    written_at_ms: u64,
    state: StoreState,
}

/// File-backed store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open a store, loading the existing snapshot if there is one.
    pub fn open(path: impl Into<PathBuf>) -> WardenResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WardenError::storage(format!(
                        "failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let state = if path.exists() {
            let state = read_snapshot(&path)?;
            tracing::info!(
                path = %path.display(),
                last_version = state.last_version,
                "loaded store snapshot"
            );
            state
        } else {
            StoreState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, state: &StoreState) -> WardenResult<()> {
        let snapshot = StoreSnapshot {
            format: SNAPSHOT_FORMAT,
            written_at_ms: now_ms(),
            state: state.clone(),
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| WardenError::storage(format!("failed to encode snapshot: {}", e)))?;

        let tmp_path = self.path.with_extension("tmp");
        let io_err = |what: &str, e: std::io::Error| {
            WardenError::storage(format!("failed to {} {}: {}", what, tmp_path.display(), e))
        };

        let file = std::fs::File::create(&tmp_path).map_err(|e| io_err("create", e))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes).map_err(|e| io_err("write", e))?;
        writer.flush().map_err(|e| io_err("flush", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| io_err("sync", e))?;
        drop(writer);

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            WardenError::storage(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

fn read_snapshot(path: &Path) -> WardenResult<StoreState> {
    let file = std::fs::File::open(path)
        .map_err(|e| WardenError::storage(format!("failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| WardenError::storage(format!("failed to read {}: {}", path.display(), e)))?;

    let snapshot: StoreSnapshot = bincode::deserialize(&bytes)
        .map_err(|e| WardenError::storage(format!("corrupt snapshot {}: {}", path.display(), e)))?;
    if snapshot.format != SNAPSHOT_FORMAT {
        return Err(WardenError::storage(format!(
            "unsupported snapshot format {} in {}",
            snapshot.format,
            path.display()
        )));
    }
    Ok(snapshot.state)
}

impl EntityStore for FileStore {
    fn get(&self, collection: Collection, key: &str) -> WardenResult<Option<Versioned>> {
        Ok(self.state.lock().get(collection, key))
    }

    fn list(&self, collection: Collection) -> WardenResult<Vec<(String, Versioned)>> {
        Ok(self.state.lock().list(collection))
    }

    fn compare_and_swap(
        &self,
        collection: Collection,
        key: &str,
        expected: Option<u64>,
        value: Option<Vec<u8>>,
    ) -> WardenResult<u64> {
        let mut state = self.state.lock();
        let (version, undo) = state.compare_and_swap(collection, key, expected, value)?;

        if let Err(e) = self.flush(&state) {
            state.undo(undo);
            tracing::warn!(
                collection = %collection,
                key = key,
                error = %e,
                "store flush failed, write reverted"
            );
            return Err(e);
        }
        Ok(version)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
