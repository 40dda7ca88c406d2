// # File State Store
//
// File-based implementation of StateStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: write to `<file>.tmp`, then rename
// - Backup: the previous good file is copied to `<file>.backup` before each rename
// - Corruption: an unparsable file falls back to the backup, then to empty state
//
// An empty state only costs one redundant DNS push on the next tick, so
// recovery never refuses to start.
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "entries": {
//     "ip": { "value": "203.0.113.9", "updated_at": "2025-01-09T12:00:00Z" }
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::state_store::{StateEntry, StateStore};

/// State file format version
const STATE_FILE_VERSION: &str = "1.0";

/// File-based state store with crash recovery
///
/// Every mutation is written through immediately.
///
/// # Example
///
/// ```rust,no_run
/// use dcron_core::state::FileStateStore;
/// use dcron_core::traits::StateStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileStateStore::new("engine-private/cron-state.json").await?;
///     store.set("ip", "203.0.113.9").await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
}

#[derive(Debug)]
struct FileState {
    entries: BTreeMap<String, StateEntry>,
    dirty: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StateFileFormat {
    version: String,
    entries: BTreeMap<String, StateEntry>,
}

/// Why a state file could not be loaded
enum LoadError {
    /// File exists but is not a valid state document
    Corrupt(String),
    /// File could not be read
    Io(Error),
}

impl FileStateStore {
    /// Create or load a file state store
    ///
    /// Creates parent directories as needed.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let entries = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState {
                entries,
                dirty: false,
            })),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_with_recovery(path: &Path) -> Result<BTreeMap<String, StateEntry>, Error> {
        match Self::load(path).await {
            Ok(entries) => {
                tracing::debug!("Loaded state from {}: {} entries", path.display(), entries.len());
                Ok(entries)
            }
            Err(LoadError::Io(e)) => Err(e),
            Err(LoadError::Corrupt(reason)) => {
                tracing::warn!(
                    "State file {} appears corrupted: {}. Attempting recovery from backup.",
                    path.display(),
                    reason
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with empty state.");
                    return Ok(BTreeMap::new());
                }

                match Self::load(&backup_path).await {
                    Ok(entries) => {
                        tracing::info!("Recovered state from backup: {} entries", entries.len());
                        if let Err(e) = fs::copy(&backup_path, path).await {
                            tracing::error!("Failed to restore state file from backup: {}", e);
                        }
                        Ok(entries)
                    }
                    Err(_) => {
                        tracing::error!("Backup also unreadable. Starting with empty state.");
                        Ok(BTreeMap::new())
                    }
                }
            }
        }
    }

    async fn load(path: &Path) -> Result<BTreeMap<String, StateEntry>, LoadError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            LoadError::Io(Error::state_store(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            )))
        })?;

        let state_file: StateFileFormat =
            serde_json::from_str(&content).map_err(|e| LoadError::Corrupt(e.to_string()))?;

        if state_file.version != STATE_FILE_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. Loading anyway.",
                STATE_FILE_VERSION,
                state_file.version
            );
        }

        Ok(state_file.entries)
    }

    /// Write state to file atomically
    async fn write_state(&self) -> Result<(), Error> {
        let json = {
            let guard = self.state.read().await;
            let state_file = StateFileFormat {
                version: STATE_FILE_VERSION.to_string(),
                entries: guard.entries.clone(),
            };
            serde_json::to_string_pretty(&state_file)
                .map_err(|e| Error::state_store(format!("Failed to serialize state: {}", e)))?
        };

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.sync_all().await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await
        {
            tracing::warn!("Failed to create state backup: {}", e);
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.state.write().await.dirty = false;

        tracing::trace!("State written to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>, Error> {
        let guard = self.state.read().await;
        Ok(guard.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            guard.entries.insert(key.to_string(), StateEntry::new(value));
            guard.dirty = true;
        }
        self.write_state().await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            if guard.entries.remove(key).is_none() {
                return Ok(());
            }
            guard.dirty = true;
        }
        self.write_state().await
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        let guard = self.state.read().await;
        Ok(guard.entries.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        let dirty = self.state.read().await.dirty;
        if dirty {
            self.write_state().await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cron-state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());

        store.set("ip", "203.0.113.9").await.unwrap();
        assert!(path.exists());

        let reopened = FileStateStore::new(&path).await.unwrap();
        assert_eq!(
            reopened.get_value("ip").await.unwrap(),
            Some("203.0.113.9".to_string())
        );
    }

    #[tokio::test]
    async fn test_file_store_corruption_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cron-state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        store.set("ip", "203.0.113.5").await.unwrap();
        // Second write moves the first one into the backup
        store.set("ip", "203.0.113.9").await.unwrap();

        fs::write(&path, b"corrupted json data").await.unwrap();

        let recovered = FileStateStore::new(&path).await.unwrap();
        assert_eq!(
            recovered.get_value("ip").await.unwrap(),
            Some("203.0.113.5".to_string()),
            "Backup holds the state before the last write"
        );
    }

    #[tokio::test]
    async fn test_file_store_corruption_without_backup_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cron-state.json");
        fs::write(&path, b"{ not json").await.unwrap();

        let store = FileStateStore::new(&path).await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_key_does_not_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cron-state.json");

        let store = FileStateStore::new(&path).await.unwrap();
        store.delete("monitor-input").await.unwrap();
        assert!(!path.exists());
    }
}
